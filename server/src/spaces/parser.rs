//! Per-connection ingress state machine.
//!
//! A parser task owns one connection's inbound frames from the moment
//! the subscribe handshake completes until the transport closes.
//! Disconnect is an ordinary terminal transition, not an exception:
//! every exit funnels through [`ConnectionParser::finish`], which is the
//! only cleanup path.

use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::WsError;
use crate::events::{parse_client_event, ChatMessageData, ClientEvent, SpaceEvent, UserEvent};
use crate::handlers::{CommandRequest, MessageHandler};
use crate::media::MediaKind;
use crate::models::Position;
use crate::router::SpaceRouter;
use crate::spaces::{SpaceBroadcaster, SpaceUpdate};
use crate::store::Store;

pub struct ConnectionParser {
    broadcaster: Arc<SpaceBroadcaster>,
    conn: Arc<Connection>,
    store: Arc<dyn Store>,
    router: Arc<SpaceRouter>,
    handler: MessageHandler,
    user_id: Option<Uuid>,
}

impl ConnectionParser {
    /// Spawn the parser task for a freshly subscribed connection.
    pub fn spawn(
        broadcaster: Arc<SpaceBroadcaster>,
        conn: Arc<Connection>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let store = broadcaster.store();
        let router = broadcaster.router();
        let handler = MessageHandler::new(store.clone(), router.clone());
        let parser = Self {
            broadcaster,
            conn,
            store,
            router,
            handler,
            user_id: None,
        };
        tokio::spawn(parser.run(inbound))
    }

    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<String>) {
        loop {
            let closed_token = self.conn.closed_token();
            let frame = tokio::select! {
                _ = closed_token.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            self.conn.touch();
            if let ControlFlow::Break(()) = self.handle_frame(&frame).await {
                break;
            }
        }
        self.finish().await;
    }

    async fn handle_frame(&mut self, frame: &str) -> ControlFlow<()> {
        let value: serde_json::Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(_) => {
                self.conn.send_error("Invalid JSON frame");
                return ControlFlow::Continue(());
            }
        };

        // Request-reply envelopes use `type`; streaming events use
        // `event`.
        if value.get("event").is_none() && value.get("type").is_some() {
            self.handle_command(value).await;
            return ControlFlow::Continue(());
        }

        match parse_client_event(frame) {
            Ok(event) => self.dispatch(event).await,
            Err(err) => {
                self.conn.send_error(err.client_message());
                ControlFlow::Continue(())
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> ControlFlow<()> {
        match event {
            ClientEvent::Subscribe { .. } => {
                self.conn.send_error("already subscribed to a space");
            }
            ClientEvent::Join {
                user_id,
                space_id,
                position,
            } => return self.on_join(user_id, space_id, position).await,
            ClientEvent::PositionMove {
                nx,
                ny,
                direction,
                is_moving,
                ..
            } => self.on_position_move(nx, ny, direction, is_moving),
            ClientEvent::SendChatMessage { data } => self.on_chat(data, true).await,
            ClientEvent::SendPrivateMessage { data } => self.on_chat(data, false).await,
            ClientEvent::WebrtcSignal {
                signal_type,
                to_user_id,
                data,
            } => self.on_signal(signal_type, to_user_id, data),
            ClientEvent::StartAudioStream { metadata } => {
                self.on_start_stream(MediaKind::Audio, metadata)
            }
            ClientEvent::StopAudioStream => self.on_stop_stream(MediaKind::Audio),
            ClientEvent::MuteAudio => self.on_audio_mute(true),
            ClientEvent::UnmuteAudio => self.on_audio_mute(false),
            ClientEvent::StartVideoStream { metadata } => {
                self.on_start_stream(MediaKind::Video, metadata)
            }
            ClientEvent::StopVideoStream => self.on_stop_stream(MediaKind::Video),
            ClientEvent::StartScreenStream { metadata } => {
                self.on_start_stream(MediaKind::Screen, metadata)
            }
            ClientEvent::StopScreenStream => self.on_stop_stream(MediaKind::Screen),
            ClientEvent::Left => {
                info!(conn = %self.conn.id(), "client left");
                return ControlFlow::Break(());
            }
            ClientEvent::Unknown => {
                self.conn.send_error("unknown event");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_join(
        &mut self,
        user_id: Option<Uuid>,
        space_id: Option<Uuid>,
        position: Option<Position>,
    ) -> ControlFlow<()> {
        let (Some(user_id), Some(space_id)) = (user_id, space_id) else {
            self.conn.send_error("Invalid join message");
            return ControlFlow::Continue(());
        };

        if self.user_id.is_some() {
            self.conn.send_error("already joined");
            return ControlFlow::Continue(());
        }

        if space_id != self.broadcaster.space_id() {
            self.conn.send_error("Mismatched space_id");
            self.conn.close();
            return ControlFlow::Break(());
        }

        let user = match self.store.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.conn.send_error("User not found");
                self.conn.close();
                return ControlFlow::Break(());
            }
            Err(err) => {
                self.conn.send_error(err.client_message());
                return ControlFlow::Continue(());
            }
        };

        self.router.bind_user(user_id, self.conn.clone());
        self.conn.set_session(Some(user_id), Some(space_id), true);

        let map_id = self.broadcaster.ensure_map_id().await;
        let spawn_at = position.unwrap_or_default();

        let snapshot = user.snapshot();
        let (users, positions) = {
            let mut presence = self.broadcaster.presence().lock();
            presence.insert_at(snapshot.clone(), spawn_at);
            (presence.users_snapshot(), presence.positions_snapshot())
        };
        let media_info = self.broadcaster.media().space_media_info();

        // The joining connection gets the full space state before anyone
        // else learns of the join; the broadcast excludes this
        // connection.
        if let Err(err) = self.conn.send_event(&UserEvent::SpaceState {
            space_id,
            map_id,
            users,
            positions,
            media_info,
        }) {
            warn!(conn = %self.conn.id(), error = %err, "failed to send space_state");
            return ControlFlow::Break(());
        }

        let update = SpaceUpdate::excluding(
            SpaceEvent::UserJoined {
                user_id,
                space_id,
                user_data: snapshot,
                x: spawn_at.x,
                y: spawn_at.y,
            },
            self.conn.id(),
        );
        if let Err(err) = self.broadcaster.enqueue(update) {
            warn!(space = %space_id, error = %err, "failed to announce join");
        }

        self.user_id = Some(user_id);
        info!(user = %user_id, space = %space_id, "user joined");
        ControlFlow::Continue(())
    }

    fn on_position_move(
        &mut self,
        nx: f64,
        ny: f64,
        direction: Option<String>,
        is_moving: bool,
    ) {
        let Some(user_id) = self.user_id else {
            self.conn.send_error("Invalid message");
            return;
        };
        let space_id = self.broadcaster.space_id();

        let _ = self.conn.send_event(&UserEvent::PositionMoveAck {
            user_id,
            space_id,
            nx,
            ny,
        });

        self.broadcaster
            .presence()
            .lock()
            .set_position(user_id, Position { x: nx, y: ny });

        let update = SpaceUpdate::new(SpaceEvent::PositionUpdate {
            user_id,
            space_id,
            nx,
            ny,
            direction: direction.unwrap_or_else(|| "down".to_string()),
            is_moving,
        });
        if let Err(err) = self.broadcaster.enqueue(update) {
            warn!(space = %space_id, error = %err, "failed to enqueue position update");
        }
    }

    async fn on_chat(&mut self, mut data: ChatMessageData, space_kind: bool) {
        let Some(user_id) = self.user_id else {
            self.conn.send_error("Invalid message");
            return;
        };
        data.sender_id = Some(user_id);

        let result = if space_kind {
            self.broadcaster
                .chat()
                .handle_space_message(data, self.broadcaster.space_id())
                .await
        } else {
            self.broadcaster.chat().handle_private_message(data).await
        };

        if let Err(err) = result {
            self.conn.send_error(err.client_message());
        }
    }

    fn on_signal(
        &mut self,
        signal_type: Option<crate::events::SignalType>,
        to_user_id: Option<Uuid>,
        data: serde_json::Value,
    ) {
        let Some(user_id) = self.user_id else {
            self.conn.send_error("Invalid message");
            return;
        };
        let (Some(signal_type), Some(to_user_id)) = (signal_type, to_user_id) else {
            self.conn.send_error("Invalid WebRTC signal");
            return;
        };

        if let Err(err) = self
            .broadcaster
            .media()
            .relay_signal(signal_type, user_id, to_user_id, data)
        {
            self.conn.send_error(err.client_message());
        }
    }

    fn on_start_stream(&mut self, kind: MediaKind, metadata: Option<serde_json::Value>) {
        let Some(user_id) = self.user_id else {
            self.conn.send_error("Invalid message");
            return;
        };
        if let Err(err) = self.broadcaster.media().start_stream(kind, user_id, metadata) {
            self.conn.send_error(err.client_message());
        }
    }

    fn on_stop_stream(&mut self, kind: MediaKind) {
        let Some(user_id) = self.user_id else {
            self.conn.send_error("Invalid message");
            return;
        };
        if let Err(err) = self.broadcaster.media().stop_stream(kind, user_id) {
            self.conn.send_error(err.client_message());
        }
    }

    fn on_audio_mute(&mut self, mute: bool) {
        let Some(user_id) = self.user_id else {
            self.conn.send_error("Invalid message");
            return;
        };
        let result = if mute {
            self.broadcaster.media().mute_audio(user_id)
        } else {
            self.broadcaster.media().unmute_audio(user_id)
        };
        if let Err(err) = result {
            self.conn.send_error(err.client_message());
        }
    }

    async fn handle_command(&mut self, value: serde_json::Value) {
        let request: CommandRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(_) => {
                self.conn.send_error("Invalid command envelope");
                return;
            }
        };

        let outcome = self
            .handler
            .handle(&self.conn, &self.broadcaster, request)
            .await;

        if let Ok(reply) = serde_json::to_string(&outcome.response) {
            let _ = self.conn.send_text(reply);
        }

        if let Some(update) = outcome.space_broadcast {
            let update = SpaceUpdate {
                exclude: Some(self.conn.id()),
                ..update
            };
            if let Err(err) = self.broadcaster.enqueue(update) {
                warn!(error = %err, "failed to enqueue command broadcast");
            }
        }

        if let Some((target, event)) = outcome.user_broadcast {
            if let Some(target_conn) = self.router.lookup_user(target) {
                if let Err(err) = target_conn.send_event(&event) {
                    warn!(target = %target, error = %err, "failed to route command broadcast");
                }
            }
        }
    }

    /// The single exit path: unbind from the router (CAS against this
    /// connection), drop the user from the space, announce the
    /// departure, and tear down media state.
    async fn finish(&mut self) {
        if let Some(user_id) = self.user_id.take() {
            let space_id = self.broadcaster.space_id();

            // Last writer wins: if the user already rebound to a newer
            // connection in this same space, this superseded parser must
            // not tear their presence down.
            let superseded_same_space = self
                .router
                .lookup_user(user_id)
                .map(|current| {
                    current.id() != self.conn.id() && current.space_id() == Some(space_id)
                })
                .unwrap_or(false);

            self.router.unbind_user(user_id, &self.conn);
            if superseded_same_space {
                debug!(user = %user_id, space = %space_id, "superseded connection, presence kept");
                self.conn.close();
                return;
            }

            self.broadcaster.presence().lock().remove(user_id);

            if let Err(err) = self
                .broadcaster
                .enqueue(SpaceUpdate::new(SpaceEvent::UserLeft { user_id, space_id }))
            {
                match err {
                    WsError::ChannelClosed => {
                        debug!(space = %space_id, "broadcaster already stopped")
                    }
                    other => warn!(space = %space_id, error = %other, "failed to announce leave"),
                }
            }

            self.broadcaster.media().cleanup_user(user_id);
            info!(user = %user_id, space = %space_id, "user left");
        }

        self.conn.close();
        debug!(conn = %self.conn.id(), "parser finished");
    }
}
