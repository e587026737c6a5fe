//! WebSocket endpoint for the space channel.
//!
//! Every client connects at `/ws/metaverse/space` and must send a
//! `subscribe` event before anything else (the Opened state of the
//! ingress machine). Once subscribed, the socket is split three ways:
//! a writer task drains the connection's outbound channel, this task
//! pumps inbound text frames into the parser's channel, and the parser
//! task owns all protocol state. The cleanup path here runs
//! unconditionally on disconnect and stops the broadcaster when its
//! last subscriber departs.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::connection::Connection;
use crate::events::{parse_client_event, ClientEvent, UserEvent};
use crate::router::SpaceRouter;
use crate::spaces::SpaceBroadcaster;

/// WebSocket handler for the space channel
/// GET /ws/metaverse/space (WebSocket upgrade)
pub async fn space_channel(
    ws: WebSocketUpgrade,
    State(router): State<Arc<SpaceRouter>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, router))
}

async fn handle_socket(socket: WebSocket, router: Arc<SpaceRouter>) {
    metrics::counter!("ws_connections_total", 1);

    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbound_rx) = Connection::new();
    info!(conn = %conn.id(), "websocket connection opened");

    // Writer task: connection handle -> socket. Ends when the
    // connection closes or the peer goes away.
    let writer_token = conn.closed_token();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_token.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut broadcaster: Option<Arc<SpaceBroadcaster>> = None;
    let mut inbound_tx: Option<mpsc::UnboundedSender<String>> = None;

    loop {
        let closed_token = conn.closed_token();
        let msg = tokio::select! {
            _ = closed_token.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };

        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        match (&broadcaster, &inbound_tx) {
            // Subscribed: everything goes to the parser task.
            (Some(_), Some(tx)) => {
                if tx.send(text).is_err() {
                    // Parser finished (e.g. `left`); nothing more to do.
                    break;
                }
            }
            // Opened: only `subscribe` is accepted.
            _ => match parse_client_event(&text) {
                Ok(ClientEvent::Subscribe {
                    space_id: Some(space_id),
                }) => {
                    let sb = router.get_or_create_space(space_id);
                    let (tx, inbound_rx) = mpsc::unbounded_channel();
                    sb.add_subscriber(conn.clone(), inbound_rx);
                    if let Err(err) = sb.start_if_not_running().await {
                        error!(space = %space_id, error = %err, "failed to start broadcaster");
                        conn.send_error("space unavailable");
                        break;
                    }
                    let _ = conn.send_event(&UserEvent::Subscribed { space_id });
                    info!(conn = %conn.id(), space = %space_id, "subscriber admitted");
                    broadcaster = Some(sb);
                    inbound_tx = Some(tx);
                }
                Ok(ClientEvent::Subscribe { space_id: None }) => {
                    conn.send_error("space_id required");
                }
                _ => {
                    conn.send_error("Please send subscribe event first");
                }
            },
        }
    }

    // Unconditional cleanup: closing the inbound channel ends the
    // parser, whose own cleanup path unbinds the user and announces the
    // departure. The broadcaster stops once its last subscriber is
    // gone.
    drop(inbound_tx);
    if let Some(sb) = broadcaster {
        sb.remove_subscriber(&conn).await;
        if !sb.has_subscribers() {
            debug!(space = %sb.space_id(), "last subscriber left, stopping broadcaster");
            sb.stop().await;
        }
    }
    conn.close();
    let _ = writer.await;
    info!(conn = %conn.id(), "websocket connection closed");
}
