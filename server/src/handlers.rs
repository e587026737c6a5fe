//! Secondary command surface.
//!
//! Some flows arrive as request-reply envelopes `{type, payload}`
//! instead of streaming events. The handler validates the type against
//! the closed command set, dispatches to the same underlying operations
//! as the streaming surface, and returns a reply that may flag a
//! broadcast for the caller to route.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::WsConfig;
use crate::connection::Connection;
use crate::events::{ChatMessageData, SpaceEvent, UserEvent};
use crate::invite::{invite_reply, InviteManager};
use crate::models::{Position, SpaceRow, UserRow};
use crate::router::SpaceRouter;
use crate::spaces::{SpaceBroadcaster, SpaceUpdate};
use crate::store::Store;

/// The closed set of command types. Types listed here but without a
/// handler reply "not implemented", everything else is rejected
/// outright.
pub const VALID_COMMANDS: &[&str] = &[
    "JOIN_SPACE",
    "LEAVE_SPACE",
    "MOVE",
    "ACTION",
    "CHAT",
    "AUDIO",
    "VIDEO",
    "LEAVE",
    "SEND_INVITE",
    "ACCEPT_INVITE",
    "DECLINE_INVITE",
    "GET_USERS",
    "GET_INVITES",
];

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,
    #[serde(rename = "broadcastType", skip_serializing_if = "Option::is_none")]
    pub broadcast_type: Option<String>,
    #[serde(rename = "broadcastTo", skip_serializing_if = "Option::is_none")]
    pub broadcast_to: Option<Uuid>,
}

impl CommandResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
            error: None,
            data: None,
            broadcast: None,
            broadcast_type: None,
            broadcast_to: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            message: None,
            error: Some(error.into()),
            data: None,
            broadcast: None,
            broadcast_type: None,
            broadcast_to: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// A handler reply plus the broadcasts the caller must route: one for
/// the whole space, one for a single user (`broadcastTo`).
pub struct HandlerOutcome {
    pub response: CommandResponse,
    pub space_broadcast: Option<SpaceUpdate>,
    pub user_broadcast: Option<(Uuid, UserEvent)>,
}

impl From<CommandResponse> for HandlerOutcome {
    fn from(response: CommandResponse) -> Self {
        Self {
            response,
            space_broadcast: None,
            user_broadcast: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload {
    user_id: Option<Uuid>,
    space_id: Option<Uuid>,
    initial_position: Option<Position>,
}

#[derive(Debug, Default, Deserialize)]
struct MovePayload {
    position: Option<Position>,
}

#[derive(Debug, Default, Deserialize)]
struct ActionPayload {
    action: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatPayload {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvitePayload {
    to_user_id: Option<Uuid>,
    space_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    notification_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUsersPayload {
    space_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetInvitesPayload {
    #[serde(default)]
    include_expired: bool,
}

fn parse_payload<T: Default + for<'de> Deserialize<'de>>(payload: &Value) -> T {
    serde_json::from_value(payload.clone()).unwrap_or_default()
}

fn user_json(user: &UserRow) -> Value {
    json!({
        "id": user.id,
        "username": user.user_name,
        "email": user.email,
        "role": user.role,
        "avatar_url": user.user_avatar_url,
        "is_active": user.user_is_active,
        "created_at": user.user_created_at.to_rfc3339(),
        "updated_at": user.user_updated_at.to_rfc3339(),
    })
}

fn space_json(space: &SpaceRow) -> Value {
    json!({
        "id": space.id,
        "name": space.name,
        "description": space.description,
        "map_image_url": space.map_image_url,
        "admin_user_id": space.admin_user_id,
        "is_public": space.is_public,
        "max_users": space.max_users,
        "is_active": space.is_active,
        "created_at": space.created_at.to_rfc3339(),
        "updated_at": space.updated_at.to_rfc3339(),
    })
}

fn invitable_user_json(user: &UserRow) -> Value {
    json!({
        "id": user.id,
        "username": user.user_name,
        "email": user.email,
        "role": user.role,
        "avatarUrl": user.user_avatar_url,
    })
}

pub struct MessageHandler {
    store: Arc<dyn Store>,
    invites: InviteManager,
}

impl MessageHandler {
    pub fn new(store: Arc<dyn Store>, router: Arc<SpaceRouter>) -> Self {
        let config = WsConfig::default();
        let invites = InviteManager::new(store.clone(), router, config.invite_expiry_hours);
        Self { store, invites }
    }

    /// Dispatch a command envelope for `conn`, scoped to the space the
    /// connection is subscribed to.
    pub async fn handle(
        &self,
        conn: &Arc<Connection>,
        broadcaster: &Arc<SpaceBroadcaster>,
        request: CommandRequest,
    ) -> HandlerOutcome {
        if !VALID_COMMANDS.contains(&request.kind.as_str()) {
            return CommandResponse::failed(format!("Invalid message type: {}", request.kind))
                .into();
        }

        match request.kind.as_str() {
            "JOIN_SPACE" => self.join_space(conn, &request.payload).await,
            "LEAVE_SPACE" => self.leave_space(conn),
            "MOVE" => self.moved(conn, &request.payload),
            "ACTION" => self.action(conn, &request.payload),
            "CHAT" => self.chat(conn, broadcaster, &request.payload).await,
            "SEND_INVITE" => self.send_invite(conn, &request.payload).await,
            "ACCEPT_INVITE" => self.accept_invite(conn, &request.payload).await,
            "DECLINE_INVITE" => self.decline_invite(conn, &request.payload).await,
            "GET_USERS" => self.get_users(conn, &request.payload).await,
            "GET_INVITES" => self.get_invites(conn, &request.payload).await,
            other => {
                warn!(kind = other, "no handler implemented for command");
                CommandResponse::failed(format!("Handler not implemented for type: {other}")).into()
            }
        }
    }

    fn session(&self, conn: &Connection) -> Option<(Uuid, Uuid)> {
        if !conn.is_authenticated() {
            return None;
        }
        Some((conn.user_id()?, conn.space_id()?))
    }

    async fn join_space(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        if payload.is_null() {
            return CommandResponse::failed("Payload is required").into();
        }
        let payload: JoinPayload = parse_payload(payload);
        let (Some(user_id), Some(space_id)) = (payload.user_id, payload.space_id) else {
            return CommandResponse::failed("userId and spaceId are required").into();
        };

        let user = match self.store.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return CommandResponse::failed("User not found").into(),
            Err(err) => return CommandResponse::failed(err.client_message()).into(),
        };
        let space = match self.store.get_space(space_id).await {
            Ok(Some(space)) => space,
            Ok(None) => return CommandResponse::failed("Space not found").into(),
            Err(err) => return CommandResponse::failed(err.client_message()).into(),
        };
        match self.store.user_has_space_access(user_id, space_id).await {
            Ok(true) => {}
            Ok(false) => return CommandResponse::failed("Access denied to this space").into(),
            Err(err) => return CommandResponse::failed(err.client_message()).into(),
        }

        conn.set_session(Some(user_id), Some(space_id), true);
        let position = payload.initial_position.unwrap_or_default();

        let response = CommandResponse {
            broadcast: Some(true),
            broadcast_type: Some("USER_JOINED".to_string()),
            ..CommandResponse::success("Join space successful")
        }
        .with_data(json!({
            "user": user_json(&user),
            "space": space_json(&space),
            "position": position,
        }));

        HandlerOutcome {
            response,
            space_broadcast: Some(SpaceUpdate::new(SpaceEvent::UserJoined {
                user_id,
                space_id,
                user_data: user.snapshot(),
                x: position.x,
                y: position.y,
            })),
            user_broadcast: None,
        }
    }

    fn leave_space(&self, conn: &Arc<Connection>) -> HandlerOutcome {
        let Some(space_id) = conn.space_id() else {
            return CommandResponse::failed("Not in any space").into();
        };
        let user_id = conn.user_id();
        conn.clear_space();

        CommandResponse::success("Left space successfully")
            .with_data(json!({ "spaceId": space_id, "userId": user_id }))
            .into()
    }

    fn moved(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, space_id)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: MovePayload = parse_payload(payload);
        let position = payload.position.unwrap_or_default();

        let response = CommandResponse {
            broadcast: Some(true),
            broadcast_type: Some("USER_MOVED".to_string()),
            ..CommandResponse::success("Move processed")
        }
        .with_data(json!({
            "userId": user_id,
            "spaceId": space_id,
            "position": position,
        }));

        HandlerOutcome {
            response,
            space_broadcast: Some(SpaceUpdate::new(SpaceEvent::UserMoved {
                user_id,
                space_id,
                position,
            })),
            user_broadcast: None,
        }
    }

    fn action(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, space_id)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: ActionPayload = parse_payload(payload);

        let response = CommandResponse {
            broadcast: Some(true),
            broadcast_type: Some("USER_ACTION".to_string()),
            ..CommandResponse::success("Action processed")
        }
        .with_data(json!({
            "userId": user_id,
            "spaceId": space_id,
            "action": payload.action,
        }));

        HandlerOutcome {
            response,
            space_broadcast: Some(SpaceUpdate::new(SpaceEvent::UserAction {
                user_id,
                space_id,
                action: payload.action,
            })),
            user_broadcast: None,
        }
    }

    /// Chat on the command surface goes through the same pipeline as the
    /// streaming surface; the pipeline already fans the message out, so
    /// the reply carries no broadcast flag.
    async fn chat(
        &self,
        conn: &Arc<Connection>,
        broadcaster: &Arc<SpaceBroadcaster>,
        payload: &Value,
    ) -> HandlerOutcome {
        let Some((user_id, space_id)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: ChatPayload = parse_payload(payload);
        let Some(message) = payload.message else {
            return CommandResponse::failed("Message is required").into();
        };

        let data = ChatMessageData {
            sender_id: Some(user_id),
            content: Some(message.clone()),
            space_id: None,
            receiver_id: None,
        };
        match broadcaster.chat().handle_space_message(data, space_id).await {
            Ok(message_id) => CommandResponse::success("Chat message sent")
                .with_data(json!({
                    "userId": user_id,
                    "spaceId": space_id,
                    "message": message,
                    "messageId": message_id,
                }))
                .into(),
            Err(err) => CommandResponse::failed(err.client_message()).into(),
        }
    }

    async fn send_invite(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, _)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: InvitePayload = parse_payload(payload);
        let (Some(to_user_id), Some(space_id)) = (payload.to_user_id, payload.space_id) else {
            return CommandResponse::failed("toUserId and spaceId are required").into();
        };

        match self.invites.send_invite(user_id, to_user_id, space_id).await {
            Ok(created) => {
                let response = CommandResponse {
                    broadcast: Some(true),
                    broadcast_type: Some("INVITE_RECEIVED".to_string()),
                    broadcast_to: Some(to_user_id),
                    ..CommandResponse::success("Invite sent successfully")
                }
                .with_data(invite_reply(&created));

                HandlerOutcome {
                    response,
                    space_broadcast: None,
                    user_broadcast: Some((
                        to_user_id,
                        UserEvent::InviteReceived {
                            invite_id: created.notification_id,
                            from_user_id: created.from_user_id,
                            from_user_name: created.from_user_name.clone(),
                            space_id: created.space_id,
                            space_name: created.space_name.clone(),
                        },
                    )),
                }
            }
            Err(err) => CommandResponse::failed(err.client_message()).into(),
        }
    }

    async fn accept_invite(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, _)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: NotificationPayload = parse_payload(payload);
        let Some(notification_id) = payload.notification_id else {
            return CommandResponse::failed("notificationId is required").into();
        };

        match self.invites.accept_invite(user_id, notification_id).await {
            Ok(accepted) => {
                let message = if accepted.already_member {
                    "You are already a member of this space"
                } else {
                    "Invite accepted successfully"
                };
                CommandResponse::success(message)
                    .with_data(json!({
                        "id": accepted.space_id,
                        "name": accepted.space_name,
                    }))
                    .into()
            }
            Err(err) => CommandResponse::failed(err.client_message()).into(),
        }
    }

    async fn decline_invite(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, _)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: NotificationPayload = parse_payload(payload);
        let Some(notification_id) = payload.notification_id else {
            return CommandResponse::failed("notificationId is required").into();
        };

        match self.invites.decline_invite(user_id, notification_id).await {
            Ok(declined) => CommandResponse::success("Invite declined")
                .with_data(json!({ "spaceName": declined.data.space_name }))
                .into(),
            Err(err) => CommandResponse::failed(err.client_message()).into(),
        }
    }

    async fn get_users(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, _)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: GetUsersPayload = parse_payload(payload);

        match self.invites.get_all_users(user_id, payload.space_id).await {
            Ok(users) => {
                let users: Vec<Value> = users.iter().map(invitable_user_json).collect();
                CommandResponse::success("Users fetched")
                    .with_data(json!({ "count": users.len(), "users": users }))
                    .into()
            }
            Err(err) => CommandResponse::failed(err.client_message()).into(),
        }
    }

    async fn get_invites(&self, conn: &Arc<Connection>, payload: &Value) -> HandlerOutcome {
        let Some((user_id, _)) = self.session(conn) else {
            return CommandResponse::failed("Not authenticated").into();
        };
        let payload: GetInvitesPayload = parse_payload(payload);

        match self
            .invites
            .get_user_invites(user_id, payload.include_expired)
            .await
        {
            Ok(invites) => {
                let count = invites.len();
                match serde_json::to_value(invites) {
                    Ok(invites) => CommandResponse::success("Invites fetched")
                        .with_data(json!({ "count": count, "invites": invites }))
                        .into(),
                    Err(err) => CommandResponse::failed(err.to_string()).into(),
                }
            }
            Err(err) => CommandResponse::failed(err.client_message()).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    struct Fixture {
        store: Arc<MemStore>,
        broadcaster: Arc<SpaceBroadcaster>,
        handler: MessageHandler,
        user: UserRow,
        space: SpaceRow,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let user = store.seed_user("ada");
        let space = store.seed_space("lab", user.id, 10);
        store.seed_membership(user.id, space.id);

        let router = SpaceRouter::new(store.clone());
        let broadcaster = router.get_or_create_space(space.id);
        let handler = MessageHandler::new(store.clone(), router);

        Fixture {
            store,
            broadcaster,
            handler,
            user,
            space,
        }
    }

    fn request(kind: &str, payload: Value) -> CommandRequest {
        CommandRequest {
            kind: kind.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn unknown_types_are_rejected() {
        let f = fixture();
        let (conn, _rx) = Connection::new();
        let outcome = f
            .handler
            .handle(&conn, &f.broadcaster, request("TELEPORT", Value::Null))
            .await;
        assert_eq!(outcome.response.status, "failed");
        assert!(outcome.response.error.unwrap().contains("Invalid message type"));
    }

    #[tokio::test]
    async fn listed_but_unhandled_types_report_not_implemented() {
        let f = fixture();
        let (conn, _rx) = Connection::new();
        let outcome = f
            .handler
            .handle(&conn, &f.broadcaster, request("AUDIO", Value::Null))
            .await;
        assert_eq!(outcome.response.status, "failed");
        assert!(outcome
            .response
            .error
            .unwrap()
            .contains("Handler not implemented"));
    }

    #[tokio::test]
    async fn join_space_authenticates_and_flags_broadcast() {
        let f = fixture();
        let (conn, _rx) = Connection::new();
        let outcome = f
            .handler
            .handle(
                &conn,
                &f.broadcaster,
                request(
                    "JOIN_SPACE",
                    json!({ "userId": f.user.id, "spaceId": f.space.id }),
                ),
            )
            .await;

        assert!(outcome.response.is_success());
        assert_eq!(outcome.response.broadcast, Some(true));
        assert_eq!(outcome.response.broadcast_type.as_deref(), Some("USER_JOINED"));
        assert!(conn.is_authenticated());
        assert_eq!(conn.space_id(), Some(f.space.id));

        let update = outcome.space_broadcast.expect("join broadcast");
        assert!(matches!(update.event, SpaceEvent::UserJoined { .. }));

        let data = outcome.response.data.unwrap();
        assert_eq!(data["user"]["username"], "ada");
        assert_eq!(data["space"]["name"], "lab");
    }

    #[tokio::test]
    async fn join_space_denies_without_access() {
        let f = fixture();
        let outsider = f.store.seed_user("outsider");
        let (conn, _rx) = Connection::new();
        let outcome = f
            .handler
            .handle(
                &conn,
                &f.broadcaster,
                request(
                    "JOIN_SPACE",
                    json!({ "userId": outsider.id, "spaceId": f.space.id }),
                ),
            )
            .await;
        assert_eq!(outcome.response.status, "failed");
        assert_eq!(
            outcome.response.error.as_deref(),
            Some("Access denied to this space")
        );
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn move_requires_authentication() {
        let f = fixture();
        let (conn, _rx) = Connection::new();
        let outcome = f
            .handler
            .handle(
                &conn,
                &f.broadcaster,
                request("MOVE", json!({ "position": { "x": 1.0, "y": 2.0 } })),
            )
            .await;
        assert_eq!(outcome.response.error.as_deref(), Some("Not authenticated"));
    }

    #[tokio::test]
    async fn move_flags_user_moved_broadcast() {
        let f = fixture();
        let (conn, _rx) = Connection::new();
        conn.set_session(Some(f.user.id), Some(f.space.id), true);

        let outcome = f
            .handler
            .handle(
                &conn,
                &f.broadcaster,
                request("MOVE", json!({ "position": { "x": 3.0, "y": 4.0 } })),
            )
            .await;

        assert!(outcome.response.is_success());
        match outcome.space_broadcast.unwrap().event {
            SpaceEvent::UserMoved { position, .. } => {
                assert_eq!(position, Position { x: 3.0, y: 4.0 });
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_runs_through_the_pipeline() {
        let f = fixture();
        let (conn, _rx) = Connection::new();
        conn.set_session(Some(f.user.id), Some(f.space.id), true);

        let outcome = f
            .handler
            .handle(
                &conn,
                &f.broadcaster,
                request("CHAT", json!({ "message": "hello" })),
            )
            .await;

        assert!(outcome.response.is_success());
        // The pipeline already queued the fan-out; no caller broadcast.
        assert!(outcome.space_broadcast.is_none());
        let data = outcome.response.data.unwrap();
        assert!(data["messageId"].is_string());
    }

    #[tokio::test]
    async fn invite_flow_over_the_command_surface() {
        let f = fixture();
        let guest = f.store.seed_user("guest");

        let (admin_conn, _admin_rx) = Connection::new();
        admin_conn.set_session(Some(f.user.id), Some(f.space.id), true);

        let outcome = f
            .handler
            .handle(
                &admin_conn,
                &f.broadcaster,
                request(
                    "SEND_INVITE",
                    json!({ "toUserId": guest.id, "spaceId": f.space.id }),
                ),
            )
            .await;

        assert!(outcome.response.is_success());
        assert_eq!(outcome.response.broadcast_to, Some(guest.id));
        let (target, event) = outcome.user_broadcast.expect("invite broadcast");
        assert_eq!(target, guest.id);
        let notification_id = match event {
            UserEvent::InviteReceived { invite_id, .. } => invite_id,
            other => panic!("unexpected event: {other:?}"),
        };

        // Guest lists and accepts over the same surface.
        let (guest_conn, _guest_rx) = Connection::new();
        guest_conn.set_session(Some(guest.id), Some(f.space.id), true);

        let listed = f
            .handler
            .handle(&guest_conn, &f.broadcaster, request("GET_INVITES", json!({})))
            .await;
        assert_eq!(listed.response.data.unwrap()["count"], 1);

        let accepted = f
            .handler
            .handle(
                &guest_conn,
                &f.broadcaster,
                request(
                    "ACCEPT_INVITE",
                    json!({ "notificationId": notification_id }),
                ),
            )
            .await;
        assert!(accepted.response.is_success());
        assert_eq!(f.store.membership_count(guest.id, f.space.id), 1);
    }

    #[tokio::test]
    async fn get_users_excludes_members_of_the_space() {
        let f = fixture();
        let guest = f.store.seed_user("guest");
        let (conn, _rx) = Connection::new();
        conn.set_session(Some(f.user.id), Some(f.space.id), true);

        let outcome = f
            .handler
            .handle(
                &conn,
                &f.broadcaster,
                request("GET_USERS", json!({ "spaceId": f.space.id })),
            )
            .await;

        let data = outcome.response.data.unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["users"][0]["id"], guest.id.to_string());
        assert_eq!(data["users"][0]["username"], "guest");
    }
}
