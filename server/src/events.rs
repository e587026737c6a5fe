//! Wire taxonomy for the fabric.
//!
//! Every frame is a JSON object. Inbound envelopes carry an `event`
//! discriminator matched case-insensitively; outbound envelopes use
//! UPPER_SNAKE names for broadcast events and lowercase names for
//! replies. The canonical encoding renders UUIDs as strings and
//! timestamps as ISO-8601, so a serialize → deserialize → serialize
//! round trip is byte-stable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{WsError, WsResult};
use crate::media::SpaceMediaInfo;
use crate::models::{Position, UserSnapshot};

/// WebRTC negotiation signal kinds relayed between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

/// Raw chat payload as supplied by the client inside `data`.
///
/// `sender_id` and `space_id` are overwritten by the parser from session
/// state before the payload reaches the pipeline; clients cannot spoof
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageData {
    #[serde(default)]
    pub sender_id: Option<Uuid>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub space_id: Option<Uuid>,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
}

/// Inbound events on the streaming channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Subscribe {
        #[serde(default)]
        space_id: Option<Uuid>,
    },
    Join {
        #[serde(default)]
        user_id: Option<Uuid>,
        #[serde(default)]
        space_id: Option<Uuid>,
        #[serde(default)]
        position: Option<Position>,
    },
    PositionMove {
        #[serde(default)]
        user_id: Option<Uuid>,
        #[serde(default)]
        space_id: Option<Uuid>,
        nx: f64,
        ny: f64,
        #[serde(default)]
        direction: Option<String>,
        #[serde(default, rename = "isMoving")]
        is_moving: bool,
    },
    SendChatMessage {
        #[serde(default)]
        data: ChatMessageData,
    },
    SendPrivateMessage {
        #[serde(default)]
        data: ChatMessageData,
    },
    WebrtcSignal {
        #[serde(default)]
        signal_type: Option<SignalType>,
        #[serde(default)]
        to_user_id: Option<Uuid>,
        #[serde(default)]
        data: Value,
    },
    StartAudioStream {
        #[serde(default)]
        metadata: Option<Value>,
    },
    StopAudioStream,
    MuteAudio,
    UnmuteAudio,
    StartVideoStream {
        #[serde(default)]
        metadata: Option<Value>,
    },
    StopVideoStream,
    StartScreenStream {
        #[serde(default)]
        metadata: Option<Value>,
    },
    StopScreenStream,
    Left,
    #[serde(other)]
    Unknown,
}

/// Events fanned out to every subscriber of a space through the
/// broadcaster queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SpaceEvent {
    #[serde(rename = "user_joined")]
    UserJoined {
        user_id: Uuid,
        space_id: Uuid,
        user_data: UserSnapshot,
        x: f64,
        y: f64,
    },
    #[serde(rename = "user_left")]
    UserLeft { user_id: Uuid, space_id: Uuid },
    #[serde(rename = "position_update")]
    PositionUpdate {
        user_id: Uuid,
        space_id: Uuid,
        nx: f64,
        ny: f64,
        direction: String,
        #[serde(rename = "isMoving")]
        is_moving: bool,
    },
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage {
        space_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        user_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "AUDIO_STREAM_STARTED")]
    AudioStreamStarted {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "AUDIO_STREAM_STOPPED")]
    AudioStreamStopped {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "VIDEO_STREAM_STARTED")]
    VideoStreamStarted {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "VIDEO_STREAM_STOPPED")]
    VideoStreamStopped {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "SCREEN_STREAM_STARTED")]
    ScreenStreamStarted {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "SCREEN_STREAM_STOPPED")]
    ScreenStreamStopped {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "AUDIO_MUTED")]
    AudioMuted {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "AUDIO_UNMUTED")]
    AudioUnmuted {
        user_id: Uuid,
        user_name: String,
        space_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "USER_MOVED")]
    UserMoved {
        user_id: Uuid,
        space_id: Uuid,
        position: Position,
    },
    #[serde(rename = "USER_ACTION")]
    UserAction {
        user_id: Uuid,
        space_id: Uuid,
        action: Option<String>,
    },
}

/// Events delivered to a single connection: replies and user-private
/// notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum UserEvent {
    #[serde(rename = "subscribed")]
    Subscribed { space_id: Uuid },
    #[serde(rename = "space_state")]
    SpaceState {
        space_id: Uuid,
        map_id: String,
        users: BTreeMap<Uuid, UserSnapshot>,
        positions: BTreeMap<Uuid, Position>,
        media_info: SpaceMediaInfo,
    },
    #[serde(rename = "position_move_ack")]
    PositionMoveAck {
        user_id: Uuid,
        space_id: Uuid,
        nx: f64,
        ny: f64,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "PRIVATE_MESSAGE")]
    PrivateMessage {
        user_id: Uuid,
        message_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_user_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sent: Option<bool>,
    },
    #[serde(rename = "WEBRTC_SIGNAL")]
    WebrtcSignal {
        signal_type: SignalType,
        from_user_id: Uuid,
        space_id: Uuid,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "INVITE_RECEIVED")]
    InviteReceived {
        invite_id: Uuid,
        from_user_id: Uuid,
        from_user_name: String,
        space_id: Uuid,
        space_name: String,
    },
    #[serde(rename = "SPACE_INVITE_ACCEPTED")]
    SpaceInviteAccepted {
        space_id: Uuid,
        space_name: String,
        user_id: Uuid,
        user_name: String,
    },
    #[serde(rename = "SPACE_INVITE_DECLINED")]
    SpaceInviteDeclined {
        space_id: Uuid,
        space_name: String,
        user_id: Uuid,
        user_name: String,
    },
}

/// Serialize an outbound event to a single text frame.
pub fn encode_event<T: Serialize>(event: &T) -> WsResult<String> {
    serde_json::to_string(event).map_err(WsError::from)
}

/// Parse an inbound frame, matching the `event` discriminator
/// case-insensitively.
pub fn parse_client_event(text: &str) -> WsResult<ClientEvent> {
    let mut value: Value = serde_json::from_str(text)
        .map_err(|_| WsError::Protocol("invalid JSON frame".to_string()))?;
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| WsError::Protocol("'event' field is required".to_string()))?;
    let lowered = event.to_ascii_lowercase();
    value["event"] = Value::String(lowered);
    serde_json::from_value(value).map_err(|e| WsError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_events_case_insensitively() {
        let event = parse_client_event(r#"{"event": "SUBSCRIBE", "space_id": null}"#).unwrap();
        assert!(matches!(event, ClientEvent::Subscribe { space_id: None }));

        let event = parse_client_event(
            r#"{"event": "position_move", "nx": 3.0, "ny": 4.0, "direction": "up", "isMoving": true}"#,
        )
        .unwrap();
        match event {
            ClientEvent::PositionMove {
                nx,
                ny,
                direction,
                is_moving,
                ..
            } => {
                assert_eq!(nx, 3.0);
                assert_eq!(ny, 4.0);
                assert_eq!(direction.as_deref(), Some("up"));
                assert!(is_moving);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_events_map_to_unknown_variant() {
        let event = parse_client_event(r#"{"event": "teleport"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Unknown));
    }

    #[test]
    fn missing_event_field_is_a_protocol_error() {
        let err = parse_client_event(r#"{"space_id": "abc"}"#).unwrap_err();
        assert!(matches!(err, WsError::Protocol(_)));
    }

    #[test]
    fn space_event_names_follow_the_wire_casing() {
        let space = Uuid::new_v4();
        let user = Uuid::new_v4();

        let left = serde_json::to_value(&SpaceEvent::UserLeft {
            user_id: user,
            space_id: space,
        })
        .unwrap();
        assert_eq!(left["event"], "user_left");

        let chat = serde_json::to_value(&SpaceEvent::ChatMessage {
            space_id: space,
            message_id: Uuid::new_v4(),
            user_id: user,
            user_name: "ada".into(),
            message: "hi".into(),
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(chat["event"], "CHAT_MESSAGE");
    }

    #[test]
    fn canonical_encoding_round_trips_byte_equal() {
        let event = SpaceEvent::ChatMessage {
            space_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            user_name: "ada".into(),
            message: "hello there".into(),
            timestamp: Utc::now(),
        };
        let first = encode_event(&event).unwrap();
        let decoded: SpaceEvent = serde_json::from_str(&first).unwrap();
        let second = encode_event(&decoded).unwrap();
        assert_eq!(first, second);
        assert_eq!(decoded, event);
    }

    #[test]
    fn private_message_confirmation_omits_receiver_fields() {
        let confirm = UserEvent::PrivateMessage {
            user_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            message: "yo".into(),
            timestamp: Utc::now(),
            from_user_id: None,
            from_user_name: None,
            to_user_id: Some(Uuid::new_v4()),
            sent: Some(true),
        };
        let value = serde_json::to_value(&confirm).unwrap();
        assert_eq!(value["event"], "PRIVATE_MESSAGE");
        assert_eq!(value["sent"], true);
        assert!(value.get("from_user_id").is_none());
    }
}
