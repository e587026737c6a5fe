//! Database rows and wire-facing projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Database representation of a user.
/// Maps to the `users` table.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub user_name: String,
    pub email: String,
    pub role: String,
    pub user_designation: Option<String>,
    pub user_avatar_url: Option<String>,
    pub user_is_active: bool,
    pub user_created_at: DateTime<Utc>,
    pub user_updated_at: DateTime<Utc>,
}

impl UserRow {
    /// Projection broadcast to other users in a space. Not authoritative;
    /// refreshed from the row on every join.
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id,
            user_name: self.user_name.clone(),
            user_avatar_url: self.user_avatar_url.clone(),
            user_designation: self.user_designation.clone(),
        }
    }
}

/// What the rest of the space learns about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: Uuid,
    pub user_name: String,
    pub user_avatar_url: Option<String>,
    pub user_designation: Option<String>,
}

/// Database representation of a space.
/// Maps to the `spaces` table.
#[derive(Debug, Clone, FromRow)]
pub struct SpaceRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub map_image_url: Option<String>,
    pub admin_user_id: Uuid,
    pub is_public: bool,
    pub max_users: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A 2D position inside a space map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Wire value for the two chat delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Space,
    Private,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Space => "space",
            MessageKind::Private => "private",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "space" => Ok(MessageKind::Space),
            "private" => Ok(MessageKind::Private),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// Lifecycle of a chat message through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Validated,
    Cached,
    Broadcast,
    Persisted,
    Failed,
    RolledBack,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Validated => "validated",
            MessageStatus::Cached => "cached",
            MessageStatus::Broadcast => "broadcast",
            MessageStatus::Persisted => "persisted",
            MessageStatus::Failed => "failed",
            MessageStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "validated" => Ok(MessageStatus::Validated),
            "cached" => Ok(MessageStatus::Cached),
            "broadcast" => Ok(MessageStatus::Broadcast),
            "persisted" => Ok(MessageStatus::Persisted),
            "failed" => Ok(MessageStatus::Failed),
            "rolled_back" => Ok(MessageStatus::RolledBack),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A chat message. Immutable once created apart from `status` and
/// `retry_count`, which track pipeline progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    #[serde(rename = "message_type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub space_id: Option<Uuid>,
    pub receiver_id: Option<Uuid>,
    pub status: MessageStatus,
    pub retry_count: u32,
}

/// Payload stored in an invite notification's `data` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteData {
    pub space_id: Uuid,
    pub space_name: String,
    pub from_user_id: Uuid,
    pub from_username: String,
    pub invite_type: String,
}

/// An invite as listed back to its recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteView {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub data: InviteData,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}
