//! The single store interface.
//!
//! Every durable read and write in the fabric goes through [`Store`].
//! Invite operations are whole transactions: each trait method runs its
//! precondition checks and writes atomically, so the Postgres
//! implementation can wrap them in one `sqlx` transaction and an
//! in-memory implementation in one lock scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::WsResult;
use crate::models::{InviteData, InviteView, Message, SpaceRow, UserRow};

pub mod pg;
#[cfg(test)]
pub mod mem;

pub use pg::{init_pool, PgStore};

/// Outcome of a successfully created invite.
#[derive(Debug, Clone)]
pub struct InviteCreated {
    pub notification_id: Uuid,
    pub to_user_id: Uuid,
    pub to_user_name: String,
    pub from_user_id: Uuid,
    pub from_user_name: String,
    pub space_id: Uuid,
    pub space_name: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of accepting an invite. `already_member` marks the idempotent
/// path: the notification was flipped to read without inserting a
/// membership row.
#[derive(Debug, Clone)]
pub struct InviteAccepted {
    pub space_id: Uuid,
    pub space_name: String,
    pub already_member: bool,
    pub data: InviteData,
}

/// Outcome of declining an invite.
#[derive(Debug, Clone)]
pub struct InviteDeclined {
    pub data: InviteData,
}

/// Title and body text of an invite notification, shared by every store
/// implementation.
pub fn invite_texts(sender_name: &str, space_name: &str) -> (String, String) {
    (
        format!("Space Invite from {sender_name}"),
        format!("{sender_name} has invited you to join the space '{space_name}'"),
    )
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, id: Uuid) -> WsResult<Option<UserRow>>;

    async fn get_space(&self, id: Uuid) -> WsResult<Option<SpaceRow>>;

    /// All users with a membership row for the space, in join order.
    async fn get_users_in_space(&self, space_id: Uuid) -> WsResult<Vec<UserRow>>;

    /// Whether the user may enter the space: member, admin, or the space
    /// is public.
    async fn user_has_space_access(&self, user_id: Uuid, space_id: Uuid) -> WsResult<bool>;

    /// Idempotent upsert keyed on `message_id`; a second write for the
    /// same id only updates `status`.
    async fn upsert_message(&self, message: &Message) -> WsResult<()>;

    async fn get_message(&self, message_id: Uuid) -> WsResult<Option<Message>>;

    /// Create an invite notification after checking, atomically: sender
    /// access, space capacity, recipient existence, recipient not a
    /// member, and no pending non-expired invite for the same pair.
    async fn create_invite(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        space_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> WsResult<InviteCreated>;

    /// Accept an invite in a single transaction. Expired invites flip to
    /// `dismissed` and fail; an already-member recipient flips the
    /// notification to `read` and succeeds idempotently.
    async fn accept_invite(&self, user_id: Uuid, notification_id: Uuid)
        -> WsResult<InviteAccepted>;

    /// Flip an unread invite to `dismissed`.
    async fn decline_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteDeclined>;

    /// Unread invites for the user, newest first, skipping expired ones
    /// unless `include_expired`.
    async fn list_invites(&self, user_id: Uuid, include_expired: bool)
        -> WsResult<Vec<InviteView>>;

    /// Active users excluding the requester; with a space given, also
    /// excluding its current members.
    async fn list_invitable_users(
        &self,
        requester: Uuid,
        space_id: Option<Uuid>,
    ) -> WsResult<Vec<UserRow>>;
}
