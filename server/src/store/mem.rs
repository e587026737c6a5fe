//! In-memory [`Store`] used by the test suite.
//!
//! Mirrors the Postgres implementation's semantics, with every invite
//! operation executed under a single lock so the transactional
//! guarantees hold. Message writes can be failed on demand to drive the
//! pipeline's retry and dead-letter paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{WsError, WsResult};
use crate::models::{InviteData, InviteView, Message, SpaceRow, UserRow};

use super::{invite_texts, InviteAccepted, InviteCreated, InviteDeclined, Store};

#[derive(Debug, Clone)]
struct MemNotification {
    id: Uuid,
    user_id: Uuid,
    title: String,
    message: String,
    data: InviteData,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemState {
    users: HashMap<Uuid, UserRow>,
    spaces: HashMap<Uuid, SpaceRow>,
    memberships: Vec<(Uuid, Uuid, DateTime<Utc>)>,
    messages: HashMap<Uuid, Message>,
    notifications: HashMap<Uuid, MemNotification>,
}

impl MemState {
    fn is_member(&self, user_id: Uuid, space_id: Uuid) -> bool {
        self.memberships
            .iter()
            .any(|(u, s, _)| *u == user_id && *s == space_id)
    }

    fn member_count(&self, space_id: Uuid) -> usize {
        self.memberships.iter().filter(|(_, s, _)| *s == space_id).count()
    }
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
    fail_message_writes: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `upsert_message` fail.
    pub fn fail_message_writes(&self, fail: bool) {
        self.fail_message_writes.store(fail, Ordering::SeqCst);
    }

    pub fn seed_user(&self, name: &str) -> UserRow {
        let now = Utc::now();
        let user = UserRow {
            id: Uuid::new_v4(),
            user_name: name.to_string(),
            email: format!("{name}@example.com"),
            role: "participant".to_string(),
            user_designation: None,
            user_avatar_url: None,
            user_is_active: true,
            user_created_at: now,
            user_updated_at: now,
        };
        self.state.lock().users.insert(user.id, user.clone());
        user
    }

    pub fn seed_space(&self, name: &str, admin_user_id: Uuid, max_users: i32) -> SpaceRow {
        let now = Utc::now();
        let space = SpaceRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            map_image_url: Some("office-01".to_string()),
            admin_user_id,
            is_public: false,
            max_users,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().spaces.insert(space.id, space.clone());
        space
    }

    pub fn seed_membership(&self, user_id: Uuid, space_id: Uuid) {
        self.state
            .lock()
            .memberships
            .push((user_id, space_id, Utc::now()));
    }

    pub fn deactivate_space(&self, space_id: Uuid) {
        if let Some(space) = self.state.lock().spaces.get_mut(&space_id) {
            space.is_active = false;
        }
    }

    /// Force an invite's expiry into the past.
    pub fn expire_invite(&self, notification_id: Uuid) {
        if let Some(n) = self.state.lock().notifications.get_mut(&notification_id) {
            n.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        }
    }

    pub fn notification_status(&self, notification_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .notifications
            .get(&notification_id)
            .map(|n| n.status.clone())
    }

    pub fn membership_count(&self, user_id: Uuid, space_id: Uuid) -> usize {
        self.state
            .lock()
            .memberships
            .iter()
            .filter(|(u, s, _)| *u == user_id && *s == space_id)
            .count()
    }

    pub fn stored_message(&self, message_id: Uuid) -> Option<Message> {
        self.state.lock().messages.get(&message_id).cloned()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_user(&self, id: Uuid) -> WsResult<Option<UserRow>> {
        Ok(self.state.lock().users.get(&id).cloned())
    }

    async fn get_space(&self, id: Uuid) -> WsResult<Option<SpaceRow>> {
        Ok(self.state.lock().spaces.get(&id).cloned())
    }

    async fn get_users_in_space(&self, space_id: Uuid) -> WsResult<Vec<UserRow>> {
        let state = self.state.lock();
        let mut members: Vec<_> = state
            .memberships
            .iter()
            .filter(|(_, s, _)| *s == space_id)
            .collect();
        members.sort_by_key(|(_, _, joined)| *joined);
        Ok(members
            .into_iter()
            .filter_map(|(u, _, _)| state.users.get(u).cloned())
            .collect())
    }

    async fn user_has_space_access(&self, user_id: Uuid, space_id: Uuid) -> WsResult<bool> {
        let state = self.state.lock();
        if state.is_member(user_id, space_id) {
            return Ok(true);
        }
        Ok(state
            .spaces
            .get(&space_id)
            .map(|s| s.is_active && (s.is_public || s.admin_user_id == user_id))
            .unwrap_or(false))
    }

    async fn upsert_message(&self, message: &Message) -> WsResult<()> {
        if self.fail_message_writes.load(Ordering::SeqCst) {
            return Err(WsError::Backend("message store unavailable".to_string()));
        }
        let mut state = self.state.lock();
        match state.messages.get_mut(&message.message_id) {
            Some(existing) => existing.status = message.status,
            None => {
                state.messages.insert(message.message_id, message.clone());
            }
        }
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> WsResult<Option<Message>> {
        Ok(self.state.lock().messages.get(&message_id).cloned())
    }

    async fn create_invite(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        space_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> WsResult<InviteCreated> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let space = state
            .spaces
            .get(&space_id)
            .filter(|s| s.is_active)
            .filter(|s| s.admin_user_id == from_user_id || state.is_member(from_user_id, space_id))
            .cloned()
            .ok_or_else(|| {
                WsError::Authorization(
                    "You do not have access to this space or space does not exist".to_string(),
                )
            })?;

        if state.member_count(space_id) >= space.max_users as usize {
            return Err(WsError::Conflict("Space is full".to_string()));
        }

        let recipient = state
            .users
            .get(&to_user_id)
            .filter(|u| u.user_is_active)
            .cloned()
            .ok_or_else(|| WsError::NotFound("Recipient user does not exist".to_string()))?;

        if state.is_member(to_user_id, space_id) {
            return Err(WsError::Conflict(
                "User is already a member of this space".to_string(),
            ));
        }

        let pending = state.notifications.values().any(|n| {
            n.user_id == to_user_id
                && n.data.space_id == space_id
                && n.status == "unread"
                && n.is_active
                && n.expires_at.map(|e| e > now).unwrap_or(true)
        });
        if pending {
            return Err(WsError::Conflict(
                "A pending invite already exists for this user and space".to_string(),
            ));
        }

        let sender = state
            .users
            .get(&from_user_id)
            .filter(|u| u.user_is_active)
            .cloned()
            .ok_or_else(|| WsError::NotFound("Sender user does not exist".to_string()))?;

        let notification_id = Uuid::new_v4();
        let data = InviteData {
            space_id,
            space_name: space.name.clone(),
            from_user_id,
            from_username: sender.user_name.clone(),
            invite_type: "space_invite".to_string(),
        };
        let (title, message) = invite_texts(&sender.user_name, &space.name);

        state.notifications.insert(
            notification_id,
            MemNotification {
                id: notification_id,
                user_id: to_user_id,
                title,
                message,
                data,
                status: "unread".to_string(),
                expires_at: Some(expires_at),
                is_active: true,
                created_at: now,
            },
        );

        Ok(InviteCreated {
            notification_id,
            to_user_id,
            to_user_name: recipient.user_name,
            from_user_id,
            from_user_name: sender.user_name,
            space_id,
            space_name: space.name,
            expires_at,
        })
    }

    async fn accept_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteAccepted> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let invite = state
            .notifications
            .get(&notification_id)
            .filter(|n| n.user_id == user_id && n.is_active)
            .cloned()
            .ok_or_else(|| WsError::NotFound("Invite not found".to_string()))?;

        if invite.status != "unread" {
            return Err(WsError::Conflict(
                "Invite has already been processed".to_string(),
            ));
        }

        if invite.expires_at.map(|e| e < now).unwrap_or(false) {
            if let Some(n) = state.notifications.get_mut(&notification_id) {
                n.status = "dismissed".to_string();
            }
            return Err(WsError::Conflict("Invite has expired".to_string()));
        }

        let space_id = invite.data.space_id;
        let space = state
            .spaces
            .get(&space_id)
            .filter(|s| s.is_active)
            .cloned()
            .ok_or_else(|| {
                WsError::NotFound("Space no longer exists or is inactive".to_string())
            })?;

        if state.is_member(user_id, space_id) {
            if let Some(n) = state.notifications.get_mut(&notification_id) {
                n.status = "read".to_string();
            }
            return Ok(InviteAccepted {
                space_id,
                space_name: space.name,
                already_member: true,
                data: invite.data,
            });
        }

        if state.member_count(space_id) >= space.max_users as usize {
            return Err(WsError::Conflict("Space is now full".to_string()));
        }

        state.memberships.push((user_id, space_id, now));
        if let Some(n) = state.notifications.get_mut(&notification_id) {
            n.status = "read".to_string();
        }

        Ok(InviteAccepted {
            space_id,
            space_name: space.name,
            already_member: false,
            data: invite.data,
        })
    }

    async fn decline_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteDeclined> {
        let mut state = self.state.lock();

        let invite = state
            .notifications
            .get(&notification_id)
            .filter(|n| n.user_id == user_id && n.is_active)
            .cloned()
            .ok_or_else(|| WsError::NotFound("Invite not found".to_string()))?;

        if invite.status != "unread" {
            return Err(WsError::Conflict(
                "Invite has already been processed".to_string(),
            ));
        }

        if let Some(n) = state.notifications.get_mut(&notification_id) {
            n.status = "dismissed".to_string();
        }

        Ok(InviteDeclined { data: invite.data })
    }

    async fn list_invites(
        &self,
        user_id: Uuid,
        include_expired: bool,
    ) -> WsResult<Vec<InviteView>> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut invites: Vec<_> = state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && n.is_active && n.status == "unread")
            .filter(|n| include_expired || n.expires_at.map(|e| e > now).unwrap_or(true))
            .cloned()
            .collect();
        invites.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(invites
            .into_iter()
            .map(|n| InviteView {
                id: n.id,
                title: n.title,
                message: n.message,
                data: n.data,
                status: n.status,
                created_at: n.created_at,
                expires_at: n.expires_at,
                is_expired: n.expires_at.map(|e| e < now).unwrap_or(false),
            })
            .collect())
    }

    async fn list_invitable_users(
        &self,
        requester: Uuid,
        space_id: Option<Uuid>,
    ) -> WsResult<Vec<UserRow>> {
        let state = self.state.lock();
        let mut users: Vec<_> = state
            .users
            .values()
            .filter(|u| u.id != requester && u.user_is_active)
            .filter(|u| match space_id {
                Some(space_id) => !state.is_member(u.id, space_id),
                None => true,
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, MessageStatus};

    #[tokio::test]
    async fn message_upsert_is_idempotent_on_id() {
        let store = MemStore::new();
        let sender = store.seed_user("ada");

        let mut message = Message {
            message_id: Uuid::new_v4(),
            sender_id: sender.id,
            kind: MessageKind::Space,
            content: "hi".into(),
            timestamp: Utc::now(),
            space_id: Some(Uuid::new_v4()),
            receiver_id: None,
            status: MessageStatus::Broadcast,
            retry_count: 0,
        };

        store.upsert_message(&message).await.unwrap();
        message.status = MessageStatus::Persisted;
        store.upsert_message(&message).await.unwrap();

        assert_eq!(store.message_count(), 1);
        let row = store.stored_message(message.message_id).unwrap();
        assert_eq!(row.status, MessageStatus::Persisted);
    }
}
