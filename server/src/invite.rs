//! Space invitations.
//!
//! Thin orchestration over the store's transactional invite operations:
//! expiry arithmetic, reply shaping, and pushing notification events to
//! whoever is online.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::WsResult;
use crate::events::UserEvent;
use crate::models::{InviteView, UserRow};
use crate::router::SpaceRouter;
use crate::store::{InviteAccepted, InviteCreated, InviteDeclined, Store};

pub struct InviteManager {
    store: Arc<dyn Store>,
    router: Arc<SpaceRouter>,
    expiry_hours: i64,
}

impl InviteManager {
    pub fn new(store: Arc<dyn Store>, router: Arc<SpaceRouter>, expiry_hours: i64) -> Self {
        Self {
            store,
            router,
            expiry_hours,
        }
    }

    /// Create an invite expiring `INVITE_EXPIRY_HOURS` from now. All
    /// preconditions are checked atomically by the store.
    pub async fn send_invite(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        space_id: Uuid,
    ) -> WsResult<InviteCreated> {
        let expires_at = Utc::now() + Duration::hours(self.expiry_hours);
        let created = self
            .store
            .create_invite(from_user_id, to_user_id, space_id, expires_at)
            .await?;
        info!(from = %from_user_id, to = %to_user_id, space = %space_id, "invite sent");
        Ok(created)
    }

    /// Accept an invite; idempotent for recipients who are already
    /// members. The inviter, if online, learns of the acceptance.
    pub async fn accept_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteAccepted> {
        let accepted = self.store.accept_invite(user_id, notification_id).await?;

        if let Some(inviter_conn) = self.router.lookup_user(accepted.data.from_user_id) {
            let user_name = self.display_name(user_id).await;
            let _ = inviter_conn.send_event(&UserEvent::SpaceInviteAccepted {
                space_id: accepted.space_id,
                space_name: accepted.space_name.clone(),
                user_id,
                user_name,
            });
        }

        info!(user = %user_id, space = %accepted.space_id, already_member = accepted.already_member, "invite accepted");
        Ok(accepted)
    }

    /// Decline an unread invite. The inviter, if online, learns of the
    /// decline.
    pub async fn decline_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteDeclined> {
        let declined = self.store.decline_invite(user_id, notification_id).await?;

        if let Some(inviter_conn) = self.router.lookup_user(declined.data.from_user_id) {
            let user_name = self.display_name(user_id).await;
            let _ = inviter_conn.send_event(&UserEvent::SpaceInviteDeclined {
                space_id: declined.data.space_id,
                space_name: declined.data.space_name.clone(),
                user_id,
                user_name,
            });
        }

        info!(user = %user_id, notification = %notification_id, "invite declined");
        Ok(declined)
    }

    pub async fn get_user_invites(
        &self,
        user_id: Uuid,
        include_expired: bool,
    ) -> WsResult<Vec<InviteView>> {
        self.store.list_invites(user_id, include_expired).await
    }

    pub async fn get_all_users(
        &self,
        requester: Uuid,
        space_id: Option<Uuid>,
    ) -> WsResult<Vec<UserRow>> {
        self.store.list_invitable_users(requester, space_id).await
    }

    async fn display_name(&self, user_id: Uuid) -> String {
        self.store
            .get_user(user_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.user_name)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Reply body for a freshly created invite.
pub fn invite_reply(created: &InviteCreated) -> Value {
    json!({
        "id": created.notification_id,
        "toUser": {
            "id": created.to_user_id,
            "username": created.to_user_name,
        },
        "fromUser": {
            "id": created.from_user_id,
            "username": created.from_user_name,
        },
        "space": {
            "id": created.space_id,
            "name": created.space_name,
        },
        "expiresAt": created.expires_at.to_rfc3339(),
    })
}
