//! Postgres-backed [`Store`].
//!
//! Queries assume the canonical schema: `users` (with `user_name` /
//! `user_is_active` columns), `spaces`, `user_spaces`, `messages` keyed
//! on `message_id`, and `notifications` with a jsonb `data` payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use uuid::Uuid;

use crate::config::DbConfig;
use crate::error::{WsError, WsResult};
use crate::models::{InviteData, InviteView, Message, SpaceRow, UserRow};

use super::{invite_texts, InviteAccepted, InviteCreated, InviteDeclined, Store};

pub type DbPool = PgPool;

/// Initialize the connection pool from configuration.
pub async fn init_pool(config: &DbConfig) -> WsResult<DbPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url())
        .await
        .map_err(WsError::from)
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

const USER_COLUMNS: &str = "id, user_name, email, role, user_designation, user_avatar_url, \
     user_is_active, user_created_at, user_updated_at";

fn message_from_parts(
    message_id: Uuid,
    sender_id: Uuid,
    message_type: String,
    content: String,
    timestamp: DateTime<Utc>,
    space_id: Option<Uuid>,
    receiver_id: Option<Uuid>,
    status: String,
) -> WsResult<Message> {
    Ok(Message {
        message_id,
        sender_id,
        kind: message_type.parse().map_err(WsError::Backend)?,
        content,
        timestamp,
        space_id,
        receiver_id,
        status: status.parse().map_err(WsError::Backend)?,
        retry_count: 0,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn get_user(&self, id: Uuid) -> WsResult<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_space(&self, id: Uuid) -> WsResult<Option<SpaceRow>> {
        let space = sqlx::query_as::<_, SpaceRow>(
            r#"
            SELECT id, name, description, map_image_url, admin_user_id,
                   is_public, max_users, is_active, created_at, updated_at
            FROM spaces
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(space)
    }

    async fn get_users_in_space(&self, space_id: Uuid) -> WsResult<Vec<UserRow>> {
        let users = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.user_name, u.email, u.role, u.user_designation,
                   u.user_avatar_url, u.user_is_active, u.user_created_at, u.user_updated_at
            FROM user_spaces us
            JOIN users u ON us.user_id = u.id
            WHERE us.space_id = $1
            ORDER BY us.joined_at ASC
            "#,
        )
        .bind(space_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn user_has_space_access(&self, user_id: Uuid, space_id: Uuid) -> WsResult<bool> {
        let has_access = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT CASE
                WHEN EXISTS(SELECT 1 FROM user_spaces WHERE user_id = $1 AND space_id = $2) THEN true
                WHEN EXISTS(SELECT 1 FROM spaces WHERE id = $2 AND is_active = true
                            AND (is_public = true OR admin_user_id = $1)) THEN true
                ELSE false
            END
            "#,
        )
        .bind(user_id)
        .bind(space_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(has_access)
    }

    async fn upsert_message(&self, message: &Message) -> WsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, sender_id, message_type, content,
                timestamp, space_id, receiver_id, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (message_id)
            DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(message.message_id)
        .bind(message.sender_id)
        .bind(message.kind.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(message.space_id)
        .bind(message.receiver_id)
        .bind(message.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> WsResult<Option<Message>> {
        type Row = (
            Uuid,
            Uuid,
            String,
            String,
            DateTime<Utc>,
            Option<Uuid>,
            Option<Uuid>,
            String,
        );
        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT message_id, sender_id, message_type, content,
                   timestamp, space_id, receiver_id, status
            FROM messages
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, sender, kind, content, ts, space, receiver, status)| {
            message_from_parts(id, sender, kind, content, ts, space, receiver, status)
        })
        .transpose()
    }

    async fn create_invite(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        space_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> WsResult<InviteCreated> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Sender must be admin or member of an active space; pull the
        // live member count in the same query.
        let space = sqlx::query_as::<_, (Uuid, String, i32, i64)>(
            r#"
            SELECT s.id, s.name, s.max_users,
                   (SELECT COUNT(*) FROM user_spaces WHERE space_id = s.id) AS current_users
            FROM spaces s
            LEFT JOIN user_spaces us ON s.id = us.space_id AND us.user_id = $1
            WHERE s.id = $2 AND s.is_active = true
              AND (s.admin_user_id = $1 OR us.user_id IS NOT NULL)
            "#,
        )
        .bind(from_user_id)
        .bind(space_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            WsError::Authorization(
                "You do not have access to this space or space does not exist".to_string(),
            )
        })?;

        let (_, space_name, max_users, current_users) = space;
        if current_users >= max_users as i64 {
            return Err(WsError::Conflict("Space is full".to_string()));
        }

        let recipient = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, user_name FROM users WHERE id = $1 AND user_is_active = true",
        )
        .bind(to_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WsError::NotFound("Recipient user does not exist".to_string()))?;

        let existing_member = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM user_spaces WHERE user_id = $1 AND space_id = $2",
        )
        .bind(to_user_id)
        .bind(space_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing_member.is_some() {
            return Err(WsError::Conflict(
                "User is already a member of this space".to_string(),
            ));
        }

        let pending = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM notifications
            WHERE user_id = $1 AND type = 'invites'
              AND data->>'spaceId' = $2
              AND status = 'unread'
              AND is_active = true
              AND (expires_at IS NULL OR expires_at > $3)
            "#,
        )
        .bind(to_user_id)
        .bind(space_id.to_string())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if pending.is_some() {
            return Err(WsError::Conflict(
                "A pending invite already exists for this user and space".to_string(),
            ));
        }

        let sender = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, user_name FROM users WHERE id = $1 AND user_is_active = true",
        )
        .bind(from_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WsError::NotFound("Sender user does not exist".to_string()))?;

        let notification_id = Uuid::new_v4();
        let data = InviteData {
            space_id,
            space_name: space_name.clone(),
            from_user_id,
            from_username: sender.1.clone(),
            invite_type: "space_invite".to_string(),
        };
        let (title, message) = invite_texts(&sender.1, &space_name);

        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, user_id, type, title, message, data, status,
                 expires_at, is_active, created_at, updated_at)
            VALUES ($1, $2, 'invites', $3, $4, $5, 'unread', $6, true, $7, $7)
            "#,
        )
        .bind(notification_id)
        .bind(to_user_id)
        .bind(&title)
        .bind(&message)
        .bind(Json(&data))
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(InviteCreated {
            notification_id,
            to_user_id,
            to_user_name: recipient.1,
            from_user_id,
            from_user_name: sender.1,
            space_id,
            space_name,
            expires_at,
        })
    }

    async fn accept_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteAccepted> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let invite = sqlx::query_as::<_, (Uuid, Json<InviteData>, Option<DateTime<Utc>>, String)>(
            r#"
            SELECT id, data, expires_at, status
            FROM notifications
            WHERE id = $1 AND user_id = $2 AND type = 'invites' AND is_active = true
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WsError::NotFound("Invite not found".to_string()))?;

        let (_, Json(data), expires_at, status) = invite;
        if status != "unread" {
            return Err(WsError::Conflict(
                "Invite has already been processed".to_string(),
            ));
        }

        if let Some(expiry) = expires_at {
            if expiry < now {
                sqlx::query(
                    "UPDATE notifications SET status = 'dismissed', updated_at = $2 WHERE id = $1",
                )
                .bind(notification_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Err(WsError::Conflict("Invite has expired".to_string()));
            }
        }

        let space_id = data.space_id;
        let space = sqlx::query_as::<_, (Uuid, String, i32, i64)>(
            r#"
            SELECT id, name, max_users,
                   (SELECT COUNT(*) FROM user_spaces WHERE space_id = $1) AS current_users
            FROM spaces
            WHERE id = $1 AND is_active = true
            "#,
        )
        .bind(space_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            WsError::NotFound("Space no longer exists or is inactive".to_string())
        })?;

        let (_, space_name, max_users, current_users) = space;

        let already_member = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM user_spaces WHERE user_id = $1 AND space_id = $2",
        )
        .bind(user_id)
        .bind(space_id)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();

        if already_member {
            sqlx::query(
                "UPDATE notifications SET status = 'read', updated_at = $2 WHERE id = $1",
            )
            .bind(notification_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(InviteAccepted {
                space_id,
                space_name,
                already_member: true,
                data,
            });
        }

        if current_users >= max_users as i64 {
            return Err(WsError::Conflict("Space is now full".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO user_spaces (user_id, space_id, joined_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, space_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(space_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE notifications SET status = 'read', updated_at = $2 WHERE id = $1")
            .bind(notification_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(InviteAccepted {
            space_id,
            space_name,
            already_member: false,
            data,
        })
    }

    async fn decline_invite(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> WsResult<InviteDeclined> {
        let invite = sqlx::query_as::<_, (Uuid, String, Json<InviteData>)>(
            r#"
            SELECT id, status, data
            FROM notifications
            WHERE id = $1 AND user_id = $2 AND type = 'invites' AND is_active = true
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WsError::NotFound("Invite not found".to_string()))?;

        let (_, status, Json(data)) = invite;
        if status != "unread" {
            return Err(WsError::Conflict(
                "Invite has already been processed".to_string(),
            ));
        }

        sqlx::query("UPDATE notifications SET status = 'dismissed', updated_at = $2 WHERE id = $1")
            .bind(notification_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(InviteDeclined { data })
    }

    async fn list_invites(
        &self,
        user_id: Uuid,
        include_expired: bool,
    ) -> WsResult<Vec<InviteView>> {
        let now = Utc::now();
        let mut query = String::from(
            "SELECT id, title, message, data, status, created_at, expires_at \
             FROM notifications \
             WHERE user_id = $1 AND type = 'invites' AND is_active = true \
             AND status = 'unread'",
        );
        if !include_expired {
            query.push_str(" AND (expires_at IS NULL OR expires_at > $2)");
        }
        query.push_str(" ORDER BY created_at DESC");

        type Row = (
            Uuid,
            String,
            String,
            Json<InviteData>,
            String,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
        );
        let mut q = sqlx::query_as::<_, Row>(&query).bind(user_id);
        if !include_expired {
            q = q.bind(now);
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, title, message, Json(data), status, created_at, expires_at)| InviteView {
                    id,
                    title,
                    message,
                    data,
                    status,
                    created_at,
                    expires_at,
                    is_expired: expires_at.map(|e| e < now).unwrap_or(false),
                },
            )
            .collect())
    }

    async fn list_invitable_users(
        &self,
        requester: Uuid,
        space_id: Option<Uuid>,
    ) -> WsResult<Vec<UserRow>> {
        let users = match space_id {
            Some(space_id) => {
                sqlx::query_as::<_, UserRow>(
                    r#"
                    SELECT u.id, u.user_name, u.email, u.role, u.user_designation,
                           u.user_avatar_url, u.user_is_active, u.user_created_at, u.user_updated_at
                    FROM users u
                    WHERE u.id != $1
                      AND u.user_is_active = true
                      AND NOT EXISTS (
                          SELECT 1 FROM user_spaces us
                          WHERE us.user_id = u.id AND us.space_id = $2
                      )
                    ORDER BY u.user_name
                    "#,
                )
                .bind(requester)
                .bind(space_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {USER_COLUMNS} FROM users \
                     WHERE id != $1 AND user_is_active = true \
                     ORDER BY user_name"
                ))
                .bind(requester)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(users)
    }
}
