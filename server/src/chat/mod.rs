//! Chat pipeline: validate → authenticate → cache → broadcast → persist.
//!
//! Persistence is deliberately last and asynchronous: the sender gets
//! their broadcast as soon as the event is queued, and the store write
//! retries in the background. A broadcast failure rolls the cache entry
//! back so no message can reach the store without having been broadcast
//! first.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CACHE_BACKOFF, CACHE_RETRIES, MAX_CONTENT_LEN, PERSIST_BACKOFF, PERSIST_RETRIES};
use crate::error::{WsError, WsResult};
use crate::events::{ChatMessageData, SpaceEvent, UserEvent};
use crate::models::{Message, MessageKind, MessageStatus};
use crate::router::SpaceRouter;
use crate::spaces::{SpaceQueue, SpaceUpdate};
use crate::store::Store;

pub mod cache;

use cache::{message_key, CacheBackend, MokaBackend};

/// Pipeline counters, exported on the stats surface and mirrored to the
/// process metrics.
#[derive(Default)]
pub struct PipelineStats {
    total_processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub retries: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

pub struct MessagePipeline {
    store: Arc<dyn Store>,
    router: Arc<SpaceRouter>,
    cache: Arc<dyn CacheBackend>,
    queue: SpaceQueue,
    stats: Arc<PipelineStats>,
    dead_letters: Arc<Mutex<Vec<Message>>>,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn Store>,
        router: Arc<SpaceRouter>,
        cache: Arc<dyn CacheBackend>,
        queue: SpaceQueue,
    ) -> Self {
        Self {
            store,
            router,
            cache,
            queue,
            stats: Arc::new(PipelineStats::default()),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Messages whose persistence retries were exhausted, held for
    /// operator inspection.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.dead_letters.lock().clone()
    }

    /// Run a message through the full pipeline. Returns the assigned
    /// message id once the broadcast stage has succeeded; persistence
    /// continues in the background.
    pub async fn process_message(
        &self,
        data: ChatMessageData,
        kind: MessageKind,
    ) -> WsResult<Uuid> {
        let mut message = validate(data, kind)?;

        self.authenticate(&message).await?;

        if self.cache_with_retry(&mut message).await {
            message.status = MessageStatus::Cached;
        } else {
            warn!(message_id = %message.message_id, "cache failed, continuing without it");
        }

        if let Err(err) = self.broadcast(&message).await {
            self.rollback(&mut message).await;
            metrics::counter!("chat_messages_failed_total", 1);
            return Err(err);
        }
        message.status = MessageStatus::Broadcast;

        self.spawn_persist(message.clone());

        self.stats.total_processed.fetch_add(1, Ordering::Relaxed);
        self.stats.successful.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("chat_messages_processed_total", 1);
        Ok(message.message_id)
    }

    async fn authenticate(&self, message: &Message) -> WsResult<()> {
        let sender = self.store.get_user(message.sender_id).await?;
        if sender.is_none() {
            return Err(WsError::Authentication("sender not found".to_string()));
        }
        match message.kind {
            MessageKind::Space => {
                let space_id = message.space_id.expect("validated space message");
                if self.store.get_space(space_id).await?.is_none() {
                    return Err(WsError::Authentication("space not found".to_string()));
                }
            }
            MessageKind::Private => {
                let receiver_id = message.receiver_id.expect("validated private message");
                if self.store.get_user(receiver_id).await?.is_none() {
                    return Err(WsError::Authentication("receiver not found".to_string()));
                }
            }
        }
        Ok(())
    }

    async fn cache_with_retry(&self, message: &Message) -> bool {
        let key = message_key(message.message_id);
        let payload = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(err) => {
                error!(message_id = %message.message_id, error = %err, "message serialization failed");
                return false;
            }
        };

        for attempt in 1..=CACHE_RETRIES {
            match self.cache.save(&key, payload.clone()).await {
                Ok(()) => {
                    debug!(message_id = %message.message_id, attempt, "message cached");
                    return true;
                }
                Err(err) => {
                    warn!(message_id = %message.message_id, attempt, error = %err, "cache attempt failed");
                    if attempt < CACHE_RETRIES {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("chat_message_retries_total", 1);
                        tokio::time::sleep(CACHE_BACKOFF * attempt).await;
                    }
                }
            }
        }
        false
    }

    async fn broadcast(&self, message: &Message) -> WsResult<()> {
        match message.kind {
            MessageKind::Space => self.broadcast_space(message).await,
            MessageKind::Private => self.send_private(message).await,
        }
    }

    async fn broadcast_space(&self, message: &Message) -> WsResult<()> {
        let space_id = message.space_id.expect("validated space message");
        let user_name = self
            .store
            .get_user(message.sender_id)
            .await?
            .map(|u| u.user_name)
            .unwrap_or_else(|| "Unknown".to_string());

        self.queue.enqueue(SpaceUpdate::new(SpaceEvent::ChatMessage {
            space_id,
            message_id: message.message_id,
            user_id: message.sender_id,
            user_name,
            message: message.content.clone(),
            timestamp: message.timestamp,
        }))?;
        info!(message_id = %message.message_id, space = %space_id, "space message queued");
        Ok(())
    }

    /// Deliver a private message. The receiver event and sender
    /// confirmation are sent in that order; an offline or unreachable
    /// party is skipped without failing the pipeline.
    async fn send_private(&self, message: &Message) -> WsResult<()> {
        let receiver_id = message.receiver_id.expect("validated private message");
        let from_user_name = self
            .store
            .get_user(message.sender_id)
            .await?
            .map(|u| u.user_name)
            .unwrap_or_else(|| "Unknown".to_string());

        if let Some(receiver_conn) = self.router.lookup_user(receiver_id) {
            let event = UserEvent::PrivateMessage {
                user_id: receiver_id,
                message_id: message.message_id,
                message: message.content.clone(),
                timestamp: message.timestamp,
                from_user_id: Some(message.sender_id),
                from_user_name: Some(from_user_name),
                to_user_id: None,
                sent: None,
            };
            if let Err(err) = receiver_conn.send_event(&event) {
                warn!(receiver = %receiver_id, error = %err, "failed to deliver private message");
            }
        }

        if let Some(sender_conn) = self.router.lookup_user(message.sender_id) {
            let confirmation = UserEvent::PrivateMessage {
                user_id: message.sender_id,
                message_id: message.message_id,
                message: message.content.clone(),
                timestamp: message.timestamp,
                from_user_id: None,
                from_user_name: None,
                to_user_id: Some(receiver_id),
                sent: Some(true),
            };
            if let Err(err) = sender_conn.send_event(&confirmation) {
                warn!(sender = %message.sender_id, error = %err, "failed to confirm private message");
            }
        }

        info!(message_id = %message.message_id, receiver = %receiver_id, "private message sent");
        Ok(())
    }

    async fn rollback(&self, message: &mut Message) {
        warn!(message_id = %message.message_id, "rolling back message");
        if let Err(err) = self.cache.delete(&message_key(message.message_id)).await {
            error!(message_id = %message.message_id, error = %err, "rollback cache delete failed");
        }
        message.status = MessageStatus::RolledBack;
    }

    /// Detached persistence with linear back-off. The client already has
    /// its broadcast; exhausted retries only land the message in the
    /// dead-letter queue.
    fn spawn_persist(&self, message: Message) {
        let store = self.store.clone();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let dead_letters = self.dead_letters.clone();

        tokio::spawn(async move {
            let mut record = message;
            record.status = MessageStatus::Persisted;

            for attempt in 1..=PERSIST_RETRIES {
                match store.upsert_message(&record).await {
                    Ok(()) => {
                        info!(message_id = %record.message_id, attempt, "message persisted");
                        if let Err(err) = cache.delete(&message_key(record.message_id)).await {
                            warn!(message_id = %record.message_id, error = %err, "cache delete after persist failed");
                        }
                        return;
                    }
                    Err(err) => {
                        error!(message_id = %record.message_id, attempt, error = %err, "persistence attempt failed");
                        if attempt < PERSIST_RETRIES {
                            record.retry_count = attempt;
                            stats.retries.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("chat_message_retries_total", 1);
                            tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
                        }
                    }
                }
            }

            error!(message_id = %record.message_id, "persistence retries exhausted");
            stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("chat_messages_failed_total", 1);
            record.status = MessageStatus::Failed;
            record.retry_count = PERSIST_RETRIES;
            dead_letters.lock().push(record);
        });
    }
}

fn validate(data: ChatMessageData, kind: MessageKind) -> WsResult<Message> {
    let sender_id = data
        .sender_id
        .ok_or_else(|| WsError::Validation("sender_id is required".to_string()))?;

    let content = data
        .content
        .ok_or_else(|| WsError::Validation("content is required".to_string()))?;
    let length = content.chars().count();
    if length == 0 || length > MAX_CONTENT_LEN {
        return Err(WsError::Validation(format!(
            "content must be between 1 and {MAX_CONTENT_LEN} characters"
        )));
    }

    let (space_id, receiver_id) = match kind {
        MessageKind::Space => {
            let space_id = data
                .space_id
                .ok_or_else(|| WsError::Validation("space_id required for space messages".to_string()))?;
            (Some(space_id), None)
        }
        MessageKind::Private => {
            let receiver_id = data.receiver_id.ok_or_else(|| {
                WsError::Validation("receiver_id required for private messages".to_string())
            })?;
            (None, Some(receiver_id))
        }
    };

    Ok(Message {
        message_id: Uuid::new_v4(),
        sender_id,
        kind,
        content,
        timestamp: chrono::Utc::now(),
        space_id,
        receiver_id,
        status: MessageStatus::Validated,
        retry_count: 0,
    })
}

/// Per-space chat entry point owned by the broadcaster.
pub struct ChatManager {
    pipeline: MessagePipeline,
    initialized: std::sync::atomic::AtomicBool,
}

impl ChatManager {
    pub fn new(store: Arc<dyn Store>, router: Arc<SpaceRouter>, queue: SpaceQueue) -> Self {
        Self::with_cache_backend(store, router, queue, Arc::new(MokaBackend::default()))
    }

    pub fn with_cache_backend(
        store: Arc<dyn Store>,
        router: Arc<SpaceRouter>,
        queue: SpaceQueue,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            pipeline: MessagePipeline::new(store, router, cache, queue),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(
                backend = self.pipeline.cache.backend_name(),
                "chat manager initialized"
            );
        }
    }

    pub async fn handle_space_message(&self, mut data: ChatMessageData, space_id: Uuid) -> WsResult<Uuid> {
        data.space_id = Some(space_id);
        self.pipeline.process_message(data, MessageKind::Space).await
    }

    pub async fn handle_private_message(&self, data: ChatMessageData) -> WsResult<Uuid> {
        self.pipeline.process_message(data, MessageKind::Private).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats()
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.pipeline.dead_letters()
    }

    pub async fn cleanup(&self) {
        debug!("chat manager cleaned up");
    }
}
