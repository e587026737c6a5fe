//! Per-space broadcaster.
//!
//! One `SpaceBroadcaster` owns everything scoped to a space: who is
//! present and where, the subscriber list, the outbound update queue,
//! and the single fan-out loop that drains it. All mutation happens from
//! the broadcast loop and the parser tasks this broadcaster spawned, so
//! one lock per concern is enough.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::ChatManager;
use crate::config::{BROADCAST_WAIT, DEFAULT_MAP_ID};
use crate::connection::Connection;
use crate::error::{WsError, WsResult};
use crate::events::{encode_event, SpaceEvent};
use crate::media::MediaRegistry;
use crate::models::{Position, UserSnapshot};
use crate::router::SpaceRouter;
use crate::store::Store;

/// One queued fan-out. `exclude` suppresses delivery to the originating
/// connection and is popped before serialization, so it never reaches
/// the wire.
#[derive(Debug)]
pub struct SpaceUpdate {
    pub event: SpaceEvent,
    pub exclude: Option<Uuid>,
}

impl SpaceUpdate {
    pub fn new(event: SpaceEvent) -> Self {
        Self {
            event,
            exclude: None,
        }
    }

    pub fn excluding(event: SpaceEvent, conn_id: Uuid) -> Self {
        Self {
            event,
            exclude: Some(conn_id),
        }
    }
}

/// Cloneable handle onto a broadcaster's update queue. Enqueueing is
/// non-blocking; it fails only once the consuming loop is gone.
#[derive(Clone)]
pub struct SpaceQueue {
    tx: mpsc::UnboundedSender<SpaceUpdate>,
}

impl SpaceQueue {
    pub fn new(tx: mpsc::UnboundedSender<SpaceUpdate>) -> Self {
        Self { tx }
    }

    pub fn enqueue(&self, update: SpaceUpdate) -> WsResult<()> {
        self.tx.send(update).map_err(|_| WsError::ChannelClosed)
    }
}

/// Who is in the space and where. `positions` holds an entry exactly for
/// the keys of `users`.
#[derive(Default)]
pub struct Presence {
    users: HashMap<Uuid, UserSnapshot>,
    positions: HashMap<Uuid, Position>,
}

impl Presence {
    pub fn contains(&self, user_id: Uuid) -> bool {
        self.users.contains_key(&user_id)
    }

    pub fn user_name(&self, user_id: Uuid) -> String {
        self.users
            .get(&user_id)
            .map(|u| u.user_name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn insert(&mut self, snapshot: UserSnapshot) {
        self.insert_at(snapshot, Position::default());
    }

    pub fn insert_at(&mut self, snapshot: UserSnapshot, position: Position) {
        let id = snapshot.id;
        self.users.insert(id, snapshot);
        self.positions.insert(id, position);
    }

    /// Seed a user loaded from the store; keeps an existing live
    /// position.
    pub fn seed(&mut self, snapshot: UserSnapshot) {
        let id = snapshot.id;
        self.users.insert(id, snapshot);
        self.positions.entry(id).or_default();
    }

    pub fn set_position(&mut self, user_id: Uuid, position: Position) {
        self.positions.insert(user_id, position);
    }

    pub fn position(&self, user_id: Uuid) -> Option<Position> {
        self.positions.get(&user_id).copied()
    }

    pub fn remove(&mut self, user_id: Uuid) {
        self.users.remove(&user_id);
        self.positions.remove(&user_id);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn users_snapshot(&self) -> BTreeMap<Uuid, UserSnapshot> {
        self.users.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    pub fn positions_snapshot(&self) -> BTreeMap<Uuid, Position> {
        self.positions.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

pub struct SpaceBroadcaster {
    space_id: Uuid,
    store: Arc<dyn Store>,
    router: Arc<SpaceRouter>,
    queue: SpaceQueue,
    updates_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SpaceUpdate>>>,
    presence: Arc<Mutex<Presence>>,
    map_id: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Arc<Connection>>>,
    parser_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    broadcast_task: AsyncMutex<Option<JoinHandle<()>>>,
    chat: ChatManager,
    media: MediaRegistry,
}

impl SpaceBroadcaster {
    pub fn new(space_id: Uuid, store: Arc<dyn Store>, router: Arc<SpaceRouter>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = SpaceQueue::new(tx);
        let presence = Arc::new(Mutex::new(Presence::default()));

        let chat = ChatManager::new(store.clone(), router.clone(), queue.clone());
        let media = MediaRegistry::new(space_id, queue.clone(), router.clone(), presence.clone());

        Arc::new(Self {
            space_id,
            store,
            router,
            queue,
            updates_rx: AsyncMutex::new(Some(rx)),
            presence,
            map_id: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            parser_tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            broadcast_task: AsyncMutex::new(None),
            chat,
            media,
        })
    }

    pub fn space_id(&self) -> Uuid {
        self.space_id
    }

    pub fn chat(&self) -> &ChatManager {
        &self.chat
    }

    pub fn media(&self) -> &MediaRegistry {
        &self.media
    }

    pub fn queue(&self) -> SpaceQueue {
        self.queue.clone()
    }

    pub fn presence(&self) -> &Arc<Mutex<Presence>> {
        &self.presence
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn router(&self) -> Arc<SpaceRouter> {
        self.router.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    pub fn enqueue(&self, update: SpaceUpdate) -> WsResult<()> {
        self.queue.enqueue(update)
    }

    /// Admit a connection and spawn its parser task over `inbound`.
    /// Idempotent per connection: a repeat call leaves the existing
    /// parser in place.
    pub fn add_subscriber(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) {
        {
            let subscribers = self.subscribers.lock();
            if subscribers.iter().any(|c| c.id() == conn.id()) {
                warn!(space = %self.space_id, conn = %conn.id(), "connection already subscribed");
                return;
            }
        }

        debug!(space = %self.space_id, conn = %conn.id(), "starting parser for subscriber");
        let task = crate::spaces::ConnectionParser::spawn(self.clone(), conn.clone(), inbound);
        self.subscribers.lock().push(conn.clone());
        self.parser_tasks.lock().insert(conn.id(), task);
    }

    /// Route-layer cleanup once a connection's socket is gone: drop it
    /// from the subscriber set and wait for its parser to finish its
    /// cleanup path.
    pub async fn remove_subscriber(&self, conn: &Connection) {
        self.subscribers.lock().retain(|c| c.id() != conn.id());
        let task = self.parser_tasks.lock().remove(&conn.id());
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(space = %self.space_id, error = %err, "parser task panicked");
                }
            }
        }
    }

    /// Atomic check-and-start of the fan-out loop. The first start loads
    /// the space's member roster from the store and initializes the chat
    /// sub-component.
    pub async fn start_if_not_running(self: &Arc<Self>) -> WsResult<()> {
        let mut slot = self.broadcast_task.lock().await;
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
        }

        self.init_data().await;
        self.running.store(true, Ordering::SeqCst);

        let rx = self
            .updates_rx
            .lock()
            .await
            .take()
            .ok_or(WsError::ChannelClosed)?;
        info!(space = %self.space_id, "starting broadcast loop");
        *slot = Some(tokio::spawn(self.clone().run(rx)));
        self.chat.initialize().await;
        Ok(())
    }

    /// Load everyone the store says is in this space, at the origin
    /// position.
    async fn init_data(&self) {
        match self.store.get_users_in_space(self.space_id).await {
            Ok(users) => {
                let mut presence = self.presence.lock();
                for user in &users {
                    presence.seed(user.snapshot());
                }
                info!(space = %self.space_id, users = users.len(), "space initialized");
            }
            Err(err) => {
                error!(space = %self.space_id, error = %err, "failed to load space roster");
            }
        }
    }

    /// Resolve the space's map id lazily, once, from the store.
    pub async fn ensure_map_id(&self) -> String {
        if let Some(map_id) = self.map_id.lock().clone() {
            return map_id;
        }

        let resolved = match self.store.get_space(self.space_id).await {
            Ok(Some(space)) => space
                .map_image_url
                .unwrap_or_else(|| DEFAULT_MAP_ID.to_string()),
            Ok(None) => {
                warn!(space = %self.space_id, "space row missing, using default map");
                DEFAULT_MAP_ID.to_string()
            }
            Err(err) => {
                warn!(space = %self.space_id, error = %err, "space lookup failed, using default map");
                DEFAULT_MAP_ID.to_string()
            }
        };

        let mut slot = self.map_id.lock();
        if slot.is_none() {
            *slot = Some(resolved.clone());
        }
        slot.clone().unwrap_or(resolved)
    }

    /// Single-consumer drain of the update queue. The bounded wait keeps
    /// the loop responsive to shutdown without busy-spinning.
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SpaceUpdate>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(BROADCAST_WAIT, rx.recv()) => next,
            };
            match next {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(update)) => self.fan_out(update),
            }
        }
        info!(space = %self.space_id, "broadcast loop stopped");
    }

    /// Serialize once, deliver to every subscriber except the excluded
    /// one, and sweep out connections whose send failed.
    fn fan_out(&self, update: SpaceUpdate) {
        let subscribers: Vec<Arc<Connection>> = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            return;
        }

        let SpaceUpdate { event, exclude } = update;
        let frame = match encode_event(&event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(space = %self.space_id, error = %err, "failed to serialize update");
                return;
            }
        };

        let mut disconnected = Vec::new();
        for subscriber in &subscribers {
            if Some(subscriber.id()) == exclude {
                continue;
            }
            if let Err(err) = subscriber.send_text(frame.clone()) {
                warn!(space = %self.space_id, conn = %subscriber.id(), error = %err, "send failed");
                disconnected.push(subscriber.id());
            }
        }

        if !disconnected.is_empty() {
            self.subscribers
                .lock()
                .retain(|c| !disconnected.contains(&c.id()));
        }
    }

    /// Tear the broadcaster down: stop the loop, cancel any remaining
    /// parser tasks, clear per-space state, and deregister from the
    /// router if the registry entry still points here.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        if let Some(task) = self.broadcast_task.lock().await.take() {
            let _ = task.await;
        }

        let parsers: Vec<(Uuid, JoinHandle<()>)> =
            self.parser_tasks.lock().drain().collect();
        for (_, task) in parsers {
            task.abort();
        }
        self.subscribers.lock().clear();

        self.chat.cleanup().await;

        if self.router.remove_space_if(self.space_id, self) {
            info!(space = %self.space_id, "broadcaster deregistered");
        }
    }
}
