//! Process-wide routing registry.
//!
//! The `SpaceRouter` is the only cross-space mutable state in the
//! fabric: one map from space id to its live broadcaster, one map from
//! user id to their current connection. Both are mutated from many
//! parser tasks concurrently, so every read and write goes through the
//! CAS-style helpers here; no component caches a connection handle
//! across a suspension point without a fresh lookup.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::Connection;
use crate::spaces::SpaceBroadcaster;
use crate::store::Store;

/// Snapshot of router occupancy, reported on the readiness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub total_connections: usize,
    pub active_spaces: usize,
    pub space_subscribers: BTreeMap<Uuid, usize>,
}

pub struct SpaceRouter {
    spaces: DashMap<Uuid, Arc<SpaceBroadcaster>>,
    user_conns: DashMap<Uuid, Arc<Connection>>,
    store: Arc<dyn Store>,
}

impl SpaceRouter {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            spaces: DashMap::new(),
            user_conns: DashMap::new(),
            store,
        })
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Return the broadcaster for a space, creating it atomically if
    /// absent. A broadcaster mid-shutdown has already deregistered
    /// itself, so a new subscriber gets a fresh instance.
    pub fn get_or_create_space(self: &Arc<Self>, space_id: Uuid) -> Arc<SpaceBroadcaster> {
        self.spaces
            .entry(space_id)
            .or_insert_with(|| {
                info!(space = %space_id, "creating broadcaster");
                SpaceBroadcaster::new(space_id, self.store.clone(), Arc::clone(self))
            })
            .clone()
    }

    pub fn space(&self, space_id: Uuid) -> Option<Arc<SpaceBroadcaster>> {
        self.spaces.get(&space_id).map(|b| b.clone())
    }

    /// Bind a user to a connection; last writer wins. A superseded
    /// connection is closed so its parser unwinds.
    pub fn bind_user(&self, user_id: Uuid, conn: Arc<Connection>) {
        let conn_id = conn.id();
        if let Some(old) = self.user_conns.insert(user_id, conn) {
            if old.id() != conn_id {
                debug!(user = %user_id, "superseding previous connection");
                old.close();
            }
        }
    }

    /// Remove the mapping only if it still points at `conn`.
    pub fn unbind_user(&self, user_id: Uuid, conn: &Connection) -> bool {
        self.user_conns
            .remove_if(&user_id, |_, current| current.id() == conn.id())
            .is_some()
    }

    pub fn lookup_user(&self, user_id: Uuid) -> Option<Arc<Connection>> {
        self.user_conns.get(&user_id).map(|c| c.clone())
    }

    /// Deregister a broadcaster, but only if the registry entry still
    /// points at this instance.
    pub fn remove_space_if(&self, space_id: Uuid, broadcaster: &Arc<SpaceBroadcaster>) -> bool {
        self.spaces
            .remove_if(&space_id, |_, current| Arc::ptr_eq(current, broadcaster))
            .is_some()
    }

    pub fn stats(&self) -> RouterStats {
        let space_subscribers = self
            .spaces
            .iter()
            .map(|entry| (*entry.key(), entry.value().subscriber_count()))
            .collect();
        RouterStats {
            total_connections: self.user_conns.len(),
            active_spaces: self.spaces.len(),
            space_subscribers,
        }
    }

    /// Stop every broadcaster. Called once at process shutdown; queues
    /// are not drained.
    pub async fn shutdown_all(&self) {
        let broadcasters: Vec<Arc<SpaceBroadcaster>> =
            self.spaces.iter().map(|e| e.value().clone()).collect();
        info!(count = broadcasters.len(), "stopping all broadcasters");
        for broadcaster in broadcasters {
            broadcaster.stop().await;
        }
        self.user_conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    fn test_router() -> Arc<SpaceRouter> {
        SpaceRouter::new(Arc::new(MemStore::new()))
    }

    #[tokio::test]
    async fn get_or_create_space_reuses_instances() {
        let router = test_router();
        let space = Uuid::new_v4();
        let first = router.get_or_create_space(space);
        let second = router.get_or_create_space(space);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(router.stats().active_spaces, 1);
    }

    #[tokio::test]
    async fn bind_user_supersedes_and_closes_previous() {
        let router = test_router();
        let user = Uuid::new_v4();
        let (first, _rx1) = Connection::new();
        let (second, _rx2) = Connection::new();

        router.bind_user(user, first.clone());
        router.bind_user(user, second.clone());

        let current = router.lookup_user(user).unwrap();
        assert_eq!(current.id(), second.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn unbind_user_is_compare_and_swap() {
        let router = test_router();
        let user = Uuid::new_v4();
        let (first, _rx1) = Connection::new();
        let (second, _rx2) = Connection::new();

        router.bind_user(user, first.clone());
        router.bind_user(user, second.clone());

        // Stale unbind from the superseded connection must not remove
        // the live mapping.
        assert!(!router.unbind_user(user, &first));
        assert!(router.lookup_user(user).is_some());

        assert!(router.unbind_user(user, &second));
        assert!(router.lookup_user(user).is_none());
    }

    #[tokio::test]
    async fn concurrent_binds_leave_exactly_one_winner() {
        let router = test_router();
        let user = Uuid::new_v4();
        let (a, _rx_a) = Connection::new();
        let (b, _rx_b) = Connection::new();

        let ra = router.clone();
        let rb = router.clone();
        let (a2, b2) = (a.clone(), b.clone());
        let ta = tokio::spawn(async move { ra.bind_user(user, a2) });
        let tb = tokio::spawn(async move { rb.bind_user(user, b2) });
        ta.await.unwrap();
        tb.await.unwrap();

        let winner = router.lookup_user(user).expect("one connection bound");
        let (winner_conn, loser_conn) = if winner.id() == a.id() { (a, b) } else { (b, a) };
        assert!(!winner_conn.is_closed());
        assert!(loser_conn.is_closed());
    }

    #[tokio::test]
    async fn remove_space_if_requires_identity_match() {
        let router = test_router();
        let space = Uuid::new_v4();
        let first = router.get_or_create_space(space);
        assert!(router.remove_space_if(space, &first));

        // A new instance now owns the slot; the stale handle no longer
        // matches.
        let second = router.get_or_create_space(space);
        assert!(!router.remove_space_if(space, &first));
        assert!(router.remove_space_if(space, &second));
        assert!(router.space(space).is_none());
    }
}
