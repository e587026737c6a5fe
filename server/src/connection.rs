//! Connection handles.
//!
//! A [`Connection`] wraps the outbound half of a client's text-frame
//! channel. The socket task drains the paired receiver into the real
//! transport; everything else in the fabric only ever holds the handle,
//! so fan-out and direct sends never block on socket I/O.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{WsError, WsResult};
use crate::events::{encode_event, UserEvent};

/// Session state attached to a connection. Set on `join`, cleared when
/// the parser's cleanup path runs.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub user_id: Option<Uuid>,
    pub space_id: Option<Uuid>,
    pub authenticated: bool,
    pub last_activity: DateTime<Utc>,
}

impl Default for ConnInfo {
    fn default() -> Self {
        Self {
            user_id: None,
            space_id: None,
            authenticated: false,
            last_activity: Utc::now(),
        }
    }
}

pub struct Connection {
    id: Uuid,
    outbound: mpsc::UnboundedSender<String>,
    info: Mutex<ConnInfo>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection handle and the receiver its socket task
    /// drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            outbound: tx,
            info: Mutex::new(ConnInfo::default()),
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a text frame for the socket task.
    pub fn send_text(&self, frame: String) -> WsResult<()> {
        if self.closed.is_cancelled() {
            return Err(WsError::TransportClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| WsError::TransportClosed)
    }

    pub fn send_event<T: Serialize>(&self, event: &T) -> WsResult<()> {
        self.send_text(encode_event(event)?)
    }

    /// Best-effort `error` reply; a closed transport is not an error
    /// here.
    pub fn send_error(&self, message: impl Into<String>) {
        let _ = self.send_event(&UserEvent::Error {
            message: message.into(),
        });
    }

    pub fn touch(&self) {
        self.info.lock().last_activity = Utc::now();
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.info.lock().user_id
    }

    pub fn space_id(&self) -> Option<Uuid> {
        self.info.lock().space_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.info.lock().authenticated
    }

    pub fn set_session(&self, user_id: Option<Uuid>, space_id: Option<Uuid>, authenticated: bool) {
        let mut info = self.info.lock();
        info.user_id = user_id;
        info.space_id = space_id;
        info.authenticated = authenticated;
    }

    pub fn clear_space(&self) {
        self.info.lock().space_id = None;
    }

    /// Close the connection. The socket task watches the token and
    /// shuts the transport; subsequent sends fail.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (conn, mut rx) = Connection::new();
        conn.send_text("hello".into()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn close_makes_sends_fail() {
        let (conn, _rx) = Connection::new();
        conn.close();
        assert!(matches!(
            conn.send_text("late".into()),
            Err(WsError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_is_transport_closed() {
        let (conn, rx) = Connection::new();
        drop(rx);
        assert!(matches!(
            conn.send_text("gone".into()),
            Err(WsError::TransportClosed)
        ));
    }

    #[test]
    fn session_state_updates() {
        let (conn, _rx) = Connection::new();
        assert!(!conn.is_authenticated());
        let user = Uuid::new_v4();
        let space = Uuid::new_v4();
        conn.set_session(Some(user), Some(space), true);
        assert_eq!(conn.user_id(), Some(user));
        assert_eq!(conn.space_id(), Some(space));
        assert!(conn.is_authenticated());
        conn.clear_space();
        assert_eq!(conn.space_id(), None);
    }
}
