//! In-memory registry of live device sessions.
//!
//! One table keyed by `(app_id, machine_id)` plus a `session_id` index, both
//! behind a single lock. Every mutation and every read goes through that
//! lock, so there is exactly one live session per device at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use super::protocol::ServerMessage;

/// Live state of one authenticated connection.
#[derive(Debug)]
pub struct DeviceSession {
    pub app_id: String,
    pub device_id: String,
    pub machine_id: String,
    pub session_id: String,
    pub remote_addr: Option<String>,
    pub connected_at: i64,
    last_ping_at: AtomicI64,
}

impl DeviceSession {
    pub fn new(
        app_id: String,
        device_id: String,
        machine_id: String,
        session_id: String,
        remote_addr: Option<String>,
        connected_at: i64,
    ) -> Self {
        Self {
            app_id,
            device_id,
            machine_id,
            session_id,
            remote_addr,
            connected_at,
            last_ping_at: AtomicI64::new(connected_at),
        }
    }

    /// Record a sign of life from the device.
    pub fn touch(&self, now: i64) {
        self.last_ping_at.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_ping_at(&self) -> i64 {
        self.last_ping_at.load(Ordering::Relaxed)
    }
}

/// A row of `ListOnline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineDevice {
    pub device_id: String,
    pub machine_id: String,
    pub session_id: String,
    pub connected_at: i64,
    pub last_ping_at: i64,
}

impl From<&DeviceSession> for OnlineDevice {
    fn from(s: &DeviceSession) -> Self {
        Self {
            device_id: s.device_id.clone(),
            machine_id: s.machine_id.clone(),
            session_id: s.session_id.clone(),
            connected_at: s.connected_at,
            last_ping_at: s.last_ping_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeviceKey {
    app_id: String,
    machine_id: String,
}

struct Connection {
    session: Arc<DeviceSession>,
    outbound: mpsc::Sender<ServerMessage>,
}

#[derive(Default)]
struct RegistryInner {
    by_device: HashMap<DeviceKey, Connection>,
    by_session: HashMap<String, DeviceKey>,
}

/// Thread-safe registry of live sessions.
///
/// The registry holds the only sender of each session's outbound queue, so
/// removing a session (unregister or eviction) closes that queue and the
/// session's writer shuts down.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, evicting any existing session for the same
    /// device. Returns the evicted session.
    pub async fn register(
        &self,
        session: Arc<DeviceSession>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Option<Arc<DeviceSession>> {
        let key = DeviceKey {
            app_id: session.app_id.clone(),
            machine_id: session.machine_id.clone(),
        };

        let mut inner = self.inner.write().await;
        inner
            .by_session
            .insert(session.session_id.clone(), key.clone());
        let evicted = inner.by_device.insert(
            key,
            Connection {
                session: Arc::clone(&session),
                outbound,
            },
        );
        let evicted = evicted.map(|old| {
            inner.by_session.remove(&old.session.session_id);
            old.session
        });
        drop(inner);

        if let Some(old) = &evicted {
            info!(
                app_id = %session.app_id,
                machine_id = %session.machine_id,
                session_id = %session.session_id,
                evicted_session_id = %old.session_id,
                "Session replaced an older one"
            );
        } else {
            info!(
                app_id = %session.app_id,
                machine_id = %session.machine_id,
                session_id = %session.session_id,
                "Session registered"
            );
        }
        evicted
    }

    /// Remove a session by id. A session that was already evicted leaves
    /// its replacement untouched.
    pub async fn unregister(&self, session_id: &str) -> Option<Arc<DeviceSession>> {
        let mut inner = self.inner.write().await;
        let Some(key) = inner.by_session.remove(session_id) else {
            debug!(session_id = %session_id, "Session already gone");
            return None;
        };
        let current = inner
            .by_device
            .get(&key)
            .is_some_and(|conn| conn.session.session_id == session_id);
        let removed = if current {
            inner.by_device.remove(&key).map(|conn| conn.session)
        } else {
            None
        };
        drop(inner);

        if removed.is_some() {
            info!(
                app_id = %key.app_id,
                machine_id = %key.machine_id,
                session_id = %session_id,
                "Session unregistered"
            );
        }
        removed
    }

    /// Queue a message for one device without waiting. False if the device
    /// is offline or its queue is full; a full queue drops the message.
    pub async fn send_to_device(
        &self,
        app_id: &str,
        machine_id: &str,
        message: ServerMessage,
    ) -> bool {
        let key = DeviceKey {
            app_id: app_id.to_string(),
            machine_id: machine_id.to_string(),
        };
        let inner = self.inner.read().await;
        inner
            .by_device
            .get(&key)
            .is_some_and(|conn| enqueue(conn, message))
    }

    /// Queue a message for the device holding `session_id`.
    pub async fn send_to_session(&self, session_id: &str, message: ServerMessage) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_session
            .get(session_id)
            .and_then(|key| inner.by_device.get(key))
            .is_some_and(|conn| enqueue(conn, message))
    }

    /// Queue a message for every online device of an app. Returns how many
    /// queues accepted it.
    pub async fn broadcast_to_app(&self, app_id: &str, message: &ServerMessage) -> usize {
        let inner = self.inner.read().await;
        inner
            .by_device
            .iter()
            .filter(|(key, _)| key.app_id == app_id)
            .filter(|(_, conn)| enqueue(conn, message.clone()))
            .count()
    }

    pub async fn is_online(&self, app_id: &str, machine_id: &str) -> bool {
        let key = DeviceKey {
            app_id: app_id.to_string(),
            machine_id: machine_id.to_string(),
        };
        self.inner.read().await.by_device.contains_key(&key)
    }

    /// Online devices of an app, ordered by machine id.
    pub async fn list_online(&self, app_id: &str) -> Vec<OnlineDevice> {
        let mut online: Vec<OnlineDevice> = self
            .inner
            .read()
            .await
            .by_device
            .values()
            .filter(|conn| conn.session.app_id == app_id)
            .map(|conn| OnlineDevice::from(conn.session.as_ref()))
            .collect();
        online.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        online
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<DeviceSession>> {
        let inner = self.inner.read().await;
        inner
            .by_session
            .get(session_id)
            .and_then(|key| inner.by_device.get(key))
            .map(|conn| Arc::clone(&conn.session))
    }

    pub async fn online_count(&self) -> usize {
        self.inner.read().await.by_device.len()
    }
}

fn enqueue(conn: &Connection, message: ServerMessage) -> bool {
    match conn.outbound.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                session_id = %conn.session.session_id,
                machine_id = %conn.session.machine_id,
                "Outbound queue full, message dropped"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session(app: &str, machine: &str, session_id: &str) -> Arc<DeviceSession> {
        Arc::new(DeviceSession::new(
            app.into(),
            format!("dev-{machine}"),
            machine.into(),
            session_id.into(),
            None,
            100,
        ))
    }

    #[tokio::test]
    async fn register_and_send() {
        let registry = Registry::new();
        let (tx, mut rx) = mpsc::channel(4);
        assert!(registry.register(session("A", "M1", "s1"), tx).await.is_none());

        assert!(registry.is_online("A", "M1").await);
        assert!(!registry.is_online("A", "M2").await);
        assert!(!registry.is_online("B", "M1").await);

        assert!(registry.send_to_device("A", "M1", ServerMessage::Pong { ts: 1 }).await);
        assert!(matches!(rx.recv().await, Some(ServerMessage::Pong { ts: 1 })));
        assert!(!registry.send_to_device("A", "M2", ServerMessage::Pong { ts: 1 }).await);
    }

    #[tokio::test]
    async fn second_session_evicts_the_first() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        registry.register(session("A", "M1", "s1"), tx1).await;
        let evicted = registry.register(session("A", "M1", "s2"), tx2).await;
        assert_eq!(evicted.unwrap().session_id, "s1");

        let online = registry.list_online("A").await;
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].session_id, "s2");

        // The evicted session's queue is closed.
        assert!(rx1.recv().await.is_none());
        assert!(registry.session("s1").await.is_none());
        assert!(!registry.send_to_session("s1", ServerMessage::Pong { ts: 1 }).await);
    }

    #[tokio::test]
    async fn stale_unregister_keeps_the_replacement() {
        let registry = Registry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        registry.register(session("A", "M1", "s1"), tx1).await;
        registry.register(session("A", "M1", "s2"), tx2).await;

        assert!(registry.unregister("s1").await.is_none());
        assert!(registry.is_online("A", "M1").await);

        assert_eq!(registry.unregister("s2").await.unwrap().session_id, "s2");
        assert!(!registry.is_online("A", "M1").await);
        assert_eq!(registry.online_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let registry = Registry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(session("A", "M1", "s1"), tx).await;

        assert!(registry.send_to_device("A", "M1", ServerMessage::Pong { ts: 1 }).await);
        assert!(!registry.send_to_device("A", "M1", ServerMessage::Pong { ts: 1 }).await);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_app() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        registry.register(session("A", "M1", "s1"), tx1).await;
        registry.register(session("A", "M2", "s2"), tx2).await;
        registry.register(session("B", "M1", "s3"), tx3).await;

        assert_eq!(registry.broadcast_to_app("A", &ServerMessage::Pong { ts: 1 }).await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());

        let machines: Vec<_> = registry
            .list_online("A")
            .await
            .into_iter()
            .map(|d| d.machine_id)
            .collect();
        assert_eq!(machines, ["M1", "M2"]);
    }

    #[test]
    fn touch_only_moves_forward() {
        let s = session("A", "M1", "s1");
        assert_eq!(s.last_ping_at(), 100);
        s.touch(150);
        s.touch(120);
        assert_eq!(s.last_ping_at(), 150);
    }
}
