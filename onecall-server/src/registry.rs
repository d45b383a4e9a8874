//! Session registry shared by the multiplexer and the engine.
//!
//! Each live session owns one unbounded, ordered response buffer. The engine
//! writes responses into it by session id and signals the end of the session
//! once every request has exited; the multiplexer drains it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use onecall_protocol::transform::normalize;
use onecall_protocol::FromServer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identifier of a multiplexing session.
pub type SessionId = u64;

/// Item carried by a session's response buffer.
#[derive(Debug)]
pub enum Outbound {
    /// One response, already normalized for the active serializer.
    Message(FromServer),
    /// Every request of the session has exited.
    End,
}

/// Write half of a session buffer.
struct SessionSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Table of live sessions keyed by session id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionSink>,
    next_id: AtomicU64,
    supports_big_int: bool,
    disconnect_tx: mpsc::UnboundedSender<SessionId>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
    /// Set once the disconnect stream has a consumer.
    disconnect_watched: AtomicBool,
}

impl SessionRegistry {
    /// Creates an empty registry.
    ///
    /// `supports_big_int` is the capability of the serializer that encodes
    /// the drained responses; ids are stringified on write when it is false.
    pub fn new(supports_big_int: bool) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            supports_big_int,
            disconnect_tx,
            disconnect_rx: Mutex::new(Some(disconnect_rx)),
            disconnect_watched: AtomicBool::new(false),
        }
    }

    /// Registers a fresh session and returns its id and the read half of its buffer.
    pub fn create(&self) -> (SessionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // Ids are never reused while still registered, even after wrap-around.
            if let Entry::Vacant(entry) = self.sessions.entry(id) {
                entry.insert(SessionSink { tx });
                tracing::debug!("Session {} registered", id);
                return (id, rx);
            }
        }
    }

    /// Writes one response into a session's buffer.
    ///
    /// Returns false when the session is no longer registered; the message is
    /// dropped.
    pub fn send(&self, session: SessionId, mut message: FromServer) -> bool {
        let Some(sink) = self.sessions.get(&session) else {
            tracing::debug!(
                "Dropping {:?} for unregistered session {}",
                message.request_id(),
                session
            );
            return false;
        };
        normalize(&mut message, self.supports_big_int);
        sink.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Signals that a session has no further responses.
    pub fn end(&self, session: SessionId) -> bool {
        match self.sessions.get(&session) {
            Some(sink) => sink.tx.send(Outbound::End).is_ok(),
            None => false,
        }
    }

    /// Removes a session and publishes its id on the disconnect stream.
    ///
    /// Nothing is published until [`disconnects`](Self::disconnects) has been
    /// taken. Returns false if the session was already removed.
    pub fn remove(&self, session: SessionId) -> bool {
        if self.sessions.remove(&session).is_none() {
            return false;
        }
        if self.disconnect_watched.load(Ordering::Acquire) {
            let _ = self.disconnect_tx.send(session);
        }
        tracing::debug!("Session {} removed", session);
        true
    }

    /// Takes the stream of disconnected session ids.
    ///
    /// The stream has a single consumer; later calls return `None`.
    pub fn disconnects(&self) -> Option<mpsc::UnboundedReceiver<SessionId>> {
        let rx = self.disconnect_rx.lock().take()?;
        self.disconnect_watched.store(true, Ordering::Release);
        Some(rx)
    }

    /// Returns whether a session is registered.
    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn supports_big_int(&self) -> bool {
        self.supports_big_int
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onecall_protocol::{RequestId, WireId};
    use serde_json::json;

    #[test]
    fn test_session_ids_increase_from_zero() {
        let registry = SessionRegistry::default();
        let (a, _rx_a) = registry.create();
        let (b, _rx_b) = registry.create();
        let (c, _rx_c) = registry.create();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_ids_not_reused_after_removal() {
        let registry = SessionRegistry::default();
        let (a, _rx) = registry.create();
        assert!(registry.remove(a));
        let (b, _rx) = registry.create();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_send_applies_transform() {
        let registry = SessionRegistry::new(false);
        let (id, mut rx) = registry.create();

        assert!(registry.send(id, FromServer::success(RequestId::new(5), json!("x"))));
        assert!(registry.end(id));

        match rx.recv().await {
            Some(Outbound::Message(msg)) => {
                assert_eq!(msg.request_id(), Some(&WireId::Str("5".to_string())));
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(Outbound::End)));
    }

    #[tokio::test]
    async fn test_big_int_registry_keeps_numbers() {
        let registry = SessionRegistry::new(true);
        let (id, mut rx) = registry.create();
        registry.send(id, FromServer::interrupted(RequestId::new(5)));

        match rx.recv().await {
            Some(Outbound::Message(msg)) => assert_eq!(msg.request_id(), Some(&WireId::Int(5))),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_publishes_disconnect_once() {
        let registry = SessionRegistry::default();
        let mut disconnects = registry.disconnects().unwrap();
        assert!(registry.disconnects().is_none());

        let (id, _rx) = registry.create();
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());

        assert_eq!(disconnects.recv().await, Some(id));
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removals_before_take_are_not_queued() {
        let registry = SessionRegistry::default();
        for _ in 0..3 {
            let (id, _rx) = registry.create();
            assert!(registry.remove(id));
        }

        let mut disconnects = registry.disconnects().unwrap();
        assert!(disconnects.try_recv().is_err());

        let (id, _rx) = registry.create();
        registry.remove(id);
        assert_eq!(disconnects.recv().await, Some(id));
    }

    #[test]
    fn test_send_to_unknown_session_is_dropped() {
        let registry = SessionRegistry::default();
        assert!(!registry.send(42, FromServer::defect("late")));
        assert!(!registry.end(42));
    }
}
