//! Multiplexing sessions and their teardown.
//!
//! A session lives exactly as long as one transport call. [`SessionGuard`]
//! owns its registration: dropping the guard removes it on every exit path,
//! and if the session never completed, every request it opened is
//! interrupted in the engine.

use crate::engine::RequestSink;
use crate::metrics::Metrics;
use crate::registry::{Outbound, SessionId, SessionRegistry};
use onecall_protocol::{FromClient, RequestId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Owner of one session's registration.
pub struct SessionGuard {
    id: SessionId,
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn RequestSink>,
    open_requests: BTreeSet<RequestId>,
    done: bool,
    released: bool,
    opened_at: Instant,
    metrics: Option<Arc<Metrics>>,
}

impl SessionGuard {
    /// Registers a new session and returns the guard with the read half of
    /// its response buffer.
    pub fn open(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn RequestSink>,
        metrics: Option<Arc<Metrics>>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (id, outbound) = registry.create();
        if let Some(ref metrics) = metrics {
            metrics.sessions_total.inc();
            metrics.sessions_active.inc();
        }
        let guard = Self {
            id,
            registry,
            engine,
            open_requests: BTreeSet::new(),
            done: false,
            released: false,
            opened_at: Instant::now(),
            metrics,
        };
        (guard, outbound)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Forwards one client message into the engine, recording request ids.
    pub fn forward(&mut self, message: FromClient) {
        if let FromClient::Request { ref id, .. } = message {
            match id.parse() {
                Ok(id) => {
                    self.open_requests.insert(id);
                }
                Err(e) => tracing::debug!("Session {}: untracked request: {}", self.id, e),
            }
        }
        self.engine.write_request(self.id, message);
    }

    /// Ids of every request forwarded so far.
    pub fn open_requests(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.open_requests.iter().copied()
    }

    /// Marks the session as fully drained. Teardown then skips interrupts.
    pub fn complete(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.registry.remove(self.id);
        if !self.done && !self.open_requests.is_empty() {
            tracing::warn!(
                "Session {} torn down with {} open request(s); interrupting",
                self.id,
                self.open_requests.len()
            );
            for id in std::mem::take(&mut self.open_requests) {
                self.engine.write_request(self.id, FromClient::interrupt(id));
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.sessions_active.dec();
            metrics
                .session_duration
                .observe(self.opened_at.elapsed().as_secs_f64());
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(SessionId, FromClient)>>,
    }

    impl RequestSink for Recorder {
        fn write_request(&self, session: SessionId, message: FromClient) {
            self.seen.lock().push((session, message));
        }
    }

    impl Recorder {
        fn interrupts(&self) -> Vec<RequestId> {
            self.seen
                .lock()
                .iter()
                .filter_map(|(_, msg)| match msg {
                    FromClient::Interrupt { request_id } => request_id.parse().ok(),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_abandoned_session_interrupts_open_requests() {
        let registry = Arc::new(SessionRegistry::default());
        let recorder = Arc::new(Recorder::default());

        {
            let (mut guard, _outbound) =
                SessionGuard::open(registry.clone(), recorder.clone(), None);
            guard.forward(FromClient::request(RequestId::new(1), "A", json!(null)));
            guard.forward(FromClient::request(RequestId::new(2), "B", json!(null)));
            assert_eq!(registry.len(), 1);
        }

        assert_eq!(
            recorder.interrupts(),
            vec![RequestId::new(1), RequestId::new(2)]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_completed_session_sends_no_interrupts() {
        let registry = Arc::new(SessionRegistry::default());
        let recorder = Arc::new(Recorder::default());

        {
            let (mut guard, _outbound) =
                SessionGuard::open(registry.clone(), recorder.clone(), None);
            guard.forward(FromClient::request(RequestId::new(1), "A", json!(null)));
            guard.complete();
            assert!(guard.is_done());
        }

        assert!(recorder.interrupts().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_runs_once() {
        let registry = Arc::new(SessionRegistry::default());
        let recorder = Arc::new(Recorder::default());
        let mut disconnects = registry.disconnects().unwrap();

        let (mut guard, _outbound) = SessionGuard::open(registry.clone(), recorder.clone(), None);
        guard.forward(FromClient::request(RequestId::new(5), "A", json!(null)));
        guard.release();
        drop(guard);

        assert_eq!(recorder.interrupts(), vec![RequestId::new(5)]);
        assert_eq!(disconnects.try_recv().ok(), Some(0));
        assert!(disconnects.try_recv().is_err());
    }

    #[test]
    fn test_forward_preserves_order() {
        let registry = Arc::new(SessionRegistry::default());
        let recorder = Arc::new(Recorder::default());
        let (mut guard, _outbound) = SessionGuard::open(registry, recorder.clone(), None);

        guard.forward(FromClient::request(RequestId::new(2), "A", json!(null)));
        guard.forward(FromClient::Eof);
        guard.complete();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(session, _)| *session == guard.id()));
        assert_eq!(seen[1].1, FromClient::Eof);
        assert_eq!(guard.open_requests().collect::<Vec<_>>(), vec![RequestId::new(2)]);
    }
}
