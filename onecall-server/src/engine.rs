//! Shared RPC engine.
//!
//! One engine serves every session. Requests run as tokio tasks; their
//! responses are written into the session registry under the session id they
//! arrived with. A session ends once its input is finished (`Eof`) and every
//! request it opened has exited.

use crate::handler::{HandlerError, HandlerRegistry, RequestContext};
use crate::metrics::Metrics;
use crate::registry::{SessionId, SessionRegistry};
use dashmap::DashMap;
use futures::FutureExt;
use onecall_protocol::{FromClient, FromServer, RequestId, WireId};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};

/// Inbound side of the engine.
///
/// Writes are synchronous so they can be issued from a `Drop` finalizer.
pub trait RequestSink: Send + Sync {
    fn write_request(&self, session: SessionId, message: FromClient);
}

/// Per-session engine state.
#[derive(Default)]
struct ClientState {
    running: HashMap<RequestId, AbortHandle>,
    /// Every id dispatched in the session; each gets at most one exit.
    seen: HashSet<RequestId>,
    eof: bool,
    ended: bool,
}

struct EngineState {
    registry: Arc<SessionRegistry>,
    clients: DashMap<SessionId, ClientState>,
    metrics: Option<Arc<Metrics>>,
}

impl EngineState {
    /// Runs `f` under the session's lock, then ends the session if its input
    /// is finished and nothing is left running.
    ///
    /// Returns `None` if the session has no state and `create` is false.
    fn update<R>(
        &self,
        session: SessionId,
        create: bool,
        f: impl FnOnce(&mut ClientState) -> R,
    ) -> Option<R> {
        let (result, ended) = {
            let mut state = if create {
                self.clients.entry(session).or_default()
            } else {
                self.clients.get_mut(&session)?
            };
            let result = f(&mut state);
            if state.eof && !state.ended && state.running.is_empty() {
                state.ended = true;
                self.registry.end(session);
                tracing::debug!("Session {} ended", session);
            }
            (result, state.ended)
        };
        if ended {
            self.clients.remove_if(&session, |_, state| state.ended);
        }
        Some(result)
    }

    /// Records the exit of a request unless it was already interrupted.
    fn complete(&self, session: SessionId, id: RequestId, exit: FromServer) {
        self.update(session, false, |state| {
            if state.running.remove(&id).is_some() {
                self.registry.send(session, exit);
            }
        });
    }

    fn interrupt(&self, session: SessionId, id: RequestId) -> bool {
        let interrupted = self
            .update(session, false, |state| match state.running.remove(&id) {
                Some(handle) => {
                    handle.abort();
                    self.registry.send(session, FromServer::interrupted(id));
                    true
                }
                None => false,
            })
            .unwrap_or(false);

        if interrupted {
            tracing::debug!("Interrupted request {} in session {}", id, session);
            if let Some(ref metrics) = self.metrics {
                metrics.interrupts_total.inc();
            }
        }
        interrupted
    }

    fn disconnect(&self, session: SessionId) {
        if let Some((_, state)) = self.clients.remove(&session) {
            for (id, handle) in state.running {
                tracing::debug!("Aborting request {} of disconnected session {}", id, session);
                handle.abort();
            }
        }
    }
}

/// Handle through which a streaming handler emits chunks.
#[derive(Clone)]
pub struct ChunkSink {
    target: Option<(SessionId, Arc<EngineState>)>,
    request_id: RequestId,
}

impl ChunkSink {
    /// Emits one value.
    ///
    /// Returns false once the request has exited or was interrupted.
    pub fn send(&self, value: Value) -> bool {
        self.send_all(vec![value])
    }

    /// Emits several values as one chunk.
    pub fn send_all(&self, values: Vec<Value>) -> bool {
        let Some((session, ref state)) = self.target else {
            return false;
        };
        let Some(client) = state.clients.get(&session) else {
            return false;
        };
        client.running.contains_key(&self.request_id)
            && state
                .registry
                .send(session, FromServer::chunk(self.request_id, values))
    }

    /// Serializes and emits one item.
    pub fn emit<T: Serialize>(&self, item: &T) -> bool {
        match serde_json::to_value(item) {
            Ok(value) => self.send(value),
            Err(e) => {
                tracing::warn!("Failed to encode chunk for request {}: {}", self.request_id, e);
                false
            }
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// A sink bound to no session; every send is dropped.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            target: None,
            request_id: RequestId::new(0),
        }
    }
}

/// The shared engine.
pub struct RpcServer {
    handlers: Arc<HandlerRegistry>,
    state: Arc<EngineState>,
}

impl RpcServer {
    /// Creates an engine writing responses into `registry`.
    ///
    /// Call [`start`](Self::start) so that state of sessions torn down early
    /// is released; until then the registry publishes no disconnects.
    pub fn new(handlers: HandlerRegistry, registry: Arc<SessionRegistry>) -> Self {
        Self::build(handlers, registry, None)
    }

    /// Creates an engine that records request and interrupt metrics.
    pub fn with_metrics(
        handlers: HandlerRegistry,
        registry: Arc<SessionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::build(handlers, registry, Some(metrics))
    }

    fn build(
        handlers: HandlerRegistry,
        registry: Arc<SessionRegistry>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            handlers: Arc::new(handlers),
            state: Arc::new(EngineState {
                registry,
                clients: DashMap::new(),
                metrics,
            }),
        }
    }

    /// Spawns the task that drops engine state of disconnected sessions.
    ///
    /// Returns `None` if the registry's disconnect stream was already taken.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut disconnects = self.state.registry.disconnects()?;
        let state = self.state.clone();
        Some(tokio::spawn(async move {
            while let Some(session) = disconnects.recv().await {
                state.disconnect(session);
            }
        }))
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    /// Number of requests still running in a session.
    pub fn running(&self, session: SessionId) -> usize {
        self.state
            .clients
            .get(&session)
            .map(|state| state.running.len())
            .unwrap_or(0)
    }

    fn dispatch(
        &self,
        session: SessionId,
        id: WireId,
        tag: String,
        payload: Value,
        headers: Vec<(String, String)>,
    ) {
        let registry = &self.state.registry;
        let id = match id.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Session {}: {}", session, e);
                registry.send(session, FromServer::defect(e));
                return;
            }
        };

        let method = self.handlers.get(&tag).cloned();
        let task_state = self.state.clone();

        self.state.update(session, true, |state| {
            if !state.seen.insert(id) {
                tracing::warn!(
                    "Session {}: dropping request {} {}, id already used",
                    session,
                    id,
                    tag
                );
                return;
            }
            let Some(method) = method else {
                tracing::debug!("Session {}: unknown method {}", session, tag);
                self.count_request("unknown");
                registry.send(session, FromServer::die(id, format!("unknown method: {}", tag)));
                return;
            };
            self.count_request(&tag);
            tracing::debug!("Session {}: request {} {}", session, id, tag);

            let ctx = RequestContext {
                session_id: session,
                request_id: id,
                headers,
            };
            let sink = ChunkSink {
                target: Some((session, task_state.clone())),
                request_id: id,
            };
            let task = tokio::spawn(async move {
                let outcome = AssertUnwindSafe(method.invoke(payload, ctx, sink))
                    .catch_unwind()
                    .await;
                let exit = match outcome {
                    Ok(Ok(value)) => FromServer::success(id, value),
                    Ok(Err(HandlerError::Failure(error))) => FromServer::failure(id, error),
                    Ok(Err(HandlerError::Defect(defect))) => FromServer::die(id, defect),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::warn!("Handler for {} panicked: {}", tag, message);
                        FromServer::die(id, message)
                    }
                };
                task_state.complete(session, id, exit);
            });
            state.running.insert(id, task.abort_handle());
        });
    }

    fn count_request(&self, method: &str) {
        if let Some(ref metrics) = self.state.metrics {
            metrics.requests_total.with_label_values(&[method]).inc();
        }
    }
}

impl RequestSink for RpcServer {
    fn write_request(&self, session: SessionId, message: FromClient) {
        match message {
            FromClient::Request {
                id,
                tag,
                payload,
                headers,
            } => self.dispatch(session, id, tag, payload, headers),
            FromClient::Interrupt { request_id } => match request_id.parse() {
                Ok(id) => {
                    self.state.interrupt(session, id);
                }
                Err(e) => tracing::warn!("Session {}: ignoring interrupt: {}", session, e),
            },
            FromClient::Eof => {
                self.state.update(session, true, |state| state.eof = true);
            }
            FromClient::Ack { .. } => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
