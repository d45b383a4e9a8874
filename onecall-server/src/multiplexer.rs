//! Server side of the one-shot adapter.
//!
//! [`ActionHandler::handle`] turns one transport call into one session: it
//! decodes the batch, forwards every message into the shared engine, adds a
//! synthetic `Eof`, and drains the session buffer until the engine signals
//! that every request has exited.

use crate::engine::RequestSink;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::{Outbound, SessionId, SessionRegistry};
use crate::session::SessionGuard;
use bytes::Bytes;
use onecall_protocol::{expect_batch, FromClient, FromServer, ProtocolError, Serialization};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Entry point invoked once per transport call.
pub struct ActionHandler {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn RequestSink>,
    serialization: Arc<dyn Serialization>,
    session_timeout: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
}

impl ActionHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn RequestSink>,
        serialization: Arc<dyn Serialization>,
    ) -> Self {
        Self {
            registry,
            engine,
            serialization,
            session_timeout: None,
            metrics: None,
        }
    }

    /// Bounds how long a session may wait for its responses.
    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn serialization(&self) -> &Arc<dyn Serialization> {
        &self.serialization
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs one session over an encoded batch and returns the encoded responses.
    ///
    /// Malformed input is answered with a single `Defect` response rather
    /// than an error. Dropping the returned future tears the session down and
    /// interrupts every request it opened.
    pub async fn handle(&self, data: &[u8]) -> Result<Vec<Value>, ServerError> {
        let (mut session, mut outbound) = SessionGuard::open(
            self.registry.clone(),
            self.engine.clone(),
            self.metrics.clone(),
        );
        let id = session.id();

        match self.decode(data) {
            Ok(messages) => {
                tracing::debug!("Session {}: {} message(s)", id, messages.len());
                for message in messages {
                    session.forward(message);
                }
            }
            Err(e) => {
                tracing::warn!("Session {}: undecodable batch: {}", id, e);
                if let Some(ref metrics) = self.metrics {
                    metrics.decode_defects_total.inc();
                }
                self.registry.send(id, FromServer::defect(e));
            }
        }
        session.forward(FromClient::Eof);

        let responses = match self.session_timeout {
            Some(timeout) => tokio::time::timeout(timeout, drain(id, &mut outbound))
                .await
                .map_err(|_| ServerError::SessionTimeout {
                    session_id: id,
                    timeout,
                })??,
            None => drain(id, &mut outbound).await?,
        };

        session.complete();
        Ok(responses)
    }

    /// Like [`handle`](Self::handle), but encodes the responses into a body.
    pub async fn handle_bytes(&self, data: &[u8]) -> Result<Bytes, ServerError> {
        let responses = self.handle(data).await?;
        Ok(self.serialization.encode(&responses)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<FromClient>, ProtocolError> {
        let batch = expect_batch(self.serialization.decode(data)?)?;
        batch
            .into_iter()
            .map(|message| serde_json::from_value(message).map_err(ProtocolError::from))
            .collect()
    }
}

/// Collects responses until the end signal.
async fn drain(
    session: SessionId,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Result<Vec<Value>, ServerError> {
    let mut responses = Vec::new();
    loop {
        match outbound.recv().await {
            Some(Outbound::Message(message)) => responses.push(serde_json::to_value(&message)?),
            Some(Outbound::End) => return Ok(responses),
            None => return Err(ServerError::SessionClosed(session)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RpcServer;
    use crate::handler::HandlerRegistry;
    use onecall_protocol::{Json, RequestId};
    use parking_lot::Mutex;
    use serde_json::json;

    fn handler_with_engine() -> ActionHandler {
        let registry = Arc::new(SessionRegistry::new(false));
        let handlers = HandlerRegistry::new()
            .unary("Echo", |input: Value, _ctx| async move { Ok::<_, ()>(input) });
        let engine = Arc::new(RpcServer::new(handlers, registry.clone()));
        ActionHandler::new(registry, engine, Arc::new(Json))
    }

    fn batch(messages: &[FromClient]) -> Vec<u8> {
        serde_json::to_vec(messages).unwrap()
    }

    /// Engine that answers nothing and records what it receives.
    #[derive(Default)]
    struct Silent {
        seen: Mutex<Vec<FromClient>>,
    }

    impl RequestSink for Silent {
        fn write_request(&self, _session: SessionId, message: FromClient) {
            self.seen.lock().push(message);
        }
    }

    #[tokio::test]
    async fn test_echo_batch() {
        let handler = handler_with_engine();
        let body = batch(&[FromClient::request(RequestId::new(1), "Echo", json!("x"))]);

        let responses = handler.handle(&body).await.unwrap();
        assert_eq!(
            responses,
            vec![json!({
                "_tag": "Exit",
                "requestId": "1",
                "exit": {"_tag": "Success", "value": "x"}
            })]
        );
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_n_requests_yield_n_exits() {
        let handler = handler_with_engine();
        let requests: Vec<FromClient> = (1..=5)
            .map(|i| FromClient::request(RequestId::new(i), "Echo", json!(i)))
            .collect();

        let responses = handler.handle(&batch(&requests)).await.unwrap();
        assert_eq!(responses.len(), 5);
        assert!(responses.iter().all(|r| r["_tag"] == "Exit"));
    }

    #[tokio::test]
    async fn test_repeated_request_id_gets_one_exit() {
        let registry = Arc::new(SessionRegistry::new(false));
        let handlers = HandlerRegistry::new().unary("Slow", |input: Value, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ()>(input)
        });
        let engine = Arc::new(RpcServer::new(handlers, registry.clone()));
        let handler = ActionHandler::new(registry, engine, Arc::new(Json));

        let body = batch(&[
            FromClient::request(RequestId::new(1), "Slow", json!("a")),
            FromClient::request(RequestId::new(1), "Slow", json!("b")),
            FromClient::request(RequestId::new(1), "Missing", Value::Null),
        ]);
        let responses = handler.handle(&body).await.unwrap();
        assert_eq!(
            responses,
            vec![json!({
                "_tag": "Exit",
                "requestId": "1",
                "exit": {"_tag": "Success", "value": "a"}
            })]
        );
    }

    #[tokio::test]
    async fn test_malformed_bytes_yield_single_defect() {
        let handler = handler_with_engine();
        let responses = handler.handle(b"{not json").await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["_tag"], "Defect");
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_non_array_document_is_a_defect() {
        let handler = handler_with_engine();
        let responses = handler.handle(br#"{"_tag":"Eof"}"#).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["_tag"], "Defect");
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty_array() {
        let handler = handler_with_engine();
        let body = handler.handle_bytes(b"[]").await.unwrap();
        assert_eq!(body.as_ref(), b"[]");
    }

    #[tokio::test]
    async fn test_timeout_interrupts_open_requests() {
        let registry = Arc::new(SessionRegistry::default());
        let engine = Arc::new(Silent::default());
        let handler = ActionHandler::new(registry.clone(), engine.clone(), Arc::new(Json))
            .with_session_timeout(Some(Duration::from_millis(20)));

        let body = batch(&[
            FromClient::request(RequestId::new(1), "A", Value::Null),
            FromClient::request(RequestId::new(2), "B", Value::Null),
        ]);
        let result = handler.handle(&body).await;
        assert!(matches!(result, Err(ServerError::SessionTimeout { .. })));

        let interrupts = engine
            .seen
            .lock()
            .iter()
            .filter(|m| matches!(m, FromClient::Interrupt { .. }))
            .count();
        assert_eq!(interrupts, 2);
        assert!(registry.is_empty());
    }
}
