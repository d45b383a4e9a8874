//! High-level client API.

use crate::error::ClientError;
use crate::protocol::{ActionProtocol, ResponseSink};
use crate::transport::{HttpConfig, HttpTransport, Transport};
use async_trait::async_trait;
use onecall_protocol::{
    Cause, ExitEncoded, FromClient, FromServer, RequestId, Serialization, SerializationKind,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Waiter for the outcome of one request.
enum Pending {
    Unary(oneshot::Sender<Result<Value, ClientError>>),
    Stream(mpsc::UnboundedSender<Result<Value, ClientError>>),
}

impl Pending {
    fn fail(self, error: ClientError) {
        match self {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(error));
            }
            Pending::Stream(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// Requests awaiting their exit.
#[derive(Default)]
struct Inflight {
    pending: Mutex<HashMap<RequestId, Pending>>,
}

impl Inflight {
    fn dispatch(&self, message: FromServer) -> Result<(), ClientError> {
        match message {
            FromServer::Chunk { request_id, values } => {
                let id = request_id.parse()?;
                match self.pending.lock().get(&id) {
                    Some(Pending::Stream(tx)) => {
                        for value in values {
                            let _ = tx.send(Ok(value));
                        }
                    }
                    Some(Pending::Unary(_)) => {
                        tracing::debug!("Ignoring chunk for unary request {}", id);
                    }
                    None => tracing::debug!("Chunk for unknown request {}", id),
                }
            }
            FromServer::Exit { request_id, exit } => {
                let id = request_id.parse()?;
                let Some(pending) = self.pending.lock().remove(&id) else {
                    tracing::debug!("Exit for unknown request {}", id);
                    return Ok(());
                };
                match (pending, exit) {
                    (Pending::Unary(tx), ExitEncoded::Success { value }) => {
                        let _ = tx.send(Ok(value));
                    }
                    // Dropping the sender ends the stream.
                    (Pending::Stream(_), ExitEncoded::Success { .. }) => {}
                    (pending, ExitEncoded::Failure { cause }) => pending.fail(match cause {
                        Cause::Fail { error } => ClientError::Application { error },
                        Cause::Die { defect } => ClientError::defect(&defect),
                        Cause::Interrupt => ClientError::Interrupted,
                    }),
                }
            }
            FromServer::Defect { defect } => {
                tracing::warn!("Server defect: {}", defect);
                let failed: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
                for pending in failed {
                    pending.fail(ClientError::defect(&defect));
                }
            }
        }
        Ok(())
    }

    fn register(self: &Arc<Self>, id: RequestId, pending: Pending) -> PendingGuard {
        self.pending.lock().insert(id, pending);
        PendingGuard {
            inflight: self.clone(),
            id,
        }
    }

    /// Fails a request that is still waiting once its batch has been replayed.
    fn settle(&self, id: RequestId) {
        if let Some(pending) = self.pending.lock().remove(&id) {
            tracing::warn!("Reply carried no exit for request {}", id);
            pending.fail(ClientError::MissingExit(id));
        }
    }
}

#[async_trait]
impl ResponseSink for Inflight {
    async fn write_response(&self, message: FromServer) -> Result<(), ClientError> {
        self.dispatch(message)
    }
}

/// Removes a pending entry when its call is abandoned.
struct PendingGuard {
    inflight: Arc<Inflight>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inflight.pending.lock().remove(&self.id);
    }
}

/// Chunks of a streaming response.
pub struct ResponseStream {
    request_id: RequestId,
    rx: mpsc::UnboundedReceiver<Result<Value, ClientError>>,
}

impl ResponseStream {
    /// Returns the next chunk value, the error the request exited with, or
    /// `None` after a successful exit.
    pub async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        self.rx.recv().await
    }

    /// Collects every chunk value, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<Value>, ClientError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// High-level client for onecall.
///
/// A `Defect` carries no request id, so one arriving in any reply fails every
/// call still pending on this client, including calls sent in other batches.
pub struct Client {
    protocol: ActionProtocol,
    inflight: Arc<Inflight>,
    next_id: AtomicU64,
}

impl Client {
    /// Creates a client over any transport.
    pub fn new(transport: Arc<dyn Transport>, serialization: Arc<dyn Serialization>) -> Self {
        let inflight = Arc::new(Inflight::default());
        Self {
            protocol: ActionProtocol::new(transport, serialization, inflight.clone()),
            inflight,
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a client posting batches over HTTP.
    pub fn http(config: HttpConfig, serialization: SerializationKind) -> Self {
        Self::new(Arc::new(HttpTransport::new(config)), serialization.build())
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Calls a unary method and returns its success value.
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, ClientError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        let _guard = self.inflight.register(id, Pending::Unary(tx));

        self.protocol
            .send(FromClient::request(id, method, payload))
            .await?;
        self.inflight.settle(id);

        rx.await.map_err(|_| ClientError::MissingExit(id))?
    }

    /// Calls a unary method with typed payload and result.
    pub async fn call_typed<P, S>(&self, method: &str, payload: &P) -> Result<S, ClientError>
    where
        P: Serialize + ?Sized,
        S: DeserializeOwned,
    {
        let value = self.call(method, serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Calls a streaming method.
    ///
    /// The reply arrives in one batch, so the returned stream is already
    /// complete when this resolves.
    pub async fn stream(&self, method: &str, payload: Value) -> Result<ResponseStream, ClientError> {
        let id = self.next_request_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let _guard = self.inflight.register(id, Pending::Stream(tx));

        self.protocol
            .send(FromClient::request(id, method, payload))
            .await?;
        self.inflight.settle(id);

        Ok(ResponseStream { request_id: id, rx })
    }

    /// Number of calls awaiting their exit.
    pub fn pending(&self) -> usize {
        self.inflight.pending.lock().len()
    }

    pub fn protocol(&self) -> &ActionProtocol {
        &self.protocol
    }
}
