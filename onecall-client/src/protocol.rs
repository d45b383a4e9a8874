//! Client side of the one-shot adapter.
//!
//! Each request is sent as a one-element batch over its own transport call.
//! The reply array is replayed, in order, into the response sink.

use crate::error::ClientError;
use crate::transport::{Transport, TransportRequest};
use async_trait::async_trait;
use onecall_protocol::transform::normalize;
use onecall_protocol::{expect_batch, FromClient, FromServer, ProtocolError, Serialization};
use std::sync::Arc;

/// Receiver of decoded server messages.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn write_response(&self, message: FromServer) -> Result<(), ClientError>;
}

/// Adapter that carries client messages over a stateless transport.
pub struct ActionProtocol {
    transport: Arc<dyn Transport>,
    serialization: Arc<dyn Serialization>,
    sink: Arc<dyn ResponseSink>,
}

impl ActionProtocol {
    pub fn new(
        transport: Arc<dyn Transport>,
        serialization: Arc<dyn Serialization>,
        sink: Arc<dyn ResponseSink>,
    ) -> Self {
        Self {
            transport,
            serialization,
            sink,
        }
    }

    /// Sends one client message.
    ///
    /// Only `Request` travels; interrupts, acks and `Eof` have no transport
    /// to ride on and are dropped. Resolves once every response in the reply
    /// has been written to the sink.
    pub async fn send(&self, mut message: FromClient) -> Result<(), ClientError> {
        if !matches!(message, FromClient::Request { .. }) {
            tracing::trace!("Not sending {} over a one-shot transport", message.tag());
            return Ok(());
        }

        normalize(&mut message, self.serialization.supports_big_int());
        let body = self
            .serialization
            .encode(&[serde_json::to_value(&message)?])?;

        let reply = self
            .transport
            .call(TransportRequest {
                body,
                content_type: self.serialization.content_type(),
            })
            .await?;

        let responses = match expect_batch(self.serialization.decode(&reply)?) {
            Ok(responses) => responses,
            Err(ProtocolError::NotABatch(kind)) => {
                return Err(ClientError::ProtocolViolation(format!(
                    "expected an array of responses, got {}",
                    kind
                )))
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Replaying {} response(s)", responses.len());

        for response in responses {
            let message: FromServer = serde_json::from_value(response)
                .map_err(|e| ClientError::ProtocolViolation(format!("invalid response: {}", e)))?;
            self.sink.write_response(message).await?;
        }
        Ok(())
    }

    /// Acknowledgments cannot be carried.
    pub fn supports_ack(&self) -> bool {
        false
    }

    /// Transferable objects cannot be carried.
    pub fn supports_transferables(&self) -> bool {
        false
    }

    pub fn serialization(&self) -> &Arc<dyn Serialization> {
        &self.serialization
    }
}
