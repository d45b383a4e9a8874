//! One-shot transports.
//!
//! A transport carries one encoded batch to the server and returns the
//! encoded reply. It holds no state between calls.

use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// One encoded batch on its way to the server.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub body: Bytes,
    pub content_type: &'static str,
}

/// A stateless request/response call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: TransportRequest) -> Result<Bytes, ClientError>;
}

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Path accepting batches.
    pub path: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout, covering the whole call.
    pub request_timeout: Duration,
}

impl HttpConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            path: "/rpc".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// POSTs each batch over a fresh HTTP/1.1 connection.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpConfig,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    async fn post(&self, request: TransportRequest) -> Result<Bytes, ClientError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("HTTP connection error: {}", e);
            }
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.config.path.as_str())
            .header(HOST, self.config.addr.to_string())
            .header(CONTENT_TYPE, request.content_type)
            .body(Full::new(request.body))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        tracing::debug!("POST http://{}{}", self.config.addr, self.config.path);
        let response = sender.send_request(req).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(ClientError::Transport(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: TransportRequest) -> Result<Bytes, ClientError> {
        tokio::time::timeout(self.config.request_timeout, self.post(request))
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// Transport backed by an async closure, for in-process servers.
pub struct FnTransport<F> {
    f: F,
}

impl<F> FnTransport<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(TransportRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, ClientError>> + Send + 'static,
{
    async fn call(&self, request: TransportRequest) -> Result<Bytes, ClientError> {
        (self.f)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_transport_passes_body_through() {
        let transport = FnTransport::new(|request: TransportRequest| async move {
            assert_eq!(request.content_type, "application/json");
            Ok::<_, ClientError>(request.body)
        });
        let reply = transport
            .call(TransportRequest {
                body: Bytes::from_static(b"[]"),
                content_type: "application/json",
            })
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"[]");
    }

    #[test]
    fn test_http_config_builder() {
        let config = HttpConfig::new("127.0.0.1:7420".parse().unwrap())
            .with_path("/api/rpc")
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(config.path, "/api/rpc");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_http_transport_connection_refused() {
        // Bind then drop to obtain a port with no listener.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(HttpConfig::new(addr));
        let result = transport
            .call(TransportRequest {
                body: Bytes::new(),
                content_type: "application/json",
            })
            .await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, ClientError::Io(_)));
    }
}
