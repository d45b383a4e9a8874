//! HTTP front end.
//!
//! Every `POST` to the RPC path is one transport call: the body is handed to
//! [`ActionHandler::handle_bytes`] and the encoded responses are returned.
//! A client that disconnects mid-call drops the handler future, which tears
//! the session down and interrupts its requests.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::multiplexer::ActionHandler;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Path accepting batches.
    pub rpc_path: String,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("rpc_path", &self.rpc_path)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_network(&NetworkConfig::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            rpc_path: network.rpc_path.clone(),
            max_body_bytes: network.max_body_bytes,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// State shared by every connection.
struct HttpContext {
    handler: Arc<ActionHandler>,
    rpc_path: String,
    max_body_bytes: usize,
    metrics: Option<Arc<Metrics>>,
    stats: Arc<ServerStats>,
}

/// HTTP server for onecall.
pub struct Server {
    config: ServerConfig,
    context: Arc<HttpContext>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, handler: Arc<ActionHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(ServerStats::default());
        let context = Arc::new(HttpContext {
            handler,
            rpc_path: config.rpc_path.clone(),
            max_body_bytes: config.max_body_bytes,
            metrics: config.metrics.clone(),
            stats: stats.clone(),
        });
        Self {
            config,
            context,
            stats,
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on http://{}{}",
            local_addr,
            self.config.rpc_path
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let context = self.context.clone();
                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::debug!("Client connected: {}", addr);
                                let _ = tcp_stream.set_nodelay(true);
                                let io = TokioIo::new(tcp_stream);
                                let service = service_fn(move |req| {
                                    let context = context.clone();
                                    async move { route(req, context).await }
                                });
                                let conn = http1::Builder::new().serve_connection(io, service);
                                tokio::pin!(conn);

                                let result = tokio::select! {
                                    result = conn.as_mut() => result,
                                    _ = conn_shutdown.recv() => {
                                        conn.as_mut().graceful_shutdown();
                                        conn.await
                                    }
                                };
                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::debug!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signals the server and its connections to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn route<B>(
    req: Request<B>,
    context: Arc<HttpContext>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, path) if path == context.rpc_path => rpc(req, &context).await,
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "OK"),
        (&Method::GET, "/metrics") => match context.metrics {
            Some(ref metrics) => match metrics.encode() {
                Ok(body) => respond(
                    StatusCode::OK,
                    "text/plain; version=0.0.4; charset=utf-8",
                    body,
                ),
                Err(e) => error_response(&ServerError::Metrics(e)),
            },
            None => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        },
        (_, path) if path == context.rpc_path => {
            respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed")
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

async fn rpc<B>(req: Request<B>, context: &HttpContext) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    context.stats.requests_total.fetch_add(1, Ordering::Relaxed);

    let body = match Limited::new(req.into_body(), context.max_body_bytes)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = if e.downcast_ref::<LengthLimitError>().is_some() {
                ServerError::BodyTooLarge {
                    max: context.max_body_bytes,
                }
            } else {
                ServerError::InvalidRequest(e.to_string())
            };
            context.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            return error_response(&err);
        }
    };

    match context.handler.handle_bytes(&body).await {
        Ok(encoded) => respond(
            StatusCode::OK,
            context.handler.serialization().content_type(),
            encoded,
        ),
        Err(e) => {
            tracing::warn!("Batch failed: {}", e);
            context.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            error_response(&e)
        }
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn error_response(err: &ServerError) -> Response<Full<Bytes>> {
    respond(err.status_code(), "text/plain", err.to_string())
}
