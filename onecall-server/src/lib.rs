//! # onecall-server
//!
//! Server half of the onecall adapter.
//!
//! This crate provides:
//! - A session multiplexer that turns one transport call into one session
//! - Teardown that interrupts every request of an abandoned session
//! - A shared engine running typed method handlers as tokio tasks
//! - An HTTP front end with health and Prometheus endpoints

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, SessionConfig};
pub use engine::{ChunkSink, RequestSink, RpcServer};
pub use error::ServerError;
pub use handler::{HandlerError, HandlerRegistry, MethodKind, RequestContext};
pub use metrics::Metrics;
pub use multiplexer::ActionHandler;
pub use registry::{Outbound, SessionId, SessionRegistry};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::SessionGuard;
