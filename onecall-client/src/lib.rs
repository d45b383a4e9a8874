//! # onecall-client
//!
//! Client half of the onecall adapter.
//!
//! This crate provides:
//! - An adapter carrying each request over one stateless transport call
//! - HTTP and in-process transports
//! - An async call API resolving exits into values and typed errors

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{Client, ResponseStream};
pub use error::ClientError;
pub use protocol::{ActionProtocol, ResponseSink};
pub use transport::{FnTransport, HttpConfig, HttpTransport, Transport, TransportRequest};
