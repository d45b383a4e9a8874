//! Method handlers dispatched by the engine.
//!
//! Handlers are registered by method tag as typed async functions. Payloads
//! are deserialized with serde before the handler runs; success values and
//! application errors are serialized back into the exit.

use crate::engine::ChunkSink;
use crate::registry::SessionId;
use onecall_protocol::RequestId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Per-request information handed to every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    /// Looks up a request header, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Failure of a handler, before it is encoded as an exit cause.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Typed application error, reported with a `Fail` cause.
    Failure(Value),
    /// Unexpected failure, reported with a `Die` cause.
    Defect(String),
}

/// Whether a method answers with a single value or a chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Stream,
}

type ErasedHandler = Arc<
    dyn Fn(Value, RequestContext, ChunkSink) -> BoxFuture<Result<Value, HandlerError>>
        + Send
        + Sync,
>;

/// A registered method.
#[derive(Clone)]
pub struct Method {
    kind: MethodKind,
    handler: ErasedHandler,
}

impl Method {
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub(crate) fn invoke(
        &self,
        payload: Value,
        ctx: RequestContext,
        sink: ChunkSink,
    ) -> BoxFuture<Result<Value, HandlerError>> {
        (self.handler)(payload, ctx, sink)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("kind", &self.kind).finish()
    }
}

/// Methods known to the engine, keyed by tag.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, Method>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method answering with one value.
    pub fn unary<P, S, E, F, Fut>(mut self, tag: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        S: Serialize + Send + 'static,
        E: Serialize + Send + 'static,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(
            move |payload: Value,
                  ctx: RequestContext,
                  _sink: ChunkSink|
                  -> BoxFuture<Result<Value, HandlerError>> {
                let handler = handler.clone();
                Box::pin(async move {
                    let input = decode_payload::<P>(payload)?;
                    match handler(input, ctx).await {
                        Ok(value) => encode(&value),
                        Err(error) => Err(HandlerError::Failure(encode(&error)?)),
                    }
                })
            },
        );
        self.insert(tag.into(), MethodKind::Unary, erased);
        self
    }

    /// Registers a method that emits chunks and then exits with no value.
    pub fn stream<P, E, F, Fut>(mut self, tag: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        E: Serialize + Send + 'static,
        F: Fn(P, RequestContext, ChunkSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(
            move |payload: Value,
                  ctx: RequestContext,
                  sink: ChunkSink|
                  -> BoxFuture<Result<Value, HandlerError>> {
                let handler = handler.clone();
                Box::pin(async move {
                    let input = decode_payload::<P>(payload)?;
                    match handler(input, ctx, sink).await {
                        Ok(()) => Ok(Value::Null),
                        Err(error) => Err(HandlerError::Failure(encode(&error)?)),
                    }
                })
            },
        );
        self.insert(tag.into(), MethodKind::Stream, erased);
        self
    }

    fn insert(&mut self, tag: String, kind: MethodKind, handler: ErasedHandler) {
        if self
            .methods
            .insert(tag.clone(), Method { kind, handler })
            .is_some()
        {
            tracing::warn!("Handler for {} replaced", tag);
        }
    }

    pub fn get(&self, tag: &str) -> Option<&Method> {
        self.methods.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.methods.contains_key(tag)
    }

    /// Returns registered method tags, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn decode_payload<P: DeserializeOwned>(payload: Value) -> Result<P, HandlerError> {
    serde_json::from_value(payload)
        .map_err(|e| HandlerError::Defect(format!("invalid payload: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(value)
        .map_err(|e| HandlerError::Defect(format!("failed to encode result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn context() -> RequestContext {
        RequestContext {
            session_id: 0,
            request_id: RequestId::new(1),
            headers: vec![("X-Trace".to_string(), "abc".to_string())],
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .unary("Add", |input: Add, _ctx| async move {
                Ok::<_, String>(input.a + input.b)
            })
            .unary("Reject", |_: (), _ctx| async move {
                Err::<(), _>(serde_json::json!({"_tag": "Rejected"}))
            })
    }

    #[test]
    fn test_registry_lookup() {
        let handlers = registry();
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers.methods(), vec!["Add", "Reject"]);
        assert_eq!(handlers.get("Add").unwrap().kind(), MethodKind::Unary);
        assert!(handlers.get("Missing").is_none());
    }

    #[tokio::test]
    async fn test_unary_invocation() {
        let handlers = registry();
        let method = handlers.get("Add").unwrap();
        let result = method
            .invoke(serde_json::json!({"a": 2, "b": 3}), context(), ChunkSink::detached())
            .await;
        assert_eq!(result, Ok(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn test_application_error_is_failure() {
        let handlers = registry();
        let result = handlers
            .get("Reject")
            .unwrap()
            .invoke(Value::Null, context(), ChunkSink::detached())
            .await;
        assert_eq!(
            result,
            Err(HandlerError::Failure(serde_json::json!({"_tag": "Rejected"})))
        );
    }

    #[tokio::test]
    async fn test_bad_payload_is_defect() {
        let handlers = registry();
        let result = handlers
            .get("Add")
            .unwrap()
            .invoke(serde_json::json!("nope"), context(), ChunkSink::detached())
            .await;
        assert!(matches!(result, Err(HandlerError::Defect(ref msg)) if msg.contains("invalid payload")));
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let ctx = context();
        assert_eq!(ctx.header("x-trace"), Some("abc"));
        assert_eq!(ctx.header("missing"), None);
    }
}
