//! onecall - streaming RPC over one-shot transports
//!
//! Serves a shared RPC engine over HTTP, one session per POST.

use onecall_server::config::CONFIG_ENV;
use onecall_server::{
    ActionHandler, ChunkSink, Config, HandlerRegistry, Metrics, RequestContext, RpcServer, Server,
    ServerConfig, SessionRegistry,
};
use onecall_protocol::Serialization;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Methods served out of the box.
fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .unary("Echo", |input: Value, _ctx: RequestContext| async move {
            Ok::<_, ()>(input)
        })
        .unary("Sleep", |millis: u64, _ctx: RequestContext| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, ()>(millis)
        })
        .stream(
            "Count",
            |n: u64, _ctx: RequestContext, sink: ChunkSink| async move {
                for i in 0..n {
                    if !sink.send(json!(i)) {
                        break;
                    }
                }
                Ok::<_, ()>(())
            },
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if ONECALL_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var(CONFIG_ENV) {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var(CONFIG_ENV).is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting onecall server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  RPC path: {}", config.network.rpc_path);
    tracing::info!("  Serialization: {}", config.session.serialization);
    match config.session.timeout() {
        Some(timeout) => tracing::info!("  Session timeout: {:?}", timeout),
        None => tracing::info!("  Session timeout: none"),
    }

    let metrics = if config.metrics.enabled {
        tracing::info!("  Metrics: enabled");
        Some(Arc::new(Metrics::new()?))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let serialization = config.session.serialization.build();
    let registry = Arc::new(SessionRegistry::new(serialization.supports_big_int()));

    let handlers = builtin_handlers();
    tracing::info!("  Methods: {}", handlers.methods().join(", "));
    let engine = Arc::new(match metrics {
        Some(ref metrics) => RpcServer::with_metrics(handlers, registry.clone(), metrics.clone()),
        None => RpcServer::new(handlers, registry.clone()),
    });
    let disconnects = engine.start();

    let mut handler = ActionHandler::new(registry, engine, serialization)
        .with_session_timeout(config.session.timeout());
    let mut server_config = ServerConfig::from_network(&config.network);
    if let Some(metrics) = metrics {
        handler = handler.with_metrics(metrics.clone());
        server_config = server_config.with_metrics(metrics);
    }

    let server = Arc::new(Server::new(server_config, Arc::new(handler)));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(task) = disconnects {
        task.abort();
    }

    tracing::info!("Server stopped");
    Ok(())
}
