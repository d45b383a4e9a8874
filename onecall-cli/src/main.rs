//! onecall-cli - Command-line client for onecall servers
//!
//! Sends one call per invocation and prints the result.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use onecall_client::{Client, HttpConfig};
use onecall_protocol::SerializationKind;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "onecall-cli")]
#[command(about = "Command-line client for onecall RPC servers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, env = "ONECALL_SERVER", default_value = "127.0.0.1:7420")]
    server: SocketAddr,

    /// Path accepting batches
    #[arg(long, env = "ONECALL_RPC_PATH", default_value = "/rpc")]
    path: String,

    /// Body serialization: json, ndjson or framed
    #[arg(short, long, default_value = "json")]
    format: SerializationKind,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Print results as compact JSON
    #[arg(long)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a unary method
    Call {
        /// Method tag
        method: String,

        /// Payload JSON (or @file.json to read from file)
        payload: Option<String>,
    },

    /// Call a streaming method and print each chunk
    Stream {
        /// Method tag
        method: String,

        /// Payload JSON (or @file.json to read from file)
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = HttpConfig::new(cli.server)
        .with_path(cli.path.clone())
        .with_request_timeout(Duration::from_secs(cli.timeout));
    let client = Client::http(config, cli.format);

    match commands::execute(&client, cli.command, cli.raw).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
