//! Command execution.

use crate::Commands;
use colored::Colorize;
use onecall_client::{Client, ClientError};
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(
    client: &Client,
    cmd: Commands,
    raw: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Call { method, payload } => {
            let payload = parse_payload(payload.as_deref())?;
            match client.call(&method, payload).await {
                Ok(value) => Ok(format_value(&value, raw)),
                Err(ClientError::Application { error }) => Err(format!(
                    "{} failed: {}",
                    method.cyan(),
                    format_value(&error, true)
                )
                .into()),
                Err(e) => Err(e.into()),
            }
        }

        Commands::Stream { method, payload } => {
            let payload = parse_payload(payload.as_deref())?;
            let mut stream = client.stream(&method, payload).await?;
            let mut count = 0usize;
            while let Some(item) = stream.next().await {
                let value = item?;
                println!("{}", format_value(&value, raw));
                count += 1;
            }
            if raw {
                Ok(String::new())
            } else {
                Ok(format!("{} {} chunk(s)", "Done:".green(), count))
            }
        }
    }
}

/// Parses an optional payload argument; a missing payload is `null`.
fn parse_payload(arg: Option<&str>) -> Result<Value, Box<dyn std::error::Error>> {
    match arg {
        Some(arg) => parse_json_arg(arg),
        None => Ok(Value::Null),
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_value(value: &Value, raw: bool) -> String {
    if raw {
        value.to_string()
    } else {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    }
}
