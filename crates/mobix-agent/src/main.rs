//! Mobix script runner
//!
//! Runs one script the way the `remoteExecution` service would and prints
//! the resulting value as JSON.
//!
//! ```text
//! mobix-run <script.lua> [key=value ...]
//! ```

use anyhow::{bail, Context, Result};
use mobix_agent::script::{ScriptConfig, ScriptEngine};
use serde_json::{Map, Value};
use tracing::{error, info};

fn parse_parameter(arg: &str) -> Result<(String, Value)> {
    let (key, raw) = arg
        .split_once('=')
        .with_context(|| format!("expected key=value, got '{}'", arg))?;
    // Bare words are strings; anything that parses as JSON keeps its type.
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    mobix_agent::telemetry::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: mobix-run <script.lua> [key=value ...]");
    };
    let code = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read script {}", path))?;
    let parameters = args
        .map(|arg| parse_parameter(&arg))
        .collect::<Result<Map<String, Value>>>()?;

    info!("Running {} with {} parameters", path, parameters.len());
    let engine = ScriptEngine::new(ScriptConfig::default());
    let result = tokio::task::spawn_blocking(move || engine.execute(&code, &parameters))
        .await
        .context("Script worker failed")?;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value.unwrap_or(Value::Null))?);
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
