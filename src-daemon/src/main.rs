//! SiteGuard daemon
//!
//! Reads one JSON command per line on stdin and answers with one JSON result
//! per line on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use siteguard_core::{CommandResult, Config, Engine, GrantTable, InMemoryEnforcer};

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) if Path::new(&path).exists() => {
            Config::load(&path).with_context(|| format!("Failed to load config from {path}"))
        }
        Some(path) => {
            warn!(path = %path, "Config file not found, using defaults");
            Ok(Config::default())
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    siteguard_core::init_logging();

    let config = load_config()?;
    let grants = Arc::new(GrantTable::with_grants(config.granted_origins.clone()));
    let enforcer = Arc::new(InMemoryEnforcer::new());

    let engine = Engine::open(config, grants, enforcer).context("Failed to open engine")?;
    // Keep serving even if the first pass fails so commands can repair state
    match engine.start().await {
        Ok(report) => info!(rules = report.rules_installed, "SiteGuard ready"),
        Err(e) => error!(error = %e, "Initial sync failed"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received.");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let result = match serde_json::from_str(&line) {
            Ok(request) => engine.dispatch(&request).await,
            Err(e) => CommandResult::err(format!("Malformed request: {e}")),
        };

        let mut reply = serde_json::to_vec(&result)?;
        reply.push(b'\n');
        stdout.write_all(&reply).await?;
        stdout.flush().await?;
    }

    engine.shutdown();
    Ok(())
}
