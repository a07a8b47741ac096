// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use querygate::config::{Config, StorageBackend};
use querygate::mcp::proxy::McpProxy;
use querygate::mcp::target::{StdioTarget, TargetConnection};
use querygate::store::open_store;

/// Protective MCP proxy for database tool servers.
///
/// Wraps a target MCP server, classifies SQL risk, suspends high-risk calls
/// for human approval, and hard-caps every response.
#[derive(Parser, Debug)]
#[command(name = "querygate", version, about)]
struct Cli {
    /// Target type for adapter selection (duckdb, postgres, generic)
    #[arg(long)]
    target_type: Option<String>,

    /// Run transparent: never block calls (response caps still apply)
    #[arg(long)]
    transparent: bool,

    /// Storage backend (sqlite or memory)
    #[arg(long)]
    storage: Option<String>,

    /// Path of the shared SQLite session database
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Seconds before a blocked call auto-decides timeout
    #[arg(long)]
    blocker_timeout: Option<u64>,

    /// Log level filter (e.g. info, debug, querygate=trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Target server command, after `--` (e.g. -- uvx mcp-server-duckdb)
    #[arg(last = true)]
    target_cmd: Vec<String>,
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the protocol; logs must go to stderr
    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(target_type) = cli.target_type {
        config.target.target_type = target_type;
    }
    if cli.transparent {
        config.policy.protective_mode = false;
    }
    if let Some(storage) = cli.storage {
        config.storage.backend = StorageBackend::parse_safe(&storage);
    }
    if let Some(db_path) = cli.db_path {
        config.storage.sqlite_path = db_path;
    }
    if let Some(secs) = cli.blocker_timeout {
        config.blocker_timeout_secs = secs;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    config.target.command = cli.target_cmd;

    init_tracing(&config);
    info!(
        "querygate starting (mode: {})",
        if config.policy.protective_mode {
            "protective"
        } else {
            "transparent"
        }
    );

    let store = open_store(&config.storage, &config.limits).context("opening session store")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            signal_token.cancel();
        }
    });

    let target: Option<Box<dyn TargetConnection>> = if config.target.command.is_empty() {
        None
    } else {
        let connection = StdioTarget::connect(&config.target)
            .await
            .context("connecting to target server")?;
        Some(Box::new(connection))
    };

    let mut proxy = McpProxy::new(Arc::new(config), store, target, shutdown);
    proxy
        .fetch_target_tools()
        .await
        .context("fetching target tool catalogue")?;
    proxy.run().await.context("proxy loop failed")?;

    Ok(())
}
