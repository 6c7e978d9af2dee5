//! Minimal process entry point: `broker serve` (the default) and a global
//! `--config <path>` override, replacing the teacher's channel-management
//! CLI (`cli/commands.rs`'s `Gateway`/`Agent`/`Cron`/... subcommands).
//!
//! Wires, in order: config load → audit logger → upstream MCP client pool
//! (parallel connect) → schema cache (provider is the pool itself, then
//! loads its disk snapshot). Tears down in reverse on `ctrl_c`: drain the
//! pool, then the audit logger (a no-op flush plus a retention sweep).
//!
//! The agent-facing MCP surface (`executeTypeScript`/`executePython`/
//! `health`) is an external collaborator (spec.md §1, "outer MCP server")
//! — this entry point brings the broker's internals up and holds them
//! open; it does not itself serve that surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::audit::AuditLogger;
use crate::config;
use crate::mcp::UpstreamClientPool;
use crate::schema::cache::SchemaCache;
use crate::utils::get_broker_home;

#[derive(Parser)]
#[command(name = "broker", about = "MCP code-executor broker")]
struct Cli {
    /// Path to the broker config file. Defaults to BROKER_HOME/config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load config, connect every upstream MCP server, and hold the broker
    /// open until interrupted.
    Serve,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = config::load_config(config_path.as_deref()).context("loading broker config")?;
    let broker_home = get_broker_home().context("resolving broker home directory")?;

    let audit_dir = config
        .audit
        .dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| broker_home.join("audit"));
    let retention_days = AuditLogger::retention_days_override(config.audit.retention_days)
        .context("resolving AUDIT_LOG_RETENTION_DAYS override")?;
    let audit = Arc::new(AuditLogger::new(audit_dir, retention_days));

    let pool = Arc::new(
        UpstreamClientPool::connect(&config)
            .await
            .context("connecting to upstream MCP servers")?,
    );

    let cache_path = config
        .cache
        .path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| broker_home.join("schema-cache.json"));
    let schema_cache = Arc::new(SchemaCache::with_options(
        pool.clone(),
        Some(cache_path),
        std::time::Duration::from_secs(config.cache.ttl_secs),
        config.cache.capacity,
    ));
    schema_cache.load_from_disk().await;

    let tool_count = pool.list_all_tools().await.len();
    info!(
        servers = config.mcp_servers.len(),
        tools = tool_count,
        "broker ready"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested, draining");

    // Drop the cache's handle on the pool first so `try_unwrap` below sees
    // a single owner and can actually reclaim it for a graceful shutdown.
    drop(schema_cache);
    shutdown(pool, audit).await;
    Ok(())
}

/// Guaranteed-order teardown: drain the upstream pool (closing every
/// connection) before the audit logger's retention sweep, mirroring the
/// construction order in reverse.
async fn shutdown(pool: Arc<UpstreamClientPool>, audit: Arc<AuditLogger>) {
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.disconnect().await,
        Err(_) => {
            tracing::warn!("upstream pool still has outstanding references at shutdown");
        }
    }
    audit.flush();
    let removed = audit.cleanup();
    if removed > 0 {
        info!(removed, "swept expired audit logs");
    }
}
