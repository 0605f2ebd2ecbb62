//! Strata Object Manager
//!
//! Applies a log of write commands through the object manager state
//! machine and serves its metrics over HTTP.

mod commands;
mod http;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use strata_common::OmConfig;
use strata_meta_store::MemoryStore;
use strata_om::OzoneManager;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "strata-om-server")]
#[command(about = "Strata Object Manager")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML, optional)
    #[arg(short, long, default_value = "/etc/strata/om.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Metadata database file (overrides config)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Keep metadata in memory only
    #[arg(long)]
    in_memory: bool,

    /// Command log to apply, `-` for stdin
    #[arg(long)]
    commands: Option<String>,

    /// Exit after the command log is applied instead of serving metrics
    #[arg(long)]
    once: bool,

    /// Listen address for /metrics and /health (overrides config)
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,

    /// Evaluate ACLs before every mutation
    #[arg(long)]
    acl_enabled: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

/// File, then `STRATA__SECTION__FIELD` environment variables, then flags
fn load_config(args: &Args) -> Result<OmConfig> {
    let mut config: OmConfig = config::Config::builder()
        .add_source(config::File::from(args.config.as_path()).required(false))
        .add_source(config::Environment::with_prefix("STRATA").separator("__"))
        .build()
        .with_context(|| format!("failed to load {}", args.config.display()))?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if let Some(db_path) = &args.db_path {
        config.store.db_path = Some(db_path.clone());
    }
    if let Some(listen) = args.metrics_listen {
        config.metrics.listen = listen;
    }
    if args.acl_enabled {
        config.security.acl_enabled = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting Strata Object Manager");
    let config = load_config(&args)?;
    info!("Config file: {}", args.config.display());

    let om = if args.in_memory {
        info!("Metadata kept in memory");
        OzoneManager::with_store(config, Arc::new(MemoryStore::new()))?
    } else {
        info!(
            "Metadata database: {}",
            config.store.resolve_db_path(&config.node).display()
        );
        OzoneManager::open(config)?
    };
    let om = Arc::new(om);

    if let Some(source) = args.commands.clone() {
        let worker = Arc::clone(&om);
        let summary = tokio::task::spawn_blocking(move || -> Result<commands::ApplySummary> {
            let summary = if source == "-" {
                commands::apply_log(&worker, std::io::stdin().lock())?
            } else {
                let file = std::fs::File::open(&source)
                    .with_context(|| format!("failed to open command log {source}"))?;
                commands::apply_log(&worker, BufReader::new(file))?
            };
            if let Err(e) = worker.flush_now().wait() {
                error!("Command log applied but not durable: {}", e);
            }
            Ok(summary)
        })
        .await??;
        info!(
            "Command log done: {} applied, {} failed, {} replayed, last log index {}",
            summary.applied, summary.failed, summary.replayed, summary.last_index
        );
    }

    if !args.once {
        let state = Arc::new(http::MetricsState::new(Arc::clone(&om)));
        http::serve(om.config().metrics.listen, state, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;
    }

    om.stop();
    info!("Object manager shut down gracefully");
    Ok(())
}
