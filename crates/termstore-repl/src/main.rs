#![warn(missing_docs)]

//! `ts-repl`: runs a replicated repository on an in-memory store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use termstore_repl::{
    LoopbackPrimary, MemoryStore, PrimaryClient, ReplConfig, Repository, RepositoryType,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line of `ts-repl`.
#[derive(Parser, Debug)]
#[command(name = "ts-repl", about = "Termstore replication node")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "TS_REPL_CONFIG", default_value = "ts-repl.toml")]
    config: PathBuf,

    /// Override the status log interval, in milliseconds.
    #[arg(long)]
    status_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        ReplConfig::from_file(&cli.config)?
    } else {
        tracing::warn!(
            "Config file not found, using defaults: {}",
            cli.config.display()
        );
        ReplConfig::default()
    };
    if let Some(ms) = cli.status_interval_ms {
        config.status_interval_ms = ms;
    }
    let interval = Duration::from_millis(if config.status_interval_ms == 0 {
        10_000
    } else {
        config.status_interval_ms
    });

    // Replicas get an in-process primary to follow.
    let mut upstream = None;
    let primary: Option<Arc<dyn PrimaryClient>> =
        if config.repository.repository_type == RepositoryType::Primary {
            None
        } else {
            let mut primary_config = config.clone();
            primary_config.repository.repository_type = RepositoryType::Primary;
            let repo = Repository::new(primary_config, Arc::new(MemoryStore::new()), None)
                .context("creating loopback primary")?;
            repo.activate().await?;
            let loopback = LoopbackPrimary::new(repo.clone());
            upstream = Some(repo);
            Some(loopback as Arc<dyn PrimaryClient>)
        };

    let repo = Repository::new(config, Arc::new(MemoryStore::new()), primary)
        .context("creating repository")?;
    repo.activate().await?;
    tracing::info!(
        repository = %repo.id(),
        repository_type = %repo.role().repository_type(),
        "ts-repl running"
    );

    let status_repo = repo.clone();
    let status_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match status_repo.status() {
                Ok(status) => match serde_json::to_string(&status) {
                    Ok(json) => tracing::info!(status = %json, "repository status"),
                    Err(e) => tracing::warn!("cannot encode status: {}", e),
                },
                Err(e) => tracing::warn!("cannot collect status: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    status_handle.abort();
    repo.deactivate().await?;
    if let Some(upstream) = upstream {
        upstream.deactivate().await?;
    }
    Ok(())
}
