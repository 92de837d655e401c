use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use rkp::api::{MemoryStore, ObjectStore, XlineStore};
use rkp::cli::{Cli, Commands};
use rkp::protocol::config::{Config, load_config};
use rkp::server::serve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => {
            let mut cfg = match &args.config {
                Some(path) => match load_config(path) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        error!("Failed to load config: {e:#}");
                        return Err(e);
                    }
                },
                None => Config::default(),
            };
            args.apply(&mut cfg);
            if let Err(e) = cfg.validate() {
                error!("Invalid configuration: {e:#}");
                return Err(e).context("invalid configuration");
            }

            let store: Arc<dyn ObjectStore> = if args.in_memory {
                warn!("Using an in-memory store, nothing will be persisted");
                Arc::new(MemoryStore::new())
            } else {
                match XlineStore::new(&cfg.xline_config).await {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        error!("Failed to connect to Xline: {e}");
                        return Err(e).context("XlineStore::new failed");
                    }
                }
            };

            let shutdown = CancellationToken::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for ctrl-c: {e}");
                    }
                    info!("Received shutdown signal");
                    shutdown.cancel();
                });
            }

            serve(cfg, store, shutdown).await?;
        }
    }

    Ok(())
}
