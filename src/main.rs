//! Merit Ledger Server
//!
//! Anonymous points ledger with rank certificates, physical reward
//! registration and screenshot tier verification.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use merit_ledger::redact::redact_env_value;
use merit_ledger::{Config, IdentityHasher, PgStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "merit-server")]
#[command(version)]
#[command(about = "Anonymous points ledger", long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, env = "LEDGER_CONFIG", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ledger and its verification server (default)
    Serve {
        /// Host to bind
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },

    /// Run one retention purge and exit
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting Merit Ledger v{}", env!("CARGO_PKG_VERSION"));
    log_environment();

    let config = Config::load_from(&cli.config)?;

    let production = config.is_production();
    if production {
        info!("Running in production mode");
    } else {
        warn!("Running in development mode; fallback secrets are allowed");
    }

    let hasher = IdentityHasher::from_env(production, Path::new(&config.security.salt_file))?;

    let store = Arc::new(
        PgStore::from_env(
            hasher,
            config.retention_days(),
            config.verification.base_url.clone(),
        )
        .await?,
    );
    info!("PostgreSQL storage initialized");

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            // Background retention purge loop
            let janitor_store = store.clone();
            let purge_interval = config.retention.purge_interval_secs;
            tokio::spawn(async move {
                // Initial purge after 10 seconds
                tokio::time::sleep(Duration::from_secs(10)).await;

                let mut interval = tokio::time::interval(Duration::from_secs(purge_interval));
                loop {
                    interval.tick().await;
                    if let Err(e) = janitor_store.purge_expired().await {
                        error!("Retention purge failed: {}", e);
                    }
                }
            });
            info!(
                "Background retention purge started (every {} seconds)",
                purge_interval
            );

            merit_ledger::server::run_server(&host, port, store).await?;
        }
        Commands::Purge => {
            let purged = store.purge_expired().await?;
            info!("Purge complete: {} rows removed", purged);
        }
    }

    Ok(())
}

/// Echo the environment the process sees, with secret values masked.
fn log_environment() {
    let mut names: Vec<String> = std::env::vars().map(|(name, _)| name).collect();
    names.sort();

    for name in names {
        let relevant = name.starts_with("LEDGER_")
            || name.starts_with("OCR_")
            || matches!(
                name.as_str(),
                "APP_ENV" | "DATABASE_URL" | "HOST" | "PORT" | "RETENTION_DAYS" | "RUST_LOG"
            );
        if !relevant {
            continue;
        }
        if let Ok(value) = std::env::var(&name) {
            info!("  {} = {}", name, redact_env_value(&name, &value));
        }
    }
}
