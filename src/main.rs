//! Tabula server
//!
//! Binary entry point: serves the API, runs a one-off maintenance sweep, or
//! hashes passwords for the credentials table.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tabula::auth::hash_password;
use tabula::common::config::TabulaConfig;
use tabula::TabulaServer;

#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(about = "Database tables as a filtered, rate-limited CRUD API", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TABULA_CONFIG", default_value = "tabula.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the API (default)
    Serve,
    /// Sweep expired rate limit records, cache entries and old log files
    Cleanup,
    /// Print the OpenAPI document for the configured database
    Openapi,
    /// Print an argon2 hash for the credentials table
    HashPassword {
        /// Password to hash
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(fmt::layer))
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::HashPassword { password } => {
            println!("{}", hash_password(&password)?);
            Ok(())
        }
        Command::Cleanup => {
            let server = TabulaServer::new(load_config(&args.config)?)?;
            let report = server.cleanup();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Openapi => {
            let server = TabulaServer::new(load_config(&args.config)?)?;
            let doc = server.pipeline().schema().generate_openapi("Tabula API")?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
        Command::Serve => serve(load_config(&args.config)?).await,
    }
}

async fn serve(config: TabulaConfig) -> anyhow::Result<()> {
    info!("Tabula v{}", env!("CARGO_PKG_VERSION"));

    let server = TabulaServer::new(config)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        () = shutdown => {
            server.shutdown().await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<TabulaConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: TabulaConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    } else {
        info!("Using default configuration");
        Ok(TabulaConfig::default())
    }
}
