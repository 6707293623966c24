use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agora::db::MarketDb;
use agora::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "agora")]
#[command(version, about = "AI-agent marketplace deployment and feedback service")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "8090")]
        port: u16,

        /// Path to the SQLite database
        #[arg(long, default_value = ".agora/market.db")]
        db_path: PathBuf,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,

        /// Milliseconds between readiness probe attempts during restart
        #[arg(long, default_value = "500")]
        probe_interval_ms: u64,

        /// Readiness probe attempts before a restart is marked failed
        #[arg(long, default_value = "10")]
        probe_attempts: u32,
    },
    /// Initialize the database and exit
    InitDb {
        /// Path to the SQLite database
        #[arg(long, default_value = ".agora/market.db")]
        db_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "agora=debug,info" } else { "agora=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            dev,
            probe_interval_ms,
            probe_attempts,
        } => {
            server::start_server(ServerConfig {
                port,
                db_path,
                dev_mode: dev,
                probe_interval: Duration::from_millis(probe_interval_ms),
                probe_attempts,
            })
            .await
        }
        Commands::InitDb { db_path } => {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            MarketDb::new(&db_path)?;
            tracing::info!(path = %db_path.display(), "database initialized");
            Ok(())
        }
    }
}
