use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "slipway")]
#[command(version, about = "Self-hosted continuous deployment daemon")]
pub struct Cli {
    /// Path to slipway.toml. Falls back to ./slipway.toml when present
    #[arg(short, long, global = true, env = "SLIPWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides the config file)
    #[arg(long, global = true, env = "SLIPWAY_DB")]
    pub db: Option<PathBuf>,

    /// Emit logs as JSON (for log collectors)
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon: remote monitors, build queue and HTTP API
    Serve {
        /// Listen address for the HTTP API (overrides the config file)
        #[arg(short, long, env = "SLIPWAY_LISTEN")]
        listen: Option<String>,

        /// Permissive CORS, for running a dashboard dev server locally
        #[arg(long)]
        dev: bool,
    },
    /// Register an application to watch and build
    Register {
        /// Application name (also used for image tags)
        #[arg(short, long)]
        name: String,

        /// Git URL of the repository to watch
        #[arg(short, long)]
        repository: String,

        /// Optional display label
        #[arg(long)]
        label: Option<String>,

        /// Credentials entry used when fetching
        #[arg(long)]
        credentials_id: Option<i64>,

        /// Track branches without building them automatically
        #[arg(long)]
        no_auto_build: bool,
    },
    /// List registered applications
    Applications,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = slipway::config::SlipwayConfig::load_or_default(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.daemon.db_path = db;
    }

    match cli.command {
        Commands::Serve { listen, dev } => {
            if let Some(listen) = listen {
                config.daemon.listen_addr = listen;
            }
            cmd::cmd_serve(config, dev).await
        }
        Commands::Register {
            name,
            repository,
            label,
            credentials_id,
            no_auto_build,
        } => {
            cmd::cmd_register(config, name, repository, label, credentials_id, !no_auto_build)
                .await
        }
        Commands::Applications => cmd::cmd_applications(config).await,
    }
}
