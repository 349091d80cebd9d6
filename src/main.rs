use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

mod agent;
mod config;
mod credentials;
mod error;
mod models;
mod quiz;
mod retrieval;
mod server;
mod session;
mod settings;
mod storage;

#[derive(Debug, Parser)]
#[command(name = "gpt_series")]
#[command(about = "Document Q&A, quiz generation and web research over a hosted LLM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        /// Overrides GPT_SERIES_CACHE_DIR
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, cache_dir } => {
            let addr: SocketAddr = listen.parse()?;
            let mut config = config::AppConfig::from_env();
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            let metrics = match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "metrics recorder unavailable");
                    None
                }
            };
            let state = server::AppState::initialize(config, metrics).await?;
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
