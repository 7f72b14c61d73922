mod cli;
mod config;
mod net;
mod service;
mod settings;
mod signaling;
mod time_sync;
mod transport;
mod util;
mod worker;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli::parse_args()? {
        cli::LaunchMode::Service { config_path } => {
            let config = config::load_config(&config_path)?;
            tracing::info!(
                server = %config.server.host,
                port = config.server.port,
                "Lanthing service starting"
            );
            let params = service::ServiceParams::from_config(config)?;
            service::run(params).await
        }
        cli::LaunchMode::Worker(args) => {
            let code = worker::run_worker(args).await;
            std::process::exit(code);
        }
    }
}
