//! World model daemon.
//!
//! `mundusd [config-file]`. With no argument the server runs without
//! persistent storage on the default ports.
use mundus::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "reading configuration");
            Config::from_file(path)?
        }
        None => {
            info!("no configuration file given; using defaults without persistence");
            Config::default()
        }
    };

    let server = Server::start(config).await?;
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
