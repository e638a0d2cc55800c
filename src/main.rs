//! durusd server entry point.
//!
//! Parses CLI flags, initializes structured logging, and runs the
//! dispatcher until a client sends `Q`. Process launch is otherwise
//! minimal by design: no config file, no interactive shell.

use clap::Parser;
use durusd::config::ServerConfig;
use durusd::server::Dispatcher;
use durusd::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    std::fs::create_dir_all(&config.root)?;

    let dispatcher = Dispatcher::bind(&config.addr(), config.root.clone()).await?;
    dispatcher.run().await
}
