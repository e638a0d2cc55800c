//! durus-client: a connectivity smoke test, not an interactive shell.
//!
//! Connects, performs the version handshake, and prints the databases
//! visible on disk and currently open.

use clap::Parser;
use durusd::client::Client;
use durusd::config::ClientConfig;
use durusd::Result;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = ClientConfig::parse();
    let addr = config.addr();

    let mut client = Client::connect(&addr).await?;
    info!(%addr, "version handshake ok");

    let on_disk = client.enumerate_all().await?;
    let open = client.enumerate_open().await?;
    println!("databases on disk: {on_disk:?}");
    println!("databases open:    {open:?}");

    client.disconnect().await?;
    Ok(())
}
