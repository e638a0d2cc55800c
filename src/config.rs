//! Server and client configuration, parsed from CLI flags.

use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 22_972;

#[derive(Parser, Debug)]
#[command(name = "durusd", about = "Multi-database object storage server")]
pub struct ServerConfig {
    /// Directory scanned for `<name>.durus` files.
    pub root: PathBuf,

    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Any level `tracing` understands: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Parser, Debug)]
#[command(name = "durus-client", about = "Connectivity smoke test for durusd")]
pub struct ClientConfig {
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ClientConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
