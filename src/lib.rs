//! durusd, a multi-database network server fronting local append-only
//! object stores, and the client library that speaks its wire protocol.
//!
//! `wire` is the framed binary codec, `storage` is the engine contract
//! and its one concrete implementation, `registry` tracks which databases
//! are open, `session` holds per-connection state and the command loop,
//! `coordinator` implements the database-table handlers, and `server` is
//! the accept-loop dispatcher. `client` is the companion library for
//! application code.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod oid;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod wire;

pub use error::{DurusError, Result};
pub use oid::Oid;
