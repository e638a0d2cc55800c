use thiserror::Error;

/// Crate-wide error type.
///
/// Each variant maps to exactly one outcome at the session boundary: a
/// terminated connection (protocol/path-safety/unknown-command/version),
/// a status byte sent downstream (`KeyError`, `Conflict`), or a dropped
/// session that leaves the rest of the server untouched
/// (`ClientWroteForeignOid`).
#[derive(Error, Debug)]
pub enum DurusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("key error: no such oid")]
    KeyError,

    #[error("conflict")]
    Conflict,

    #[error("path safety error: {0}")]
    PathSafety(String),

    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("client attempted to commit an oid issued to another session")]
    ClientWroteForeignOid,
}

pub type Result<T> = std::result::Result<T, DurusError>;
