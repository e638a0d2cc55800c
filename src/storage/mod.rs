//! The storage engine contract consumed by the transaction coordinator.
//!
//! The core (registry, session, coordinator) only ever talks to a
//! `dyn StorageEngine`, so a different on-disk format could be dropped in
//! without touching anything above this module. `file` is the one
//! concrete implementation shipped here: a single append-only `.durus`
//! file per database.

pub mod file;

use crate::error::Result;
use crate::oid::Oid;
use std::collections::HashMap;
use std::collections::HashSet;

pub use file::FileStorage;

/// An in-progress or completed incremental pack. This crate's engine never
/// produces one (see `FileStorage::get_packer`) but the trait exists so a
/// future engine can plug in incremental packing without a coordinator
/// change.
pub trait Packer: Send {
    /// Performs one bounded unit of packing work. Returns `true` once the
    /// pack is complete.
    fn step(&mut self) -> Result<bool>;
}

/// The contract the transaction coordinator relies on.
pub trait StorageEngine: Send {
    fn load(&mut self, oid: Oid) -> Result<Vec<u8>>;
    fn store(&mut self, oid: Oid, record: Vec<u8>);
    fn begin(&mut self);
    /// Finalizes the transaction started by `begin`. `on_invalidations` is
    /// invoked with any OID sets this engine discovers were invalidated by
    /// a concurrent writer while finalizing; this engine never has an
    /// external concurrent writer, so it is never called in practice, but
    /// the hook is part of the contract.
    fn end(&mut self, on_invalidations: &mut dyn FnMut(&HashSet<Oid>)) -> Result<HashSet<Oid>>;
    fn new_oid(&mut self) -> Oid;
    /// OIDs committed by anyone (including the caller) since the last call.
    fn sync(&mut self) -> HashSet<Oid>;
    fn pack(&mut self) -> Result<()>;
    fn get_packer(&mut self) -> Option<Box<dyn Packer>>;
    fn close(&mut self) -> Result<()>;
}

/// The server-owned bookkeeping attached to a storage handle at open time,
/// alongside the engine-private state.
pub struct OpenDatabase {
    pub engine: Box<dyn StorageEngine>,
    pub bytes_since_pack: u64,
    pub load_stats: HashMap<String, u64>,
    pub packer: Option<Box<dyn Packer>>,
}

impl OpenDatabase {
    pub fn new(engine: Box<dyn StorageEngine>) -> Self {
        Self {
            engine,
            bytes_since_pack: 0,
            load_stats: HashMap::new(),
            packer: None,
        }
    }

    /// Records a cosmetic load-telemetry hit. Real Durus peeks the pickled
    /// class name out of the record; we don't carry a pickle format, so we
    /// just bucket by a short prefix of the bytes. It is only ever read
    /// back out through debug logging.
    pub fn note_load(&mut self, record: &[u8]) {
        let hint = class_hint(record);
        *self.load_stats.entry(hint).or_insert(0) += 1;
    }
}

fn class_hint(record: &[u8]) -> String {
    let take = record.len().min(24);
    String::from_utf8_lossy(&record[..take]).into_owned()
}
