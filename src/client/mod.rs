//! A client library mirroring the wire protocol.
//!
//! This is a thin, directly-addressable transactional API: callers open a
//! database, load/store records by OID, and commit. Object graph
//! serialization is left entirely to the caller: a record here is just
//! the bytes the application wants stored under an OID.

use crate::error::{DurusError, Result};
use crate::oid::Oid;
use crate::wire::{self, Status, PROTOCOL_VERSION};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// The outcome of a single-OID load.
#[derive(Debug)]
pub enum Loaded {
    Found(Vec<u8>),
    Missing,
    /// Read conflict: the caller must `sync` before trying again.
    Invalid,
}

/// Raised when a commit's pre-commit invalidation callback rejects the
/// transaction, or the server reports a write conflict.
#[derive(Debug, thiserror::Error)]
#[error("write conflict")]
pub struct WriteConflict;

/// Default size of a pool refill batch.
const DEFAULT_POOL_BATCH: u8 = 32;

pub struct Client {
    stream: BufStream<TcpStream>,
    /// Per-database LIFO pool of OIDs allocated but not yet used locally.
    pools: HashMap<String, Vec<Oid>>,
    /// Records staged for the next commit to each open database.
    pending: HashMap<String, Vec<(Oid, Vec<u8>)>>,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self {
            stream: BufStream::new(stream),
            pools: HashMap::new(),
            pending: HashMap::new(),
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        self.stream.write_u8(b'V').await?;
        self.stream.flush().await?;
        let got = self.stream.read_u32().await?;
        if got != PROTOCOL_VERSION {
            return Err(DurusError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got,
            });
        }
        Ok(())
    }

    async fn write_db_name(&mut self, command: u8, db: &str) -> Result<()> {
        self.stream.write_u8(command).await?;
        wire::write_counted_bytes(&mut self.stream, db.as_bytes()).await
    }

    async fn read_name_vector(&mut self) -> Result<Vec<String>> {
        let count = self.stream.read_u32().await? as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            let bytes = wire::read_counted_bytes(&mut self.stream).await?;
            names.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(names)
    }

    pub async fn enumerate_all(&mut self) -> Result<Vec<String>> {
        self.stream.write_u8(b'A').await?;
        self.stream.flush().await?;
        self.read_name_vector().await
    }

    pub async fn enumerate_open(&mut self) -> Result<Vec<String>> {
        self.stream.write_u8(b'E').await?;
        self.stream.flush().await?;
        self.read_name_vector().await
    }

    pub async fn quit(&mut self) -> Result<()> {
        self.stream.write_u8(b'Q').await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.stream.write_u8(b'.').await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn expect_okay(&mut self) -> Result<()> {
        match wire::read_status(&mut self.stream).await? {
            Status::Okay => Ok(()),
            other => Err(DurusError::Storage(format!("unexpected status {other:?}"))),
        }
    }

    pub async fn open(&mut self, db: &str) -> Result<()> {
        self.write_db_name(b'O', db).await?;
        self.stream.flush().await?;
        self.pools.entry(db.to_string()).or_default();
        self.pending.entry(db.to_string()).or_default();
        Ok(())
    }

    pub async fn close(&mut self, db: &str) -> Result<()> {
        self.write_db_name(b'X', db).await?;
        self.stream.flush().await?;
        self.pools.remove(db);
        self.pending.remove(db);
        Ok(())
    }

    pub async fn destroy(&mut self, db: &str) -> Result<()> {
        self.write_db_name(b'D', db).await?;
        self.stream.flush().await
    }

    pub async fn pack(&mut self, db: &str) -> Result<()> {
        self.write_db_name(b'P', db).await?;
        self.stream.flush().await?;
        self.expect_okay().await
    }

    pub async fn load(&mut self, db: &str, oid: Oid) -> Result<Loaded> {
        self.write_db_name(b'L', db).await?;
        wire::write_oid(&mut self.stream, oid).await?;
        self.stream.flush().await?;
        match wire::read_status(&mut self.stream).await? {
            Status::Okay => Ok(Loaded::Found(wire::read_counted_bytes(&mut self.stream).await?)),
            Status::KeyError => Ok(Loaded::Missing),
            Status::Invalid => Ok(Loaded::Invalid),
        }
    }

    pub async fn bulk_read(&mut self, db: &str, oids: &[Oid]) -> Result<Vec<Loaded>> {
        self.write_db_name(b'B', db).await?;
        self.stream.write_u32(oids.len() as u32).await?;
        for oid in oids {
            wire::write_oid(&mut self.stream, *oid).await?;
        }
        self.stream.flush().await?;

        let mut results = Vec::with_capacity(oids.len());
        for _ in oids {
            let outcome = match wire::read_status(&mut self.stream).await? {
                Status::Okay => Loaded::Found(wire::read_counted_bytes(&mut self.stream).await?),
                Status::KeyError => Loaded::Missing,
                Status::Invalid => Loaded::Invalid,
            };
            results.push(outcome);
        }
        Ok(results)
    }

    async fn refill_pool(&mut self, db: &str, count: u8) -> Result<()> {
        self.write_db_name(b'M', db).await?;
        self.stream.write_u8(count).await?;
        self.stream.flush().await?;

        let mut batch = Vec::with_capacity(count as usize);
        for _ in 0..count {
            batch.push(wire::read_oid(&mut self.stream).await?);
        }
        self.pools.entry(db.to_string()).or_default().extend(batch);
        Ok(())
    }

    /// Pops an OID off the local pool, refilling from the server in
    /// batches of `DEFAULT_POOL_BATCH` when empty.
    pub async fn allocate(&mut self, db: &str) -> Result<Oid> {
        if self.pools.get(db).map(|p| p.is_empty()).unwrap_or(true) {
            self.refill_pool(db, DEFAULT_POOL_BATCH).await?;
        }
        self.pools
            .get_mut(db)
            .and_then(|p| p.pop())
            .ok_or_else(|| DurusError::Storage("oid pool refill returned nothing".to_string()))
    }

    pub async fn sync(&mut self, db: &str) -> Result<Vec<Oid>> {
        self.write_db_name(b'S', db).await?;
        self.stream.flush().await?;
        wire::read_oid_vector(&mut self.stream).await
    }

    /// Stages a record for the next `commit` on `db`. Returns the
    /// allocated-but-unused OIDs this record's OID will be removed from
    /// on success.
    pub fn stage(&mut self, db: &str, oid: Oid, record: Vec<u8>) {
        self.pending.entry(db.to_string()).or_default().push((oid, record));
    }

    /// Sends `C`, delivers the pre-commit invalidation list to
    /// `on_invalidations`, and, unless that callback rejects the
    /// transaction, marshals every staged record into the commit
    /// payload. On a server-reported write conflict the staged records
    /// are left in place for the caller to retry after a `sync`.
    pub async fn commit<F>(&mut self, db: &str, mut on_invalidations: F) -> Result<()>
    where
        F: FnMut(&[Oid]) -> std::result::Result<(), WriteConflict>,
    {
        self.write_db_name(b'C', db).await?;
        self.stream.flush().await?;
        let invalidated = wire::read_oid_vector(&mut self.stream).await?;

        if on_invalidations(&invalidated).is_err() {
            self.stream.write_u32(0).await?;
            self.stream.flush().await?;
            return Err(DurusError::Conflict);
        }

        let staged = self.pending.get(db).cloned().unwrap_or_default();
        let tdata_len: usize = staged.iter().map(|(_, data)| 4 + Oid::SIZE + data.len()).sum();

        self.stream.write_u32(tdata_len as u32).await?;
        for (oid, record) in &staged {
            let rlen = (Oid::SIZE + record.len()) as u32;
            self.stream.write_u32(rlen).await?;
            wire::write_oid(&mut self.stream, *oid).await?;
            self.stream.write_all(record).await?;
        }
        self.stream.flush().await?;

        if tdata_len > 0 {
            match wire::read_status(&mut self.stream).await? {
                Status::Okay => {
                    let committed: std::collections::HashSet<Oid> =
                        staged.iter().map(|(oid, _)| *oid).collect();
                    if let Some(p) = self.pending.get_mut(db) {
                        p.retain(|(oid, _)| !committed.contains(oid));
                    }
                }
                Status::Invalid => return Err(DurusError::Conflict),
                other => return Err(DurusError::Storage(format!("unexpected commit status {other:?}"))),
            }
        }
        Ok(())
    }
}
