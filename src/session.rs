//! Connected-client bookkeeping and the per-connection command loop.

use crate::coordinator;
use crate::error::{DurusError, Result};
use crate::oid::Oid;
use crate::server::ServerState;
use crate::wire::{self, PROTOCOL_VERSION};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Per-(client, database) bookkeeping: which OIDs this client must be told
/// about before using them, and which OIDs it has been allocated but not
/// yet committed.
#[derive(Default)]
struct DbState {
    invalid: HashSet<Oid>,
    unused: HashSet<Oid>,
}

pub struct ClientState {
    pub id: u64,
    by_db: Mutex<HashMap<String, DbState>>,
}

impl ClientState {
    fn new(id: u64) -> Self {
        Self {
            id,
            by_db: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_db(&self, name: &str) {
        self.by_db.lock().unwrap().entry(name.to_string()).or_default();
    }

    fn remove_db(&self, name: &str) {
        self.by_db.lock().unwrap().remove(name);
    }

    pub fn is_invalid(&self, db: &str, oid: &Oid) -> bool {
        self.by_db
            .lock()
            .unwrap()
            .get(db)
            .map(|s| s.invalid.contains(oid))
            .unwrap_or(false)
    }

    pub fn add_invalid<I: IntoIterator<Item = Oid>>(&self, db: &str, oids: I) {
        let mut guard = self.by_db.lock().unwrap();
        guard.entry(db.to_string()).or_default().invalid.extend(oids);
    }

    /// Returns and clears the current invalidation set.
    pub fn take_invalid(&self, db: &str) -> HashSet<Oid> {
        let mut guard = self.by_db.lock().unwrap();
        guard
            .entry(db.to_string())
            .or_default()
            .invalid
            .drain()
            .collect()
    }

    pub fn add_unused<I: IntoIterator<Item = Oid>>(&self, db: &str, oids: I) {
        let mut guard = self.by_db.lock().unwrap();
        guard.entry(db.to_string()).or_default().unused.extend(oids);
    }

    pub fn remove_unused(&self, db: &str, oids: &HashSet<Oid>) {
        let mut guard = self.by_db.lock().unwrap();
        if let Some(state) = guard.get_mut(db) {
            for oid in oids {
                state.unused.remove(oid);
            }
        }
    }

    pub fn unused_intersects(&self, db: &str, oids: &HashSet<Oid>) -> bool {
        self.by_db
            .lock()
            .unwrap()
            .get(db)
            .map(|s| s.unused.iter().any(|o| oids.contains(o)))
            .unwrap_or(false)
    }
}

/// The set of connected clients. Lives on `ServerState` and is consulted
/// by the registry (to seed/evict per-database entries) and the
/// coordinator (to fan out invalidations and check unused-OID conflicts).
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<u64, Arc<ClientState>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<ClientState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ClientState::new(id));
        self.clients.insert(id, state.clone());
        state
    }

    pub fn remove(&self, id: u64) {
        self.clients.remove(&id);
    }

    pub fn add_database(&self, name: &str) {
        for entry in self.clients.iter() {
            entry.value().ensure_db(name);
        }
    }

    pub fn remove_database(&self, name: &str) {
        for entry in self.clients.iter() {
            entry.value().remove_db(name);
        }
    }

    pub fn for_each_other(&self, exclude: u64, mut f: impl FnMut(&Arc<ClientState>)) {
        for entry in self.clients.iter() {
            if *entry.key() != exclude {
                f(entry.value());
            }
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<ClientState>)) {
        for entry in self.clients.iter() {
            f(entry.value());
        }
    }

    /// Whether `oid` appears in *any* connected client's `invalid[db]`.
    /// The allocator must never hand out such an OID, or a fresh OID could
    /// collide with one a concurrent writer has already invalidated.
    pub fn any_invalid(&self, db: &str, oid: &Oid) -> bool {
        self.clients.iter().any(|entry| entry.value().is_invalid(db, oid))
    }
}

/// Owns one connection's socket and drives its command loop.
pub struct Session {
    stream: BufStream<TcpStream>,
    client: Arc<ClientState>,
    state: Arc<ServerState>,
}

impl Session {
    pub fn new(stream: TcpStream, client: Arc<ClientState>, state: Arc<ServerState>) -> Self {
        Self {
            stream: BufStream::new(stream),
            client,
            state,
        }
    }

    /// Runs the command loop until the peer disconnects, errors, or sends
    /// `.`/`Q`. Returns `true` if the server should stop (quit).
    pub async fn run(&mut self) -> Result<bool> {
        loop {
            let command = match self.stream.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e.into()),
            };

            let should_stop = match command {
                b'V' => {
                    self.stream.write_u32(PROTOCOL_VERSION).await?;
                    self.stream.flush().await?;
                    false
                }
                b'A' => {
                    let names = self.state.registry.names_on_disk()?;
                    write_name_vector(&mut self.stream, &names).await?;
                    self.stream.flush().await?;
                    false
                }
                b'E' => {
                    let names = self.state.registry.names_open();
                    write_name_vector(&mut self.stream, &names).await?;
                    self.stream.flush().await?;
                    false
                }
                b'Q' => true,
                b'.' => return Ok(false),
                b'B' | b'C' | b'D' | b'L' | b'M' | b'N' | b'O' | b'P' | b'S' | b'X' => {
                    let name_bytes = wire::read_counted_bytes(&mut self.stream).await?;
                    let name = String::from_utf8_lossy(&name_bytes).into_owned();
                    self.dispatch_db_command(command, &name).await?;
                    self.stream.flush().await?;
                    false
                }
                other => return Err(DurusError::UnknownCommand(other)),
            };

            if should_stop {
                return Ok(true);
            }
        }
    }

    async fn dispatch_db_command(&mut self, command: u8, name: &str) -> Result<()> {
        match command {
            b'O' => coordinator::handle_open(&self.state, &self.client, name).await,
            b'X' => coordinator::handle_close(&self.state, &self.client, name).await,
            b'D' => coordinator::handle_destroy(&self.state, name).await,
            b'L' => coordinator::handle_load(&mut self.stream, &self.state, &self.client, name).await,
            b'B' => coordinator::handle_bulk_read(&mut self.stream, &self.state, &self.client, name).await,
            b'M' => coordinator::handle_new_oids(&mut self.stream, &self.state, &self.client, name, false).await,
            b'N' => coordinator::handle_new_oids(&mut self.stream, &self.state, &self.client, name, true).await,
            b'S' => coordinator::handle_sync(&mut self.stream, &self.state, &self.client, name).await,
            b'C' => coordinator::handle_commit(&mut self.stream, &self.state, &self.client, name).await,
            b'P' => coordinator::handle_pack(&mut self.stream, &self.state, name).await,
            _ => unreachable!("dispatch_db_command called with non-database command"),
        }
    }
}

async fn write_name_vector<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, names: &[String]) -> Result<()> {
    writer.write_u32(names.len() as u32).await?;
    for name in names {
        wire::write_counted_bytes(writer, name.as_bytes()).await?;
    }
    Ok(())
}
