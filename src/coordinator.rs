//! The transaction coordinator: database-table command handlers.
//!
//! Each handler implements one database-table command. Handlers that touch
//! a storage handle acquire its per-database lock for their full body,
//! which is what makes the cross-client bookkeeping in commit/new-oids
//! appear atomic with engine finalization on a multi-threaded runtime.

use crate::error::{DurusError, Result};
use crate::oid::Oid;
use crate::registry::Handle;
use crate::server::ServerState;
use crate::session::ClientState;
use crate::wire::{self, Status};
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn get_handle(state: &ServerState, name: &str) -> Result<Handle> {
    state
        .registry
        .get(name)
        .ok_or_else(|| DurusError::Storage(format!("database not open: {name}")))
}

async fn load_one<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    handle: &Handle,
    client: &ClientState,
    db: &str,
    oid: Oid,
) -> Result<()> {
    if client.is_invalid(db, &oid) {
        wire::write_status_record(stream, Status::Invalid, None).await?;
        return Ok(());
    }
    let mut guard = handle.lock().await;
    match guard.engine.load(oid) {
        Ok(record) => {
            guard.note_load(&record);
            wire::write_status_record(stream, Status::Okay, Some(&record)).await?;
        }
        Err(DurusError::KeyError) => {
            wire::write_status_record(stream, Status::KeyError, None).await?;
        }
        Err(DurusError::Conflict) => {
            wire::write_status_record(stream, Status::Invalid, None).await?;
        }
        Err(other) => return Err(other),
    }
    Ok(())
}

pub async fn handle_load<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    state: &ServerState,
    client: &ClientState,
    db: &str,
) -> Result<()> {
    let handle = get_handle(state, db)?;
    let oid = wire::read_oid(stream).await?;
    load_one(stream, &handle, client, db, oid).await
}

pub async fn handle_bulk_read<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    state: &ServerState,
    client: &ClientState,
    db: &str,
) -> Result<()> {
    let handle = get_handle(state, db)?;
    let count = stream.read_u32().await? as usize;
    for _ in 0..count {
        let oid = wire::read_oid(stream).await?;
        load_one(stream, &handle, client, db, oid).await?;
    }
    Ok(())
}

pub async fn handle_new_oids<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    state: &ServerState,
    client: &ClientState,
    db: &str,
    single: bool,
) -> Result<()> {
    let handle = get_handle(state, db)?;
    let count = if single { 1u32 } else { stream.read_u8().await? as u32 };

    let mut guard = handle.lock().await;
    let mut accepted = Vec::with_capacity(count as usize);
    let max_attempts = 64 * count.max(1) as usize;
    let mut attempts = 0;
    while accepted.len() < count as usize {
        attempts += 1;
        if attempts > max_attempts {
            return Err(DurusError::Storage(
                "oid allocator exceeded its retry bound".to_string(),
            ));
        }
        let candidate = guard.engine.new_oid();
        if !state.clients.any_invalid(db, &candidate) {
            accepted.push(candidate);
        }
    }
    drop(guard);

    client.add_unused(db, accepted.iter().copied());
    for oid in &accepted {
        wire::write_oid(stream, *oid).await?;
    }
    Ok(())
}

pub async fn handle_sync<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    state: &ServerState,
    client: &ClientState,
    db: &str,
) -> Result<()> {
    let handle = get_handle(state, db)?;
    let invalidated = {
        let mut guard = handle.lock().await;
        guard.engine.sync()
    };
    state.clients.for_each(|c| c.add_invalid(db, invalidated.iter().copied()));

    let mine: Vec<Oid> = client.take_invalid(db).into_iter().collect();
    wire::write_oid_vector(stream, &mine).await
}

pub async fn handle_commit<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    state: &ServerState,
    client: &ClientState,
    db: &str,
) -> Result<()> {
    let handle = get_handle(state, db)?;

    // Phase 1: pre-commit invalidation flush. Lock held only long enough
    // to drain the engine's sync queue and this client's invalidation set.
    {
        let mut guard = handle.lock().await;
        let synced = guard.engine.sync();
        state.clients.for_each(|c| c.add_invalid(db, synced.iter().copied()));
    }
    let pre: Vec<Oid> = client.take_invalid(db).into_iter().collect();
    wire::write_oid_vector(stream, &pre).await?;
    stream.flush().await?; // the client decides whether to send a payload based on this vector

    // Phase 2: transaction payload. The lock is released while we wait on
    // this read so a stalled peer blocks only its own task, not the whole
    // database (other sessions keep loading, committing, and allocating).
    let tdata_len = stream.read_u32().await? as usize;
    if tdata_len == 0 {
        return Ok(()); // client chose to abort; no reply, no mutation.
    }
    let mut tdata = vec![0u8; tdata_len];
    stream.read_exact(&mut tdata).await?;

    // Phases 3 through 5 run under the lock again: store, cross-client
    // check, and engine finalization must appear atomic to other sessions.
    let mut guard = handle.lock().await;

    // Phase 3: parse and validate.
    guard.engine.begin();
    let mut committed = HashSet::new();
    let mut i = 0usize;
    while i < tdata_len {
        if i + 4 > tdata_len {
            return Err(DurusError::Protocol("truncated commit entry header".to_string()));
        }
        let rlen = u32::from_be_bytes(tdata[i..i + 4].try_into().unwrap()) as usize;
        if rlen < Oid::SIZE || i + 4 + rlen > tdata_len {
            return Err(DurusError::Protocol("malformed commit entry length".to_string()));
        }
        let oid = Oid(tdata[i + 4..i + 4 + Oid::SIZE].try_into().unwrap());
        let record = tdata[i + 4 + Oid::SIZE..i + 4 + rlen].to_vec();
        guard.engine.store(oid, record);
        committed.insert(oid);
        i += 4 + rlen;
    }
    if i != tdata_len {
        return Err(DurusError::Protocol("commit payload length mismatch".to_string()));
    }

    // Phase 4: cross-client oid integrity check.
    let mut foreign_write = false;
    state.clients.for_each_other(client.id, |c| {
        if c.unused_intersects(db, &committed) {
            foreign_write = true;
        }
    });
    if foreign_write {
        return Err(DurusError::ClientWroteForeignOid);
    }

    // Phase 5: engine finalization.
    let mut concurrent_invalidations: Vec<HashSet<Oid>> = Vec::new();
    let mut on_invalidations = |set: &HashSet<Oid>| concurrent_invalidations.push(set.clone());
    match guard.engine.end(&mut on_invalidations) {
        Err(DurusError::Conflict) => {
            wire::write_status(stream, Status::Invalid).await?;
        }
        Err(other) => return Err(other),
        Ok(committed_oids) => {
            for set in &concurrent_invalidations {
                state.clients.for_each(|c| c.add_invalid(db, set.iter().copied()));
            }
            wire::write_status(stream, Status::Okay).await?;
            client.remove_unused(db, &committed_oids);
            state
                .clients
                .for_each_other(client.id, |c| c.add_invalid(db, committed_oids.iter().copied()));
            guard.bytes_since_pack += (tdata_len + Oid::SIZE) as u64;
        }
    }
    Ok(())
}

/// Open, close, and destroy are delegated straight to the registry and
/// reply with nothing: the client finds out whether they succeeded only
/// through a later command's error, exactly as the reference protocol does.
pub async fn handle_open(state: &ServerState, client: &ClientState, name: &str) -> Result<()> {
    let _ = client; // every client's sets are seeded by the registry itself
    state.registry.open(name, &state.clients).await?;
    Ok(())
}

pub async fn handle_close(state: &ServerState, client: &ClientState, name: &str) -> Result<()> {
    let _ = client;
    state.registry.close(name, &state.clients).await?;
    Ok(())
}

pub async fn handle_destroy(state: &ServerState, name: &str) -> Result<()> {
    state.registry.destroy(name)?;
    Ok(())
}

pub async fn handle_pack<S: AsyncWrite + Unpin>(
    stream: &mut S,
    state: &ServerState,
    name: &str,
) -> Result<()> {
    let handle = get_handle(state, name)?;
    let mut guard = handle.lock().await;
    if guard.packer.is_none() {
        match guard.engine.get_packer() {
            Some(packer) => guard.packer = Some(packer),
            None => {
                guard.engine.pack()?;
                guard.bytes_since_pack = 0;
            }
        }
    }
    wire::write_status(stream, Status::Okay).await
}
