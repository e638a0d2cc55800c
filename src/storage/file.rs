//! Append-only single-file storage engine.
//!
//! Entry format:
//!
//! ```text
//! crc:u32 | oid:u8[8] | len:u32 | record:u8[len]
//! ```
//!
//! `crc` covers `oid ++ record`. On open the file is scanned front to back
//! to build an in-memory offset index; a torn write at the tail (partial
//! entry or checksum mismatch) is treated as a crash artifact and the file
//! is truncated back to the last good boundary rather than failing to
//! open rather than failing, the same way a write-ahead log tolerates a
//! partial final page.

use crate::error::{DurusError, Result};
use crate::oid::Oid;
use crate::storage::{Packer, StorageEngine};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 4 + 8 + 4; // crc + oid + len

struct IndexEntry {
    offset: u64,
    len: u32,
}

pub struct FileStorage {
    path: PathBuf,
    file: File,
    index: HashMap<Oid, IndexEntry>,
    next_oid: u64,
    write_cursor: u64,
    pending: Vec<(Oid, Vec<u8>)>,
    commit_log: Vec<HashSet<Oid>>,
    sync_cursor: usize,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (index, next_oid, write_cursor) = scan(&mut file)?;

        Ok(Self {
            path,
            file,
            index,
            next_oid,
            write_cursor,
            pending: Vec::new(),
            commit_log: Vec::new(),
            sync_cursor: 0,
        })
    }

    fn read_record(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(entry.offset + HEADER_LEN))?;
        let mut buf = vec![0u8; entry.len as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Scans the file from the start, returning the offset index, the next
/// free OID counter, and the byte offset of the last good entry boundary.
fn scan(file: &mut File) -> Result<(HashMap<Oid, IndexEntry>, u64, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut index = HashMap::new();
    let mut max_oid: u64 = 0;
    let mut offset: u64 = 0;

    loop {
        let mut header = [0u8; HEADER_LEN as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(_) => break, // short/absent header: clean EOF or torn write
        }
        let crc = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let oid = Oid(header[4..12].try_into().unwrap());
        let len = u32::from_be_bytes(header[12..16].try_into().unwrap());

        let mut record = vec![0u8; len as usize];
        if file.read_exact(&mut record).is_err() {
            break; // torn write: record body truncated
        }

        let mut check = crc32c::crc32c(oid.as_bytes());
        check = crc32c::crc32c_append(check, &record);
        if check != crc {
            break; // torn write: checksum mismatch
        }

        index.insert(oid, IndexEntry { offset, len });
        max_oid = max_oid.max(oid.as_u64());
        offset += HEADER_LEN + len as u64;
    }

    if file.metadata()?.len() != offset {
        file.set_len(offset)?;
    }

    Ok((index, max_oid + 1, offset))
}

impl StorageEngine for FileStorage {
    fn load(&mut self, oid: Oid) -> Result<Vec<u8>> {
        let entry = match self.index.get(&oid) {
            Some(e) => IndexEntry { offset: e.offset, len: e.len },
            None => return Err(DurusError::KeyError),
        };
        self.read_record(&entry)
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) {
        self.pending.push((oid, record));
    }

    fn begin(&mut self) {
        self.pending.clear();
    }

    fn end(&mut self, _on_invalidations: &mut dyn FnMut(&HashSet<Oid>)) -> Result<HashSet<Oid>> {
        let pending = std::mem::take(&mut self.pending);
        let mut committed = HashSet::with_capacity(pending.len());

        self.file.seek(SeekFrom::Start(self.write_cursor))?;
        for (oid, record) in &pending {
            let mut crc = crc32c::crc32c(oid.as_bytes());
            crc = crc32c::crc32c_append(crc, record);

            self.file.write_all(&crc.to_be_bytes())?;
            self.file.write_all(oid.as_bytes())?;
            self.file.write_all(&(record.len() as u32).to_be_bytes())?;
            self.file.write_all(record)?;

            self.index.insert(
                *oid,
                IndexEntry {
                    offset: self.write_cursor,
                    len: record.len() as u32,
                },
            );
            self.write_cursor += HEADER_LEN + record.len() as u64;
            committed.insert(*oid);
        }
        self.file.sync_all()?;

        self.commit_log.push(committed.clone());
        Ok(committed)
    }

    fn new_oid(&mut self) -> Oid {
        let oid = Oid::from_u64(self.next_oid);
        self.next_oid += 1;
        oid
    }

    fn sync(&mut self) -> HashSet<Oid> {
        let mut result = HashSet::new();
        for batch in &self.commit_log[self.sync_cursor..] {
            result.extend(batch.iter().copied());
        }
        self.sync_cursor = self.commit_log.len();
        result
    }

    fn pack(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("durus.pack");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut new_index = HashMap::with_capacity(self.index.len());
        let mut cursor = 0u64;
        for (oid, entry) in &self.index {
            let record = self.read_record(&IndexEntry {
                offset: entry.offset,
                len: entry.len,
            })?;
            let mut crc = crc32c::crc32c(oid.as_bytes());
            crc = crc32c::crc32c_append(crc, &record);

            tmp.write_all(&crc.to_be_bytes())?;
            tmp.write_all(oid.as_bytes())?;
            tmp.write_all(&(record.len() as u32).to_be_bytes())?;
            tmp.write_all(&record)?;

            new_index.insert(*oid, IndexEntry { offset: cursor, len: entry.len });
            cursor += HEADER_LEN + entry.len as u64;
        }
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.index = new_index;
        self.write_cursor = cursor;
        Ok(())
    }

    fn get_packer(&mut self) -> Option<Box<dyn Packer>> {
        None
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
