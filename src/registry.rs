//! Name → open-storage mapping, disk discovery, and path safety.

use crate::error::{DurusError, Result};
use crate::session::ClientRegistry;
use crate::storage::{FileStorage, OpenDatabase};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DB_EXTENSION: &str = "durus";

pub type Handle = Arc<Mutex<OpenDatabase>>;

pub struct StorageRegistry {
    root: PathBuf,
    open: DashMap<String, Handle>,
}

impl StorageRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            open: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every `<name>.durus` file directly under the root.
    pub fn names_on_disk(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(DB_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn names_open(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Handle> {
        self.open.get(name).map(|e| e.clone())
    }

    /// Resolves `<root>/<name>.durus`, rejecting any resolution that
    /// escapes `root` (defends against `..` traversal in `name`).
    pub fn safe_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(DurusError::PathSafety("database name is empty".to_string()));
        }
        let candidate = self.root.join(format!("{name}.{DB_EXTENSION}"));

        // The file may not exist yet (first open), so canonicalize the
        // parent directory and reattach the file name rather than the
        // whole path.
        let parent = candidate
            .parent()
            .ok_or_else(|| DurusError::PathSafety(format!("no parent for {name}")))?;
        std::fs::create_dir_all(&self.root)?;
        let canon_root = self.root.canonicalize()?;
        let canon_parent = if parent == self.root {
            canon_root.clone()
        } else {
            parent
                .canonicalize()
                .map_err(|_| DurusError::PathSafety(format!("database name escapes root: {name}")))?
        };
        if !canon_parent.starts_with(&canon_root) {
            return Err(DurusError::PathSafety(format!("database name escapes root: {name}")));
        }
        Ok(canon_parent.join(candidate.file_name().unwrap()))
    }

    /// Idempotent: opening an already-open name is a no-op.
    pub async fn open(&self, name: &str, clients: &ClientRegistry) -> Result<Handle> {
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }
        let path = self.safe_path(name)?;
        let engine = FileStorage::open(path)?;
        let handle: Handle = Arc::new(Mutex::new(OpenDatabase::new(Box::new(engine))));
        self.open.insert(name.to_string(), handle.clone());
        clients.add_database(name);
        Ok(handle)
    }

    pub async fn close(&self, name: &str, clients: &ClientRegistry) -> Result<()> {
        if let Some((_, handle)) = self.open.remove(name) {
            handle.lock().await.engine.close()?;
        }
        clients.remove_database(name);
        Ok(())
    }

    /// Silent no-op while `name` is open; otherwise unlinks the file and
    /// propagates filesystem errors. The asymmetry is deliberate: a
    /// concurrent destroy of an in-use database should not surface as an
    /// error to whoever is using it.
    pub fn destroy(&self, name: &str) -> Result<()> {
        if self.open.contains_key(name) {
            return Ok(());
        }
        let path = self.safe_path(name)?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Closes every open database. Used by the `Q` (quit) handler.
    pub async fn close_all(&self) -> Result<()> {
        let names: Vec<String> = self.open.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.open.remove(&name) {
                handle.lock().await.engine.close()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StorageRegistry::new(dir.path().to_path_buf());
        let err = registry.safe_path("../escape").unwrap_err();
        assert!(matches!(err, DurusError::PathSafety(_)));
    }

    #[test]
    fn safe_path_resolves_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StorageRegistry::new(dir.path().to_path_buf());
        let path = registry.safe_path("accounts").unwrap();
        assert!(path.starts_with(dir.path().canonicalize().unwrap()));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "accounts.durus");
    }

    #[test]
    fn names_on_disk_lists_durus_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.durus"), b"").unwrap();
        std::fs::write(dir.path().join("b.durus"), b"").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"").unwrap();
        let registry = StorageRegistry::new(dir.path().to_path_buf());
        assert_eq!(registry.names_on_disk().unwrap(), vec!["a", "b"]);
    }
}
