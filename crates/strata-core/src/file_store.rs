//! Versioned access to a single backing JSON file.
//!
//! Every load re-reads the file and compares a blake3 hash of its bytes with
//! the last observed content; a difference bumps the version. Writes go
//! through compare-and-swap and land via a temp file in the same directory
//! followed by an atomic rename, so readers never see a partial file.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::document::{BackingDocument, to_pretty_bytes};
use crate::error::{StoreError, StoreResult};

#[derive(Debug)]
struct FileState {
    loaded: bool,
    version: u64,
    hash: Option<blake3::Hash>,
    root: Map<String, Value>,
    corrupt: Option<String>,
}

/// Outcome of re-reading the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Unchanged,
    Changed { version: u64 },
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<FileState>,
    writer: Mutex<()>,
}

impl FileStore {
    /// Create a store for `path`. Nothing is read until the first load.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(FileState {
                loaded: false,
                version: 0,
                hash: None,
                root: Map::new(),
                corrupt: None,
            }),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last version this store wrote or observed.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Read the file and return its document.
    ///
    /// A missing file is an empty document at version 0. A corrupt file
    /// yields `CorruptStore`; the store then holds an empty document.
    pub fn load(&self) -> StoreResult<BackingDocument> {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)?;
        match &state.corrupt {
            Some(message) => Err(self.corrupt(message)),
            None => Ok(self.document(&state)),
        }
    }

    /// Re-read the file, reporting whether its content changed.
    pub fn reload(&self) -> StoreResult<Refresh> {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)
    }

    /// Current in-memory document, without touching disk or the version.
    pub fn snapshot(&self) -> BackingDocument {
        self.document(&self.state.lock())
    }

    /// Error describing why the file is unusable, if it is.
    pub fn corruption(&self) -> Option<StoreError> {
        let state = self.state.lock();
        state.corrupt.as_ref().map(|message| self.corrupt(message))
    }

    /// Write `document` if the file is still at `expected_version`.
    ///
    /// Returns the new version. A corrupt file is never overwritten.
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        document: Map<String, Value>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)?;

        if let Some(message) = &state.corrupt {
            return Err(self.corrupt(message));
        }
        if state.version != expected_version {
            return Err(StoreError::VersionConflict {
                path: self.path.clone(),
                expected: expected_version,
                actual: state.version,
            });
        }

        let bytes = to_pretty_bytes(&document)?;
        self.write_atomic(&bytes)?;

        state.loaded = true;
        state.version += 1;
        state.hash = Some(blake3::hash(&bytes));
        state.root = document;
        tracing::debug!(path = %self.path.display(), version = state.version, "Saved settings file");
        Ok(state.version)
    }

    /// Serialize a whole read-modify-write cycle against this file.
    pub(crate) fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    fn refresh_locked(&self, state: &mut FileState) -> StoreResult<Refresh> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        let hash = bytes.as_deref().map(blake3::hash);

        if state.loaded && state.hash == hash {
            return Ok(Refresh::Unchanged);
        }

        let (root, corrupt) = match bytes.as_deref() {
            None => (Map::new(), None),
            Some(bytes) => match parse_object(bytes) {
                Ok(root) => (root, None),
                Err(message) => (Map::new(), Some(message)),
            },
        };

        if let Some(message) = &corrupt {
            tracing::warn!(path = %self.path.display(), "Settings file is corrupt: {}", message);
        }

        state.version = match (state.loaded, bytes.is_some()) {
            (true, _) => state.version + 1,
            (false, true) => 1,
            (false, false) => 0,
        };
        state.loaded = true;
        state.hash = hash;
        state.root = root;
        state.corrupt = corrupt;
        tracing::debug!(path = %self.path.display(), version = state.version, "Loaded settings file");
        Ok(Refresh::Changed {
            version: state.version,
        })
    }

    fn write_atomic(&self, bytes: &[u8]) -> StoreResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;

        // Dropped without persisting on any early return, removing the temp file.
        let mut tmp = NamedTempFile::new_in(parent).map_err(|err| StoreError::io(parent, err))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| StoreError::io(tmp.path(), err))?;
        tmp.persist(&self.path)
            .map_err(|err| StoreError::io(&self.path, err.error))?;
        Ok(())
    }

    fn document(&self, state: &FileState) -> BackingDocument {
        BackingDocument::new(self.path.clone(), state.version, state.root.clone())
    }

    fn corrupt(&self, message: &str) -> StoreError {
        StoreError::CorruptStore {
            scope: None,
            path: self.path.clone(),
            message: message.to_string(),
        }
    }
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object at the root".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_file_loads_empty_at_version_zero() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("settings.json"));

        let doc = store.load().unwrap();

        assert!(doc.is_empty());
        assert_eq!(doc.version(), 0);
    }

    #[test]
    fn cas_writes_and_bumps_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".claude").join("settings.json");
        let store = FileStore::new(path.clone());

        let doc = store.load().unwrap();
        let version = store
            .compare_and_swap(doc.version(), object(json!({"model": "opus"})))
            .unwrap();

        assert_eq!(version, 1);
        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"model": "opus"}));
    }

    #[test]
    fn cas_with_stale_version_conflicts() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("settings.json"));

        let stale = store.load().unwrap().version();
        store
            .compare_and_swap(stale, object(json!({"model": "opus"})))
            .unwrap();
        let err = store
            .compare_and_swap(stale, object(json!({"model": "haiku"})))
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn external_edit_bumps_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"theme": "dark"}"#).unwrap();
        let store = FileStore::new(path.clone());

        assert_eq!(store.load().unwrap().version(), 1);
        assert_eq!(store.reload().unwrap(), Refresh::Unchanged);

        std::fs::write(&path, r#"{"theme": "light"}"#).unwrap();

        let doc = store.load().unwrap();
        assert_eq!(doc.version(), 2);
        assert_eq!(doc.root().get("theme"), Some(&json!("light")));
    }

    #[test]
    fn corrupt_file_is_reported_and_never_overwritten() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileStore::new(path.clone());

        assert!(matches!(store.load(), Err(StoreError::CorruptStore { .. })));
        assert!(store.snapshot().is_empty());

        let version = store.version();
        let err = store
            .compare_and_swap(version, object(json!({"model": "opus"})))
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptStore { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn non_object_root_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let store = FileStore::new(path);

        assert!(store.load().is_err());
        assert!(store.corruption().is_some());
    }

    #[test]
    fn snapshot_does_not_touch_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"theme": "dark"}"#).unwrap();
        let store = FileStore::new(path.clone());
        store.load().unwrap();

        std::fs::write(&path, r#"{"theme": "light"}"#).unwrap();
        let snapshot = store.snapshot();

        assert_eq!(snapshot.version(), 1);
        assert_eq!(snapshot.root().get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("settings.json"));
        store
            .compare_and_swap(0, object(json!({"env": {"A": "1"}})))
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
