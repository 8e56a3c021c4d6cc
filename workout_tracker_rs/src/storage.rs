//! Key-value persistence shared by the foreground controller and the
//! background bridge.
//!
//! The two contexts never talk directly; every handoff goes through one of the
//! keys below. Values are JSON strings so any platform store can hold them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{TrackResult, TrackingError};

pub const SESSION_STATE_KEY: &str = "session_state";
pub const BACKGROUND_STATE_KEY: &str = "background_accumulator_state";
pub const SAMPLE_BUFFER_KEY: &str = "background_sample_buffer";
pub const RECOVERY_SNAPSHOT_KEY: &str = "recovery_snapshot";
pub const STOPPED_MARKER_KEY: &str = "session_stopped_marker";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> TrackResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> TrackResult<()>;
    fn remove(&self, key: &str) -> TrackResult<()>;
}

/// Read and decode a JSON value. Undecodable values are dropped and reported
/// as absent so a corrupt record never blocks a session.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> TrackResult<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            log::warn!("discarding undecodable '{}' record: {}", key, e);
            store.remove(key)?;
            Ok(None)
        }
    }
}

pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> TrackResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

// ─── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> TrackingError {
    TrackingError::Storage("store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> TrackResult<Option<String>> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> TrackResult<()> {
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> TrackResult<()> {
        self.entries.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

// ─── File-backed store ───────────────────────────────────────────────────────

/// One `<key>.json` file per key inside a directory. Writes go through a
/// temporary file and a rename so a reader never sees a half-written record.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    // Serialises writers inside this process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> TrackResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> TrackResult<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(TrackingError::Storage(format!("invalid key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> TrackResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> TrackResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> TrackResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        value: u32,
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        save_json(&store, "probe", &Probe { value: 7 }).unwrap();
        let back: Option<Probe> = load_json(&store, "probe").unwrap();
        assert_eq!(back, Some(Probe { value: 7 }));
        store.remove("probe").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_record_is_dropped() {
        let store = MemoryStore::new();
        store.set("probe", "{garbage").unwrap();
        let back: Option<Probe> = load_json(&store, "probe").unwrap();
        assert!(back.is_none());
        assert!(store.get("probe").unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set(SESSION_STATE_KEY, "{\"a\":1}").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(SESSION_STATE_KEY).unwrap().as_deref(), Some("{\"a\":1}"));
        store.remove(SESSION_STATE_KEY).unwrap();
        store.remove(SESSION_STATE_KEY).unwrap();
        assert!(store.get(SESSION_STATE_KEY).unwrap().is_none());
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.set("../escape", "x").is_err());
    }
}
