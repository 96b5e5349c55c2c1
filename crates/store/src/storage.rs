//! Durable key/value storage medium.
//!
//! The local cache, the write queue and the last-sync record all live in a
//! flat string-keyed store with synchronous `get_item` / `set_item` /
//! `remove_item`, mirroring browser local storage. Two backends are provided:
//!
//! - [`MemoryStorage`]: in-process map, optionally capped by a byte quota
//! - [`FileStorage`]: one file per key under a directory, written atomically
//!
//! # Key layout
//!
//! ```text
//! autosave:{userId}:{documentId}  -> JSON payload
//! writeQueue:{userId}             -> JSON array of queue items
//! lastSync:{userId}               -> epoch millis
//! ```

use crate::{DocId, Result, StoreError, UserId};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Key of a local cache entry
pub fn autosave_key(user: &UserId, document_id: &DocId) -> String {
    format!("autosave:{}:{}", user, document_id)
}

/// Key of a user's write queue
pub fn queue_key(user: &UserId) -> String {
    format!("writeQueue:{}", user)
}

/// Key of a user's last successful sync timestamp
pub fn last_sync_key(user: &UserId) -> String {
    format!("lastSync:{}", user)
}

/// Synchronous string key/value storage.
///
/// Implementations must be safe to share between every open view of the
/// application; each individual call is atomic with respect to the others.
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-memory storage backend.
///
/// Used in tests and for sessions where nothing may touch the disk. A byte
/// quota can be configured to reproduce "quota exceeded" failures, and the
/// whole medium can be switched off to reproduce an unavailable store.
#[derive(Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty, unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that rejects writes once keys plus values
    /// exceed `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Simulate the medium disappearing (or coming back)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Bytes currently used by keys and values
    pub fn used_bytes(&self) -> usize {
        self.items
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory storage disabled".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.items.read().unwrap().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut items = self.items.write().unwrap();

        if let Some(quota) = self.quota_bytes {
            let replaced = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let used: usize = items.iter().map(|(k, v)| k.len() + v.len()).sum();
            let required = used - replaced + key.len() + value.len();
            if required > quota {
                return Err(StoreError::QuotaExceeded { required, quota });
            }
        }

        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.items.write().unwrap().remove(key);
        Ok(())
    }
}

/// Staging directory for in-progress writes. Encoding always escapes `%`,
/// so no key maps to this name.
const STAGING_DIR: &str = "%staging";

/// File-backed storage backend.
///
/// Each key becomes one file in the root directory, its name percent-encoded
/// so `autosave:u1:noteA` is stored as `autosave%3Au1%3AnoteA`. Writes go to
/// a file in a staging directory that is then renamed into place, so a crash
/// never leaves a half-written value behind.
pub struct FileStorage {
    root: PathBuf,
    /// Serializes writers; readers rely on the atomic rename
    write_lock: RwLock<()>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self {
            root,
            write_lock: RwLock::new(()),
        })
    }

    /// The storage directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All keys currently stored, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(key) = urlencoding::decode(name) {
                keys.push(key.into_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // `.` is never escaped, so these would name directories
        if key.is_empty() || key == "." || key == ".." {
            return Err(StoreError::InvalidKey(format!("{:?}", key)));
        }
        Ok(self.root.join(urlencoding::encode(key).as_ref()))
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.read().unwrap();
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp_path = self.root.join(STAGING_DIR).join(urlencoding::encode(key).as_ref());
        let _guard = self.write_lock.write().unwrap();

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.write().unwrap();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
