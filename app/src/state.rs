//! Storage and settings opened from the data directory

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{AppSettings, FileStorage, KeyValueStorage, MemoryStorage, SettingsManager, StorageBackend, UserId};

/// The configured storage medium
pub enum LocalStorage {
    File(Arc<FileStorage>),
    Memory(Arc<MemoryStorage>),
}

impl LocalStorage {
    /// Open the medium selected in `settings`
    pub fn open(data_dir: &Path, settings: &AppSettings) -> Result<Self> {
        let storage = match settings.storage.backend {
            StorageBackend::File => {
                let dir = resolve(data_dir, &settings.storage.directory);
                let storage = FileStorage::open(&dir)
                    .with_context(|| format!("Failed to open local storage at {}", dir.display()))?;
                LocalStorage::File(Arc::new(storage))
            }
            StorageBackend::Memory => LocalStorage::Memory(Arc::new(match settings.storage.quota_bytes {
                Some(quota) => MemoryStorage::with_quota(quota),
                None => MemoryStorage::new(),
            })),
        };
        Ok(storage)
    }

    pub fn shared(&self) -> Arc<dyn KeyValueStorage> {
        match self {
            LocalStorage::File(storage) => storage.clone(),
            LocalStorage::Memory(storage) => storage.clone(),
        }
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        match self {
            LocalStorage::File(storage) => Ok(storage.keys()?),
            LocalStorage::Memory(storage) => Ok(storage.keys()),
        }
    }

    /// Ids of the documents with a cached snapshot for `user`
    pub fn cached_documents(&self, user: &UserId) -> Result<Vec<String>> {
        let prefix = format!("autosave:{}:", user);
        let mut ids: Vec<String> = self
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn resolve(data_dir: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        data_dir.join(dir)
    }
}

/// Load settings from `data_dir/settings.json`, falling back to defaults
pub fn load_settings(data_dir: &Path) -> Result<SettingsManager> {
    let mut manager = SettingsManager::new(data_dir.to_path_buf());
    let path = manager.settings_path().clone();
    manager
        .load()
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(manager)
}
