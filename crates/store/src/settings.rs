//! Sync settings management
//!
//! Settings are persisted as `settings.json` in the application data
//! directory. A missing file yields defaults; an unreadable one is logged and
//! replaced by defaults.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main settings container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppSettings {
    /// Autosave and write reconciliation tuning
    pub autosave: AutosaveConfig,
    /// Where local snapshots and the write queue are kept
    pub storage: StorageSettings,
}

/// Autosave configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Whether edits are pushed to the remote store at all
    pub enabled: bool,
    /// Quiet period before a burst of edits is written remotely (milliseconds)
    pub debounce_ms: u64,
    /// Upper bound on a single remote write attempt (milliseconds, 0 = unbounded)
    pub write_timeout_ms: u64,
    /// Minimum spacing between opportunistic queue flushes (milliseconds, 0 = none)
    pub flush_min_interval_ms: u64,
    /// Add an `updatedAt` epoch-millis field to merge writes of object payloads
    pub stamp_updated_at: bool,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 300,
            write_timeout_ms: 15_000,
            flush_min_interval_ms: 0,
            stamp_updated_at: true,
        }
    }
}

impl AutosaveConfig {
    /// Create a new config with a custom debounce period
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Create a new config with a custom write timeout
    pub fn with_write_timeout_ms(mut self, ms: u64) -> Self {
        self.write_timeout_ms = ms;
        self
    }

    /// Create a new config with a minimum interval between opportunistic flushes
    pub fn with_flush_min_interval_ms(mut self, ms: u64) -> Self {
        self.flush_min_interval_ms = ms;
        self
    }

    /// Create a new config that sends payloads exactly as given
    pub fn without_updated_at(mut self) -> Self {
        self.stamp_updated_at = false;
        self
    }

    /// Create a new config with remote autosave disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub fn flush_min_interval(&self) -> Option<Duration> {
        (self.flush_min_interval_ms > 0).then(|| Duration::from_millis(self.flush_min_interval_ms))
    }
}

/// Storage medium selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Directory for the file backend, relative to the data directory
    pub directory: PathBuf,
    /// Optional byte quota for the memory backend
    pub quota_bytes: Option<usize>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            directory: PathBuf::from("local-storage"),
            quota_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::File
    }
}

/// Persisted settings, cached in memory.
///
/// Lives at `settings.json` in the application data directory. A missing
/// file means defaults; an unreadable one is logged and replaced by defaults
/// on the next save.
pub struct SettingsManager {
    settings_path: PathBuf,
    current: AppSettings,
}

impl SettingsManager {
    pub fn new(app_data_dir: PathBuf) -> Self {
        Self {
            settings_path: app_data_dir.join("settings.json"),
            current: AppSettings::default(),
        }
    }

    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Read the settings file, keeping defaults when it is absent or corrupt
    pub fn load(&mut self) -> Result<&AppSettings> {
        self.current = match std::fs::read_to_string(&self.settings_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %self.settings_path.display(),
                    "Ignoring unreadable settings file: {}",
                    e
                );
                AppSettings::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(&self.current)
    }

    /// Write the cached settings back to disk
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.settings_path, serde_json::to_string_pretty(&self.current)?)?;
        Ok(())
    }

    pub fn get(&self) -> &AppSettings {
        &self.current
    }

    /// Replace every section and persist
    pub fn update(&mut self, settings: AppSettings) -> Result<()> {
        self.current = settings;
        self.save()
    }

    /// Replace the autosave section and persist
    pub fn update_autosave(&mut self, autosave: AutosaveConfig) -> Result<()> {
        self.current.autosave = autosave;
        self.save()
    }

    /// Go back to defaults and persist
    pub fn reset(&mut self) -> Result<&AppSettings> {
        self.current = AppSettings::default();
        self.save()?;
        Ok(&self.current)
    }
}
