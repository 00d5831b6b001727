//! Collaborator ports
//!
//! Platform permission prompts, a key-value store for cached catalog layouts
//! and a file sink for log export. Defaults are file-system backed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Platform permission prompt (scan + connect)
pub trait PermissionProvider: Send + Sync {
    /// Returns true when every required permission is granted
    fn request(&self) -> bool;
}

/// Desktop platforms have no runtime prompt
pub struct GrantedPermissions;

impl PermissionProvider for GrantedPermissions {
    fn request(&self) -> bool {
        true
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Key-value store persisted as a single JSON object
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// `<config dir>/BikeTelemetry/layouts.json`
    pub fn default_location() -> anyhow::Result<Self> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BikeTelemetry");
        fs::create_dir_all(&path)?;
        path.push("layouts.json");
        Self::open(path)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        entries.insert(key.to_string(), value.to_string());
        let json = serde_json::to_string_pretty(&*entries)?;
        fs::write(&self.path, json)?;
        debug!("Stored key {} in {}", key, self.path.display());
        Ok(())
    }
}

/// Writes a full text blob to a named destination
pub trait FileSink: Send + Sync {
    /// Returns a human-readable destination on success
    fn write_text(&self, name: &str, contents: &str) -> anyhow::Result<String>;
}

pub struct DirectoryFileSink {
    dir: PathBuf,
}

impl DirectoryFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/BikeTelemetry`, or the working directory if unknown
    pub fn default_location() -> Self {
        let dir = dirs::data_dir()
            .map(|dir| dir.join("BikeTelemetry"))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileSink for DirectoryFileSink {
    fn write_text(&self, name: &str, contents: &str) -> anyhow::Result<String> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        fs::write(&path, contents)?;
        Ok(path.display().to_string())
    }
}
