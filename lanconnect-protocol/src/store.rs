//! Persistent trust and plugin cache storage
//!
//! Trust decisions are keyed by certificate fingerprint so that a device id
//! presented with a different certificate is never trusted implicitly.
//! Plugin caches are small JSON maps keyed by (plugin id, device id).

use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Stored trust decisions
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn is_trusted(&self, fingerprint: &str) -> bool;

    async fn set_trusted(&self, fingerprint: &str, trusted: bool) -> Result<()>;
}

/// Stored plugin properties
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Every stored property for (plugin, device)
    async fn load_all(&self, plugin: &str, device: &str) -> Result<Map<String, Value>>;

    /// Load the requested properties; missing ones are simply absent
    async fn load(&self, plugin: &str, device: &str, names: &[&str]) -> Result<Map<String, Value>> {
        let values = self.load_all(plugin, device).await?;
        Ok(select(&values, names))
    }

    /// Replace the stored properties for (plugin, device)
    async fn save(&self, plugin: &str, device: &str, values: &Map<String, Value>) -> Result<()>;
}

/// In-memory trust store
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    trusted: Mutex<BTreeMap<String, bool>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn is_trusted(&self, fingerprint: &str) -> bool {
        self.trusted.lock().await.contains_key(fingerprint)
    }

    async fn set_trusted(&self, fingerprint: &str, trusted: bool) -> Result<()> {
        let mut map = self.trusted.lock().await;
        if trusted {
            map.insert(fingerprint.to_string(), true);
        } else {
            map.remove(fingerprint);
        }
        Ok(())
    }
}

/// Trust store backed by a JSON file, rewritten on every change
#[derive(Debug)]
pub struct JsonTrustStore {
    path: PathBuf,
    trusted: Mutex<BTreeMap<String, bool>>,
}

impl JsonTrustStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let trusted = if path.exists() {
            let json = fs::read_to_string(&path)?;
            let map: BTreeMap<String, bool> = serde_json::from_str(&json)?;
            info!("Loaded {} trusted certificates from {:?}", map.len(), path);
            map
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            trusted: Mutex::new(trusted),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrustStore for JsonTrustStore {
    async fn is_trusted(&self, fingerprint: &str) -> bool {
        self.trusted.lock().await.contains_key(fingerprint)
    }

    async fn set_trusted(&self, fingerprint: &str, trusted: bool) -> Result<()> {
        let mut map = self.trusted.lock().await;
        let changed = if trusted {
            map.insert(fingerprint.to_string(), true).is_none()
        } else {
            map.remove(fingerprint).is_some()
        };
        if !changed {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&*map)?;
        tokio::fs::write(&self.path, json).await?;
        debug!("Saved trust store to {:?}", self.path);
        Ok(())
    }
}

/// In-memory plugin cache
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<(String, String), Map<String, Value>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn select(values: &Map<String, Value>, names: &[&str]) -> Map<String, Value> {
    names
        .iter()
        .filter_map(|name| {
            values
                .get(*name)
                .map(|value| (name.to_string(), value.clone()))
        })
        .collect()
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load_all(&self, plugin: &str, device: &str) -> Result<Map<String, Value>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&(plugin.to_string(), device.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, plugin: &str, device: &str, values: &Map<String, Value>) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert((plugin.to_string(), device.to_string()), values.clone());
        Ok(())
    }
}

/// Plugin cache stored as `<dir>/<device>/<plugin>.json`
#[derive(Debug, Clone)]
pub struct JsonCacheStore {
    dir: PathBuf,
}

impl JsonCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, plugin: &str, device: &str) -> PathBuf {
        self.dir
            .join(sanitize(device))
            .join(format!("{}.json", sanitize(plugin)))
    }
}

/// Keep ids usable as single path components
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[async_trait]
impl CacheStore for JsonCacheStore {
    async fn load_all(&self, plugin: &str, device: &str) -> Result<Map<String, Value>> {
        let path = self.file_for(plugin, device);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Map<String, Value>>(&json) {
            Ok(values) => Ok(values),
            Err(e) => {
                warn!("Ignoring corrupt cache {:?}: {}", path, e);
                Ok(Map::new())
            }
        }
    }

    async fn save(&self, plugin: &str, device: &str, values: &Map<String, Value>) -> Result<()> {
        let path = self.file_for(plugin, device);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(values)?;
        tokio::fs::write(&path, json).await?;
        debug!("Saved {} cache for {} to {:?}", plugin, device, path);
        Ok(())
    }
}
