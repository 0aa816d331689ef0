//! What a plugin can reach: the device link, notifier and cache

use crate::notification::{Notification, Notifier};
use crate::payload::{Transfer, TransferConfig};
use crate::store::CacheStore;
use crate::transport::Channel;
use crate::{Packet, ProtocolError, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::debug;

/// Current channel and pairing state of a device, shared with its plugins
#[derive(Debug, Default)]
pub struct DeviceLink {
    channel: RwLock<Option<Arc<Channel>>>,
    paired: AtomicBool,
}

impl DeviceLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the channel, returning the previous one
    pub fn set_channel(&self, channel: Option<Arc<Channel>>) -> Option<Arc<Channel>> {
        let mut current = self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, channel)
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some_and(|channel| !channel.is_closed())
    }

    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    pub fn set_paired(&self, paired: bool) {
        self.paired.store(paired, Ordering::SeqCst);
    }

    /// Channel usable for plugin traffic
    pub fn ready_channel(&self) -> Result<Arc<Channel>> {
        if !self.is_paired() {
            return Err(ProtocolError::NotPaired);
        }
        self.channel()
            .filter(|channel| !channel.is_closed())
            .ok_or_else(|| ProtocolError::NetworkError("device not connected".to_string()))
    }
}

struct CacheState {
    loaded: bool,
    values: Map<String, Value>,
}

struct CacheInner {
    plugin_id: String,
    device_id: String,
    store: Arc<dyn CacheStore>,
    state: Mutex<CacheState>,
}

/// Persistent properties of one plugin on one device
///
/// The stored map is read from the [`CacheStore`] on first use and written
/// through on every [`PluginCache::set`].
#[derive(Clone)]
pub struct PluginCache {
    inner: Arc<CacheInner>,
}

impl PluginCache {
    pub fn new(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                plugin_id: plugin_id.into(),
                device_id: device_id.into(),
                store,
                state: Mutex::new(CacheState {
                    loaded: false,
                    values: Map::new(),
                }),
            }),
        }
    }

    /// Load the named properties, reading the store only the first time
    pub async fn load(&self, names: &[&str]) -> Result<Map<String, Value>> {
        let mut state = self.inner.state.lock().await;
        self.fill(&mut state).await?;

        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .values
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect())
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().await.values.get(name).cloned()
    }

    /// Set a property and persist the cache
    pub async fn set(&self, name: impl Into<String>, value: Value) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.fill(&mut state).await?;
        state.values.insert(name.into(), value);
        self.inner
            .store
            .save(&self.inner.plugin_id, &self.inner.device_id, &state.values)
            .await
    }

    /// Persist the current values
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.loaded && state.values.is_empty() {
            return Ok(());
        }
        self.fill(&mut state).await?;
        self.inner
            .store
            .save(&self.inner.plugin_id, &self.inner.device_id, &state.values)
            .await
    }

    /// Merge the whole stored map in, once
    ///
    /// Saving replaces the stored map, so every stored property has to be
    /// held before the first write.
    async fn fill(&self, state: &mut CacheState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }
        let stored = self
            .inner
            .store
            .load_all(&self.inner.plugin_id, &self.inner.device_id)
            .await?;
        for (name, value) in stored {
            // Values set before the load win over stale stored ones
            state.values.entry(name).or_insert(value);
        }
        state.loaded = true;
        debug!(
            "Loaded {} cache for {} ({} values)",
            self.inner.plugin_id,
            self.inner.device_id,
            state.values.len()
        );
        Ok(())
    }
}

/// Handle given to every plugin hook
#[derive(Clone)]
pub struct PluginContext {
    device_id: String,
    plugin_id: &'static str,
    link: Arc<DeviceLink>,
    notifier: Arc<dyn Notifier>,
    cache: PluginCache,
    transfer: TransferConfig,
}

impl PluginContext {
    pub fn new(
        device_id: impl Into<String>,
        plugin_id: &'static str,
        link: Arc<DeviceLink>,
        notifier: Arc<dyn Notifier>,
        cache: PluginCache,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            plugin_id,
            link,
            notifier,
            cache,
            transfer,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn plugin_id(&self) -> &'static str {
        self.plugin_id
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn is_paired(&self) -> bool {
        self.link.is_paired()
    }

    /// Send a packet to the device
    ///
    /// # Errors
    ///
    /// `NotPaired` if the device is not paired, `NetworkError` if it is not
    /// connected.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        let channel = self.link.ready_channel()?;
        channel.send_packet(&packet).await
    }

    /// Prepare an upload of `source` with `packet`; call `start()` to run it
    pub async fn upload<R>(&self, packet: Packet, source: R, size: Option<u64>) -> Result<Transfer>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let channel = self.link.ready_channel()?;
        Transfer::upload(channel, packet, source, size, &self.transfer).await
    }

    /// Prepare a download of the payload announced by `packet`
    pub fn download<W>(&self, packet: Packet, sink: W) -> Result<Transfer>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = self.link.ready_channel()?;
        Transfer::download(channel, packet, sink)
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn cache(&self) -> &PluginCache {
        &self.cache
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("device_id", &self.device_id)
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}
