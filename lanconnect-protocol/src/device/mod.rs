//! Device State Management
//!
//! A [`Device`] is a known peer. It owns two independent state axes and the
//! plugins loaded for the peer:
//!
//! - **Connection**: `Disconnected` or `Connected`, driven by attaching and
//!   losing a [`Channel`]
//! - **Pairing**: `Unpaired`, `Requested`, `RequestedByPeer` or `Paired`,
//!   driven by `kdeconnect.pair` packets and local requests
//!
//! ## Plugins and Actions
//!
//! Plugins are created when they share at least one packet type with the
//! negotiated capabilities, and destroyed when they no longer do. Their
//! `connected` hook runs once the device is both connected and paired, and
//! `disconnected` runs when either stops being true.
//!
//! Every action of a loaded plugin is enabled iff the device is connected,
//! paired, and the peer supports the packet types the action needs. Each
//! flip is reported as a [`DeviceEvent::ActionChanged`].
//!
//! ## Dispatch
//!
//! Packets from the channel are dispatched in order by a single read loop:
//! pairing packets to the pairing axis, identity and capability updates to
//! negotiation, and everything else to the plugin that owns the type. Plugin
//! packets from an unpaired device are dropped.
//!
//! ## Locking
//!
//! Device state sits behind a mutex that is never held across a plugin hook.
//! State transitions are serialized by a second lock so hooks observe them in
//! order.

pub mod actions;
pub mod capabilities;
pub mod events;

pub use actions::{action_enabled, ActionState};
pub use capabilities::NegotiatedCapabilities;
pub use events::DeviceEvent;

use crate::notification::{LogNotifier, Notification, Notifier};
use crate::packet::{PACKET_TYPE_CAPABILITIES, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::pairing::{PairingMachine, PairingOutcome, TimerAction, PAIRING_TIMEOUT};
use crate::payload::TransferConfig;
use crate::plugins::{
    ActionParameter, DeviceLink, Plugin, PluginCache, PluginContext, PluginFactory,
    PluginRegistry,
};
use crate::store::{CacheStore, MemoryCacheStore, MemoryTrustStore, TrustStore};
use crate::transport::Channel;
use crate::{DeviceInfo, DeviceType, Packet, PairingStatus, ProtocolError, Result};
use actions::ActionTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Everything a device needs from the local side
#[derive(Clone)]
pub struct LocalContext {
    /// Our identity; its capabilities are those of the registry
    pub identity: DeviceInfo,
    pub registry: Arc<PluginRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub trust: Arc<dyn TrustStore>,
    pub cache_store: Arc<dyn CacheStore>,
    pub transfer: TransferConfig,
}

impl LocalContext {
    /// Context with in-memory stores and a logging notifier
    ///
    /// The identity's capabilities are replaced by the packet types the
    /// registry's plugins handle.
    pub fn new(identity: DeviceInfo, registry: PluginRegistry) -> Self {
        let identity = identity
            .with_incoming_capabilities(registry.incoming_types())
            .with_outgoing_capabilities(registry.outgoing_types());
        Self {
            identity,
            registry: Arc::new(registry),
            notifier: Arc::new(LogNotifier),
            trust: Arc::new(MemoryTrustStore::new()),
            cache_store: Arc::new(MemoryCacheStore::new()),
            transfer: TransferConfig::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_trust_store(mut self, trust: Arc<dyn TrustStore>) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_cache_store(mut self, cache_store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = cache_store;
        self
    }

    pub fn with_transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }
}

impl fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalContext")
            .field("device_id", &self.identity.device_id)
            .field("plugins", &self.registry.len())
            .field("transfer", &self.transfer)
            .finish()
    }
}

/// Per-device tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    pub pairing_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            pairing_timeout: PAIRING_TIMEOUT,
        }
    }
}

type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

struct PluginSlot {
    plugin: SharedPlugin,
    ctx: PluginContext,
    /// `connected` has run without a matching `disconnected`
    live: bool,
}

impl PluginSlot {
    fn handle(&self) -> (SharedPlugin, PluginContext) {
        (self.plugin.clone(), self.ctx.clone())
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Connected,
    Disconnected,
    Destroy,
}

impl Hook {
    fn verb(&self) -> &'static str {
        match self {
            Hook::Connected => "connect",
            Hook::Disconnected => "disconnect",
            Hook::Destroy => "destroy",
        }
    }
}

struct DeviceState {
    identity: DeviceInfo,
    connection: ConnectionState,
    pairing: PairingMachine,
    /// Fingerprint of the last certificate the peer authenticated with
    fingerprint: Option<String>,
    negotiated: NegotiatedCapabilities,
    plugins: BTreeMap<&'static str, PluginSlot>,
    actions: ActionTable,
    destroyed: bool,
}

struct DeviceInner {
    id: String,
    local: LocalContext,
    options: DeviceOptions,
    link: Arc<DeviceLink>,
    state: Mutex<DeviceState>,
    transitions: Mutex<()>,
    events: broadcast::Sender<DeviceEvent>,
}

/// Handle to a known peer
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a disconnected, unpaired device for `identity`
    ///
    /// Plugins supported by the identity's capabilities are created
    /// immediately.
    pub fn new(identity: DeviceInfo, local: LocalContext, options: DeviceOptions) -> Self {
        let id = identity.device_id.clone();
        let link = Arc::new(DeviceLink::new());
        let negotiated = NegotiatedCapabilities::negotiate(&local.identity, &identity);

        let mut state = DeviceState {
            identity,
            connection: ConnectionState::Disconnected,
            pairing: PairingMachine::new(),
            fingerprint: None,
            negotiated,
            plugins: BTreeMap::new(),
            actions: ActionTable::default(),
            destroyed: false,
        };
        // Nobody is subscribed yet, so the events are dropped
        let _ = reconcile_plugins(&id, &local, &link, &mut state);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        debug!(
            "Created device {} with plugins {:?}",
            id,
            state.plugins.keys().collect::<Vec<_>>()
        );

        Self {
            inner: Arc::new(DeviceInner {
                id,
                local,
                options,
                link,
                state: Mutex::new(state),
                transitions: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub async fn name(&self) -> String {
        self.inner.state.lock().await.identity.device_name.clone()
    }

    pub async fn device_type(&self) -> DeviceType {
        self.inner.state.lock().await.identity.device_type
    }

    /// Latest identity announced by the peer
    pub async fn identity(&self) -> DeviceInfo {
        self.inner.state.lock().await.identity.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    pub fn is_paired(&self) -> bool {
        self.inner.link.is_paired()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().await.connection
    }

    pub async fn pairing_status(&self) -> PairingStatus {
        self.inner.state.lock().await.pairing.status()
    }

    /// Certificate fingerprint of the last channel, if any
    pub async fn fingerprint(&self) -> Option<String> {
        self.inner.state.lock().await.fingerprint.clone()
    }

    pub async fn negotiated(&self) -> NegotiatedCapabilities {
        self.inner.state.lock().await.negotiated.clone()
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.link.channel()
    }

    pub async fn has_plugin(&self, id: &str) -> bool {
        self.inner.state.lock().await.plugins.contains_key(id)
    }

    /// Ids of the loaded plugins, sorted
    pub async fn plugins(&self) -> Vec<&'static str> {
        self.inner.state.lock().await.plugins.keys().copied().collect()
    }

    pub async fn has_action(&self, name: &str) -> bool {
        self.inner.state.lock().await.actions.get(name).is_some()
    }

    pub async fn is_action_enabled(&self, name: &str) -> bool {
        self.inner.state.lock().await.actions.is_enabled(name)
    }

    /// Every registered action with its enabled bit, sorted by name
    pub async fn actions(&self) -> Vec<ActionState> {
        self.inner.state.lock().await.actions.states()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Send a plugin packet to the peer
    ///
    /// # Errors
    ///
    /// `NotPaired` if the device is not paired, `NetworkError` if it is not
    /// connected.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        let channel = self.inner.link.ready_channel()?;
        channel.send_packet(&packet).await
    }

    // ---- connection axis ----

    /// Attach a freshly opened channel
    ///
    /// Any previous channel is closed. The identity and negotiated
    /// capabilities are taken from the channel, and the pairing state follows
    /// the channel's trust flag.
    pub async fn attach_channel(&self, channel: Arc<Channel>) -> Result<()> {
        if channel.device_id() != self.inner.id {
            return Err(ProtocolError::InvalidState(format!(
                "channel belongs to {}, not {}",
                channel.device_id(),
                self.inner.id
            )));
        }

        let _transition = self.inner.transitions.lock().await;
        let (was_connected, caps_changed, restored) = {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                drop(state);
                channel.close().await;
                return Err(ProtocolError::InvalidState(format!(
                    "device {} was destroyed",
                    self.inner.id
                )));
            }

            state.identity = channel.identity().clone();
            state.fingerprint = Some(channel.fingerprint().to_string());
            let negotiated =
                NegotiatedCapabilities::negotiate(&self.inner.local.identity, &state.identity);
            let caps_changed = negotiated != state.negotiated;
            state.negotiated = negotiated;

            let was_connected = state.connection == ConnectionState::Connected;
            state.connection = ConnectionState::Connected;
            let restored = state.pairing.restore(channel.is_trusted());
            (was_connected, caps_changed, restored)
        };

        let previous = self.inner.link.set_channel(Some(channel.clone()));
        if let Some(previous) = previous.filter(|previous| !Arc::ptr_eq(previous, &channel)) {
            debug!("Replacing channel to {}", self.inner.id);
            previous.close().await;
        }

        if !was_connected {
            info!("Device {} connected via {}", self.inner.id, channel.address());
            self.emit(DeviceEvent::ConnectionChanged { connected: true });
        }
        if caps_changed {
            self.emit(DeviceEvent::CapabilitiesChanged);
        }

        match restored {
            Some(outcome) => self.apply_pairing(outcome).await?,
            None => self.settle().await,
        }

        self.spawn_read_loop(channel);
        Ok(())
    }

    /// Drop the current channel and go `Disconnected`
    ///
    /// The device itself stays known.
    pub async fn detach_channel(&self) {
        let _transition = self.inner.transitions.lock().await;
        self.detach_locked().await;
    }

    async fn channel_lost(&self, channel: &Arc<Channel>) {
        let _transition = self.inner.transitions.lock().await;
        let current = self.inner.link.channel();
        if current.is_some_and(|current| Arc::ptr_eq(&current, channel)) {
            self.detach_locked().await;
        }
    }

    async fn detach_locked(&self) {
        let channel = self.inner.link.set_channel(None);
        let (was_connected, cancelled) = {
            let mut state = self.inner.state.lock().await;
            let was_connected = state.connection == ConnectionState::Connected;
            state.connection = ConnectionState::Disconnected;
            (was_connected, state.pairing.cancel_pending())
        };

        if let Some(channel) = channel {
            channel.close().await;
        }
        if was_connected {
            info!("Device {} disconnected", self.inner.id);
            self.emit(DeviceEvent::ConnectionChanged { connected: false });
        }

        match cancelled {
            Some(outcome) => {
                if let Err(e) = self.apply_pairing(outcome).await {
                    debug!("Cancelling pairing with {}: {}", self.inner.id, e);
                }
            }
            None => self.settle().await,
        }
    }

    fn spawn_read_loop(&self, channel: Arc<Channel>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match channel.read_packet().await {
                    Ok(packet) => {
                        let Some(inner) = weak.upgrade() else { break };
                        Device { inner }.handle_packet(packet).await;
                    }
                    Err(ProtocolError::Json(e)) => {
                        warn!("Skipping undecodable packet from {}: {}", channel.device_id(), e)
                    }
                    Err(ProtocolError::InvalidPacket(msg)) => {
                        warn!("Skipping invalid packet from {}: {}", channel.device_id(), msg)
                    }
                    Err(e) => {
                        debug!("Read loop for {} ended: {}", channel.device_id(), e);
                        break;
                    }
                }
            }

            match weak.upgrade() {
                Some(inner) => Device { inner }.channel_lost(&channel).await,
                None => channel.close().await,
            }
        });
    }

    // ---- pairing axis ----

    /// Ask the peer to pair
    ///
    /// Accepts the peer's request if one is pending.
    pub async fn request_pairing(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        if !self.inner.link.is_connected() {
            return Err(not_connected());
        }
        let outcome = self.inner.state.lock().await.pairing.request()?;
        self.apply_pairing(outcome).await
    }

    /// Accept the peer's pending request
    pub async fn accept_pairing(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        let outcome = self.inner.state.lock().await.pairing.accept()?;
        self.apply_pairing(outcome).await
    }

    /// Reject the peer's pending request
    pub async fn reject_pairing(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        let outcome = self.inner.state.lock().await.pairing.reject()?;
        self.apply_pairing(outcome).await
    }

    /// Drop the pairing and forget the peer's certificate
    ///
    /// The peer is told if it is connected.
    pub async fn unpair(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        let outcome = self.inner.state.lock().await.pairing.unpair();
        self.apply_pairing(outcome).await
    }

    /// Carry out the side effects of a pairing transition
    ///
    /// Must be called with the transition lock held.
    async fn apply_pairing(&self, outcome: PairingOutcome) -> Result<()> {
        let (fingerprint, device_name) = {
            let state = self.inner.state.lock().await;
            (state.fingerprint.clone(), state.identity.device_name.clone())
        };
        let channel = self.inner.link.channel();
        self.inner
            .link
            .set_paired(outcome.status == PairingStatus::Paired);

        if outcome.became_paired() || outcome.lost_pairing() {
            let trusted = outcome.became_paired();
            if let Some(fingerprint) = &fingerprint {
                if let Err(e) = self.inner.local.trust.set_trusted(fingerprint, trusted).await {
                    warn!("Failed to update trust for {}: {}", self.inner.id, e);
                }
            }
            if let Some(channel) = &channel {
                channel.set_trusted(trusted);
            }
            info!(
                "Device {} {}",
                self.inner.id,
                if trusted { "paired" } else { "unpaired" }
            );
        }

        if outcome.timer == TimerAction::Arm {
            self.arm_pairing_timer(outcome.generation);
        }

        if outcome.status == PairingStatus::RequestedByPeer
            && outcome.previous != PairingStatus::RequestedByPeer
        {
            self.inner.local.notifier.notify(Notification::PairingRequest {
                device_id: self.inner.id.clone(),
                device_name,
                fingerprint: fingerprint.unwrap_or_default(),
            });
        }

        if outcome.changed() {
            self.emit(DeviceEvent::PairingChanged {
                status: outcome.status,
            });
        }

        let sent = match (outcome.reply, channel) {
            (Some(reply), Some(channel)) => channel.send_packet(&reply).await,
            (Some(_), None) => {
                debug!("Not telling disconnected {} about pairing change", self.inner.id);
                Ok(())
            }
            (None, _) => Ok(()),
        };

        self.settle().await;
        sent
    }

    fn arm_pairing_timer(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.options.pairing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Device { inner }.expire_pairing(generation).await;
            }
        });
    }

    async fn expire_pairing(&self, generation: u64) {
        let _transition = self.inner.transitions.lock().await;
        let outcome = self.inner.state.lock().await.pairing.expire(generation);
        if let Some(outcome) = outcome {
            let device_name = self.name().await;
            let error = ProtocolError::PairingTimeout(format!(
                "{} did not answer within {:?}",
                device_name, self.inner.options.pairing_timeout
            ));
            warn!("Pairing with {}: {}", self.inner.id, error);
            if let Err(e) = self.apply_pairing(outcome).await {
                debug!("Expiring pairing with {}: {}", self.inner.id, e);
            }
            self.inner.local.notifier.notify(Notification::PairingFailed {
                device_id: self.inner.id.clone(),
                device_name,
                message: error.user_message(),
            });
            self.emit(DeviceEvent::PairingTimedOut);
        }
    }

    // ---- dispatch ----

    /// Route a packet received from the peer
    pub async fn handle_packet(&self, packet: Packet) {
        match packet.packet_type.as_str() {
            PACKET_TYPE_PAIR => self.handle_pair_packet(&packet).await,
            PACKET_TYPE_IDENTITY | PACKET_TYPE_CAPABILITIES => {
                self.handle_capability_update(&packet).await
            }
            _ => self.dispatch_to_plugin(packet).await,
        }
    }

    async fn handle_pair_packet(&self, packet: &Packet) {
        let _transition = self.inner.transitions.lock().await;
        let outcome = self.inner.state.lock().await.pairing.handle_packet(packet);
        match outcome {
            Ok(outcome) => {
                if let Err(e) = self.apply_pairing(outcome).await {
                    warn!("Failed to answer pairing packet from {}: {}", self.inner.id, e);
                }
            }
            Err(e) => warn!("Ignoring pairing packet from {}: {}", self.inner.id, e),
        }
    }

    async fn handle_capability_update(&self, packet: &Packet) {
        if !self.is_connected() {
            debug!(
                "Ignoring '{}' from disconnected {}",
                packet.packet_type, self.inner.id
            );
            return;
        }

        let _transition = self.inner.transitions.lock().await;
        let changed = {
            let mut state = self.inner.state.lock().await;
            if packet.is_type(PACKET_TYPE_IDENTITY) {
                match DeviceInfo::from_identity_packet(packet) {
                    Ok(identity) if identity.device_id == self.inner.id => state.identity = identity,
                    Ok(identity) => {
                        warn!(
                            "Ignoring identity of {} received from {}",
                            identity.device_id, self.inner.id
                        );
                        return;
                    }
                    Err(e) => {
                        warn!("Ignoring invalid identity from {}: {}", self.inner.id, e);
                        return;
                    }
                }
            } else {
                if let Some(incoming) = packet.get_body_field::<Vec<String>>("incomingCapabilities") {
                    state.identity.incoming_capabilities = incoming;
                }
                if let Some(outgoing) = packet.get_body_field::<Vec<String>>("outgoingCapabilities") {
                    state.identity.outgoing_capabilities = outgoing;
                }
            }

            let negotiated =
                NegotiatedCapabilities::negotiate(&self.inner.local.identity, &state.identity);
            let changed = negotiated != state.negotiated;
            state.negotiated = negotiated;
            changed
        };

        if changed {
            info!("Capabilities of {} changed", self.inner.id);
            self.emit(DeviceEvent::CapabilitiesChanged);
        }
        self.settle().await;
    }

    async fn dispatch_to_plugin(&self, packet: Packet) {
        if !self.inner.link.is_paired() {
            debug!(
                "Dropping '{}' from unpaired device {}",
                packet.packet_type, self.inner.id
            );
            self.inner.local.notifier.notify(Notification::PairingRequired {
                device_id: self.inner.id.clone(),
                packet_type: packet.packet_type.clone(),
            });
            return;
        }

        let handle = {
            let state = self.inner.state.lock().await;
            self.inner
                .local
                .registry
                .factory_for_type(&packet.packet_type)
                .and_then(|factory| state.plugins.get(factory.metadata().id))
                .map(PluginSlot::handle)
        };
        let Some((plugin, ctx)) = handle else {
            debug!(
                "No plugin handles '{}' from {}, dropping",
                packet.packet_type, self.inner.id
            );
            return;
        };

        let mut plugin = plugin.lock().await;
        // Pairing may have been dropped while the plugin was busy
        if !self.inner.link.is_paired() {
            debug!(
                "Dropping '{}' from {}, unpaired while queued",
                packet.packet_type, self.inner.id
            );
            return;
        }
        let result = plugin.handle_packet(&ctx, &packet).await;
        if let Err(e) = result {
            self.plugin_failed(&ctx, "handle packet", e);
        }
    }

    // ---- actions ----

    /// Run an action of a loaded plugin
    ///
    /// # Errors
    ///
    /// `UnsupportedAction` if the action is unknown, currently disabled, or
    /// `param` does not have the shape the action expects. Nothing is sent
    /// in that case.
    pub async fn activate_action(&self, name: &str, param: ActionParameter) -> Result<()> {
        let (plugin, ctx) = {
            let state = self.inner.state.lock().await;
            let action = self.enabled_action(&state, name)?;
            if !action.spec.parameter.accepts(&param) {
                return Err(ProtocolError::UnsupportedAction(format!(
                    "action '{}' expects a {:?} parameter",
                    name, action.spec.parameter
                )));
            }

            state
                .plugins
                .get(action.plugin)
                .map(PluginSlot::handle)
                .ok_or_else(|| {
                    ProtocolError::UnsupportedAction(format!("action '{}' has no plugin", name))
                })?
        };

        let mut plugin = plugin.lock().await;
        // The gate may have closed while waiting for the plugin
        self.enabled_action(&*self.inner.state.lock().await, name)?;

        debug!("Activating '{}' on {}", name, self.inner.id);
        plugin.activate(&ctx, name, param).await
    }

    fn enabled_action(&self, state: &DeviceState, name: &str) -> Result<ActionState> {
        let action = state.actions.get(name).copied().ok_or_else(|| {
            ProtocolError::UnsupportedAction(format!("unknown action '{}'", name))
        })?;

        let connected =
            state.connection == ConnectionState::Connected && self.inner.link.is_connected();
        if !action_enabled(connected, state.pairing.is_paired(), &state.negotiated, action.spec) {
            return Err(ProtocolError::UnsupportedAction(format!(
                "action '{}' is disabled",
                name
            )));
        }
        Ok(action)
    }

    /// Tear the device down: close the channel and destroy every plugin
    ///
    /// Further attach attempts fail. Idempotent.
    pub async fn destroy(&self) {
        let _transition = self.inner.transitions.lock().await;
        let (slots, disabled, was_connected) = {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let was_connected = state.connection == ConnectionState::Connected;
            state.connection = ConnectionState::Disconnected;
            state.pairing.cancel_pending();

            let slots = std::mem::take(&mut state.plugins);
            let mut disabled = Vec::new();
            for id in slots.keys() {
                disabled.extend(state.actions.unregister(id));
            }
            (slots, disabled, was_connected)
        };

        if let Some(channel) = self.inner.link.set_channel(None) {
            channel.close().await;
        }
        if was_connected {
            self.emit(DeviceEvent::ConnectionChanged { connected: false });
        }
        for action in disabled {
            self.emit(DeviceEvent::ActionChanged {
                action: action.to_string(),
                enabled: false,
            });
        }

        for (id, slot) in slots {
            if slot.live {
                self.run_hook(Hook::Disconnected, &slot.plugin, &slot.ctx).await;
            }
            self.run_hook(Hook::Destroy, &slot.plugin, &slot.ctx).await;
            self.emit(DeviceEvent::PluginRemoved(id.to_string()));
        }
        info!("Destroyed device {}", self.inner.id);
    }

    // ---- internals ----

    /// Bring plugins, hooks and actions in line with the current state
    async fn settle(&self) {
        let mut jobs = Vec::new();
        let mut events = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            if !state.destroyed {
                let (reconciled, removed) =
                    reconcile_plugins(&self.inner.id, &self.inner.local, &self.inner.link, state);
                events.extend(reconciled);
                for (_, slot) in removed {
                    if slot.live {
                        jobs.push((Hook::Disconnected, slot.handle()));
                    }
                    jobs.push((Hook::Destroy, slot.handle()));
                }
            }

            let connected = state.connection == ConnectionState::Connected;
            let paired = state.pairing.is_paired();
            let ready = connected && paired;
            for slot in state.plugins.values_mut() {
                if ready && !slot.live {
                    slot.live = true;
                    jobs.push((Hook::Connected, slot.handle()));
                } else if !ready && slot.live {
                    slot.live = false;
                    jobs.push((Hook::Disconnected, slot.handle()));
                }
            }

            for (action, enabled) in state.actions.recompute(connected, paired, &state.negotiated) {
                events.push(DeviceEvent::ActionChanged {
                    action: action.to_string(),
                    enabled,
                });
            }
        }

        for event in events {
            self.emit(event);
        }
        for (hook, (plugin, ctx)) in jobs {
            self.run_hook(hook, &plugin, &ctx).await;
        }
    }

    async fn run_hook(&self, hook: Hook, plugin: &SharedPlugin, ctx: &PluginContext) {
        let mut plugin = plugin.lock().await;
        let result = match hook {
            Hook::Connected => plugin.connected(ctx).await,
            Hook::Disconnected => plugin.disconnected(ctx).await,
            Hook::Destroy => match plugin.destroy(ctx).await {
                Ok(()) => ctx.cache().flush().await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            self.plugin_failed(ctx, hook.verb(), e);
        }
    }

    fn plugin_failed(&self, ctx: &PluginContext, what: &str, error: ProtocolError) {
        warn!(
            "Plugin {} failed to {} for {}: {}",
            ctx.plugin_id(),
            what,
            self.inner.id,
            error
        );
        self.inner.local.notifier.notify(Notification::PluginError {
            device_id: self.inner.id.clone(),
            plugin: ctx.plugin_id().to_string(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .field("paired", &self.is_paired())
            .finish()
    }
}

fn not_connected() -> ProtocolError {
    ProtocolError::NetworkError("device not connected".to_string())
}

fn create_plugin(
    device_id: &str,
    local: &LocalContext,
    link: &Arc<DeviceLink>,
    factory: &Arc<dyn PluginFactory>,
) -> PluginSlot {
    let plugin_id = factory.metadata().id;
    let cache = PluginCache::new(plugin_id, device_id, local.cache_store.clone());
    let ctx = PluginContext::new(
        device_id,
        plugin_id,
        link.clone(),
        local.notifier.clone(),
        cache,
        local.transfer,
    );
    PluginSlot {
        plugin: Arc::new(Mutex::new(factory.create())),
        ctx,
        live: false,
    }
}

/// Create newly supported plugins and remove unsupported ones
///
/// Returns the events to emit and the removed plugins, which still need
/// their teardown hooks.
fn reconcile_plugins(
    device_id: &str,
    local: &LocalContext,
    link: &Arc<DeviceLink>,
    state: &mut DeviceState,
) -> (Vec<DeviceEvent>, Vec<(&'static str, PluginSlot)>) {
    let mut events = Vec::new();
    let mut removed = Vec::new();

    for factory in local.registry.factories() {
        let metadata = factory.metadata();
        let supported = state.negotiated.check(metadata);
        let present = state.plugins.contains_key(metadata.id);

        match (supported, present) {
            (Ok(()), false) => {
                debug!("Loading plugin {} for {}", metadata.id, device_id);
                state
                    .plugins
                    .insert(metadata.id, create_plugin(device_id, local, link, factory));
                state.actions.register(metadata.id, metadata.actions);
                events.push(DeviceEvent::PluginAdded(metadata.id.to_string()));
            }
            (Err(e), true) => {
                debug!("Unloading plugin {} for {}: {}", metadata.id, device_id, e);
                if let Some(slot) = state.plugins.remove(metadata.id) {
                    for action in state.actions.unregister(metadata.id) {
                        events.push(DeviceEvent::ActionChanged {
                            action: action.to_string(),
                            enabled: false,
                        });
                    }
                    events.push(DeviceEvent::PluginRemoved(metadata.id.to_string()));
                    removed.push((metadata.id, slot));
                }
            }
            (Err(e), false) => debug!("Skipping plugin {} for {}: {}", metadata.id, device_id, e),
            (Ok(()), true) => {}
        }
    }

    (events, removed)
}
