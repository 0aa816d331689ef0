//! Plugin Architecture
//!
//! Plugins implement features on top of a paired device. Each plugin declares
//! static metadata: the packet types it receives (`incoming`), the packet
//! types it sends (`outgoing`), and the user actions it exposes.
//!
//! ## Capability Negotiation
//!
//! A plugin is instantiated for a device only when at least one of its packet
//! types survives negotiation with the peer's identity. Each action is
//! enabled only while the device is connected and paired and the peer
//! supports every packet type the action needs.
//!
//! ## Packet Handling
//!
//! Packets are delivered at least once and in no guaranteed relation to
//! requests we sent, so handlers must tolerate repeats and unexpected
//! packets. Malformed packets should be logged, not returned as errors.
//!
//! ## Lifecycle
//!
//! ```text
//! created ──▶ connected ◀──▶ disconnected ──▶ destroyed
//! ```
//!
//! `connected` runs once the device is both connected and paired;
//! `disconnected` runs when either stops being true.
//!
//! ## Example Plugin
//!
//! ```rust
//! use async_trait::async_trait;
//! use lanconnect_protocol::plugins::{
//!     ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginMetadata,
//! };
//! use lanconnect_protocol::{Packet, Result};
//! use serde_json::json;
//!
//! static METADATA: PluginMetadata = PluginMetadata {
//!     id: "hello",
//!     label: "Hello",
//!     description: "Say hello",
//!     incoming: &["kdeconnect.hello"],
//!     outgoing: &["kdeconnect.hello"],
//!     actions: &[ActionSpec {
//!         name: "hello",
//!         label: "Say Hello",
//!         parameter: ParameterShape::None,
//!         incoming: &[],
//!         outgoing: &["kdeconnect.hello"],
//!     }],
//! };
//!
//! struct HelloPlugin;
//!
//! #[async_trait]
//! impl Plugin for HelloPlugin {
//!     fn metadata(&self) -> &'static PluginMetadata {
//!         &METADATA
//!     }
//!
//!     async fn handle_packet(&mut self, _ctx: &PluginContext, packet: &Packet) -> Result<()> {
//!         println!("hello from {:?}", packet.body);
//!         Ok(())
//!     }
//!
//!     async fn activate(
//!         &mut self,
//!         ctx: &PluginContext,
//!         _action: &str,
//!         _param: ActionParameter,
//!     ) -> Result<()> {
//!         ctx.send_packet(Packet::new("kdeconnect.hello", json!({}))).await
//!     }
//! }
//! ```

pub mod context;
pub mod findmyphone;
pub mod photo;
pub mod ping;
pub mod sftp;

pub use context::{DeviceLink, PluginCache, PluginContext};

use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Parameter passed to an action
pub type ActionParameter = Option<Value>;

/// Shape an action parameter must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterShape {
    /// No parameter
    None,
    Bool,
    String,
    /// A JSON object
    Dict,
}

impl ParameterShape {
    pub fn accepts(&self, param: &ActionParameter) -> bool {
        matches!(
            (self, param),
            (ParameterShape::None, None)
                | (ParameterShape::Bool, Some(Value::Bool(_)))
                | (ParameterShape::String, Some(Value::String(_)))
                | (ParameterShape::Dict, Some(Value::Object(_)))
        )
    }
}

/// A user-invocable action exposed by a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub parameter: ParameterShape,
    /// Packet types the peer must be able to send us
    pub incoming: &'static [&'static str],
    /// Packet types the peer must be able to receive
    pub outgoing: &'static [&'static str],
}

/// Static description of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginMetadata {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub incoming: &'static [&'static str],
    pub outgoing: &'static [&'static str],
    pub actions: &'static [ActionSpec],
}

impl PluginMetadata {
    pub fn action(&self, name: &str) -> Option<&'static ActionSpec> {
        self.actions.iter().find(|action| action.name == name)
    }
}

/// Per-device plugin instance
///
/// Every hook receives a [`PluginContext`] for sending packets, starting
/// transfers, notifying the user and reading the plugin cache. Hooks run on
/// the device's dispatch task; long work such as a payload transfer should
/// be spawned rather than awaited.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &'static PluginMetadata;

    /// The device became connected and paired
    async fn connected(&mut self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// The device stopped being connected or paired
    async fn disconnected(&mut self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// The plugin is being removed from the device
    async fn destroy(&mut self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Handle a packet whose type is in `metadata().incoming`
    async fn handle_packet(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()>;

    /// Run one of `metadata().actions`; the parameter shape is already checked
    async fn activate(
        &mut self,
        ctx: &PluginContext,
        action: &str,
        param: ActionParameter,
    ) -> Result<()>;

    /// Cached properties became available
    fn cache_loaded(&mut self, _values: &Map<String, Value>) {}

    /// Load cached properties once and hand them to [`Plugin::cache_loaded`]
    async fn cache_properties(
        &mut self,
        ctx: &PluginContext,
        names: &[&str],
    ) -> Result<Map<String, Value>> {
        let values = ctx.cache().load(names).await?;
        self.cache_loaded(&values);
        Ok(values)
    }
}

/// Creates plugin instances, one per device
pub trait PluginFactory: Send + Sync {
    fn metadata(&self) -> &'static PluginMetadata;

    fn create(&self) -> Box<dyn Plugin>;
}

/// Registered plugin factories
///
/// Each incoming packet type is owned by exactly one plugin, and action names
/// are unique across plugins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,
    /// incoming packet type -> plugin id
    capability_map: HashMap<&'static str, &'static str>,
    /// action name -> plugin id
    action_map: HashMap<&'static str, &'static str>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin
    ///
    /// Received photos are stored in `data_dir`.
    pub fn with_defaults(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = Self::new();
        registry.register_factory(Arc::new(ping::PingPluginFactory))?;
        registry.register_factory(Arc::new(findmyphone::FindMyPhonePluginFactory))?;
        registry.register_factory(Arc::new(photo::PhotoPluginFactory::new(data_dir)))?;
        registry.register_factory(Arc::new(sftp::SftpPluginFactory))?;
        Ok(registry)
    }

    /// Register a plugin factory
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Plugin` if the id is taken, an incoming packet
    /// type is already handled, or an action name is already used.
    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let metadata = factory.metadata();

        if self.factory(metadata.id).is_some() {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                metadata.id
            )));
        }
        for capability in metadata.incoming {
            if let Some(existing) = self.capability_map.get(capability) {
                return Err(ProtocolError::Plugin(format!(
                    "Capability '{}' already handled by plugin '{}'",
                    capability, existing
                )));
            }
        }
        for action in metadata.actions {
            if let Some(existing) = self.action_map.get(action.name) {
                return Err(ProtocolError::Plugin(format!(
                    "Action '{}' already provided by plugin '{}'",
                    action.name, existing
                )));
            }
        }

        for capability in metadata.incoming {
            self.capability_map.insert(*capability, metadata.id);
        }
        for action in metadata.actions {
            self.action_map.insert(action.name, metadata.id);
        }

        info!("Registered plugin factory: {}", metadata.id);
        self.factories.push(factory);
        Ok(())
    }

    /// Factories in registration order
    pub fn factories(&self) -> &[Arc<dyn PluginFactory>] {
        &self.factories
    }

    pub fn factory(&self, id: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.factories
            .iter()
            .find(|factory| factory.metadata().id == id)
    }

    /// Factory of the plugin that handles `packet_type`
    pub fn factory_for_type(&self, packet_type: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.capability_map
            .get(packet_type)
            .and_then(|id| self.factory(id))
    }

    /// Every packet type some plugin can receive, sorted
    pub fn incoming_types(&self) -> Vec<String> {
        self.collect_types(|metadata| metadata.incoming)
    }

    /// Every packet type some plugin can send, sorted
    pub fn outgoing_types(&self) -> Vec<String> {
        self.collect_types(|metadata| metadata.outgoing)
    }

    fn collect_types(&self, pick: impl Fn(&PluginMetadata) -> &'static [&'static str]) -> Vec<String> {
        self.factories
            .iter()
            .flat_map(|factory| pick(factory.metadata()).iter())
            .map(|packet_type| packet_type.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
