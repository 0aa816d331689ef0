//! Find My Phone Plugin
//!
//! Makes the remote device ring so it can be located.
//!
//! **Packet Type**: `kdeconnect.findmyphone.request`, with an empty body.
//!
//! Receiving a request starts ringing; receiving another one while ringing
//! stops it. The last ringing state is kept in the plugin cache.

use crate::notification::Notification;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{
    ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginFactory,
    PluginMetadata,
};

/// Packet type for find my phone requests
pub const PACKET_TYPE_FINDMYPHONE_REQUEST: &str = "kdeconnect.findmyphone.request";

const RINGING_PROPERTY: &str = "ringing";

pub static METADATA: PluginMetadata = PluginMetadata {
    id: "findmyphone",
    label: "Find My Phone",
    description: "Ring your paired device",
    incoming: &[PACKET_TYPE_FINDMYPHONE_REQUEST],
    outgoing: &[PACKET_TYPE_FINDMYPHONE_REQUEST],
    actions: &[ActionSpec {
        name: "ring",
        label: "Ring",
        parameter: ParameterShape::None,
        incoming: &[],
        outgoing: &[PACKET_TYPE_FINDMYPHONE_REQUEST],
    }],
};

/// Create a ring request packet
///
/// # Examples
///
/// ```rust
/// use lanconnect_protocol::plugins::findmyphone::create_ring_request;
///
/// let packet = create_ring_request();
/// assert_eq!(packet.packet_type, "kdeconnect.findmyphone.request");
/// ```
pub fn create_ring_request() -> Packet {
    Packet::new(PACKET_TYPE_FINDMYPHONE_REQUEST, json!({}))
}

#[derive(Debug, Default)]
pub struct FindMyPhonePlugin {
    ringing: bool,
}

impl FindMyPhonePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this device is currently ringing on the peer's request
    pub fn is_ringing(&self) -> bool {
        self.ringing
    }

    /// Ask the peer to ring (or stop ringing)
    pub async fn ring(&self, ctx: &PluginContext) -> Result<()> {
        debug!("Sending ring request to {}", ctx.device_id());
        ctx.send_packet(create_ring_request()).await
    }

    async fn handle_request(&mut self, ctx: &PluginContext) -> Result<()> {
        self.ringing = !self.ringing;
        info!(
            "{} ringing on request from {}",
            if self.ringing { "Started" } else { "Stopped" },
            ctx.device_id()
        );

        ctx.notify(Notification::Ringing {
            device_id: ctx.device_id().to_string(),
            ringing: self.ringing,
        });
        ctx.cache()
            .set(RINGING_PROPERTY, Value::Bool(self.ringing))
            .await
    }
}

#[async_trait]
impl Plugin for FindMyPhonePlugin {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    async fn connected(&mut self, ctx: &PluginContext) -> Result<()> {
        self.cache_properties(ctx, &[RINGING_PROPERTY]).await?;
        Ok(())
    }

    async fn disconnected(&mut self, ctx: &PluginContext) -> Result<()> {
        if self.ringing {
            self.ringing = false;
            ctx.notify(Notification::Ringing {
                device_id: ctx.device_id().to_string(),
                ringing: false,
            });
        }
        Ok(())
    }

    async fn handle_packet(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        if packet.is_type(PACKET_TYPE_FINDMYPHONE_REQUEST) {
            self.handle_request(ctx).await?;
        }
        Ok(())
    }

    async fn activate(
        &mut self,
        ctx: &PluginContext,
        _action: &str,
        _param: ActionParameter,
    ) -> Result<()> {
        self.ring(ctx).await
    }

    fn cache_loaded(&mut self, values: &Map<String, Value>) {
        if let Some(ringing) = values.get(RINGING_PROPERTY).and_then(Value::as_bool) {
            self.ringing = ringing;
        }
    }
}

pub struct FindMyPhonePluginFactory;

impl PluginFactory for FindMyPhonePluginFactory {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(FindMyPhonePlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::ChannelNotifier;
    use crate::payload::TransferConfig;
    use crate::plugins::{DeviceLink, PluginCache};
    use crate::store::MemoryCacheStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_requests_toggle_ringing() {
        let (notifier, mut notifications) = ChannelNotifier::new();
        let ctx = PluginContext::new(
            "phone",
            METADATA.id,
            Arc::new(DeviceLink::new()),
            Arc::new(notifier),
            PluginCache::new(METADATA.id, "phone", Arc::new(MemoryCacheStore::new())),
            TransferConfig::default(),
        );
        let mut plugin = FindMyPhonePlugin::new();

        plugin.handle_packet(&ctx, &create_ring_request()).await.unwrap();
        assert!(plugin.is_ringing());
        assert!(matches!(
            notifications.try_recv().unwrap(),
            Notification::Ringing { ringing: true, .. }
        ));

        plugin.handle_packet(&ctx, &create_ring_request()).await.unwrap();
        assert!(!plugin.is_ringing());
        assert_eq!(ctx.cache().get(RINGING_PROPERTY).await, Some(json!(false)));
    }

    #[test]
    fn test_cache_restores_ringing() {
        let mut plugin = FindMyPhonePlugin::new();
        let mut values = Map::new();
        values.insert(RINGING_PROPERTY.to_string(), json!(true));
        plugin.cache_loaded(&values);
        assert!(plugin.is_ringing());
    }
}
