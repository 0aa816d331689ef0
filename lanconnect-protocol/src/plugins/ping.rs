//! Ping Plugin
//!
//! Connectivity test between two devices.
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "Optional message"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. A received ping is shown to the user.

use crate::notification::Notification;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{
    ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginFactory,
    PluginMetadata,
};

pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

pub static METADATA: PluginMetadata = PluginMetadata {
    id: "ping",
    label: "Ping",
    description: "Send and receive pings",
    incoming: &[PACKET_TYPE_PING],
    outgoing: &[PACKET_TYPE_PING],
    actions: &[ActionSpec {
        name: "ping",
        label: "Ping",
        // An empty string sends a ping without a message
        parameter: ParameterShape::String,
        incoming: &[],
        outgoing: &[PACKET_TYPE_PING],
    }],
};

/// Build a ping packet
pub fn create_ping(message: Option<&str>) -> Packet {
    let body = match message {
        Some(message) if !message.is_empty() => json!({ "message": message }),
        _ => json!({}),
    };
    Packet::new(PACKET_TYPE_PING, body)
}

#[derive(Debug, Default)]
pub struct PingPlugin {
    pings_received: u64,
    pings_sent: u64,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pings_received(&self) -> u64 {
        self.pings_received
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Send a ping, optionally carrying a message
    pub async fn ping(&mut self, ctx: &PluginContext, message: Option<&str>) -> Result<()> {
        ctx.send_packet(create_ping(message)).await?;
        self.pings_sent += 1;
        debug!("Sent ping to {}", ctx.device_id());
        Ok(())
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    async fn handle_packet(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        if !packet.is_type(PACKET_TYPE_PING) {
            return Ok(());
        }

        self.pings_received += 1;
        let message = packet.get_body_field::<String>("message");
        info!(
            "Received ping from {}{}",
            ctx.device_id(),
            message
                .as_deref()
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        );

        ctx.notify(Notification::Ping {
            device_id: ctx.device_id().to_string(),
            message,
        });
        Ok(())
    }

    async fn activate(
        &mut self,
        ctx: &PluginContext,
        _action: &str,
        param: ActionParameter,
    ) -> Result<()> {
        let message = param.as_ref().and_then(|value| value.as_str());
        self.ping(ctx, message).await
    }
}

pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::new())
    }
}
