//! SFTP Plugin
//!
//! Browse the remote device's filesystem over SFTP.
//!
//! ## Protocol
//!
//! **Packet Types**:
//! - `kdeconnect.sftp.request` (outgoing): `{ "startBrowsing": true }`
//! - `kdeconnect.sftp` (incoming): connection details, or an error
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.sftp",
//!     "body": {
//!         "ip": "192.168.1.10",
//!         "port": 1739,
//!         "user": "kdeconnect",
//!         "password": "generated_password",
//!         "path": "/",
//!         "multiPaths": ["/storage/emulated/0"],
//!         "pathNames": ["Internal Storage"]
//!     }
//! }
//! ```
//!
//! A response with `errorMessage` instead means the peer refused to share.
//!
//! Actually mounting the share (sshfs or similar) is left to the host; the
//! plugin keeps the last mount details and caches them under `mount`.

use crate::notification::Notification;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{
    ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginFactory,
    PluginMetadata,
};

pub const PACKET_TYPE_SFTP: &str = "kdeconnect.sftp";
pub const PACKET_TYPE_SFTP_REQUEST: &str = "kdeconnect.sftp.request";

const MOUNT_PROPERTY: &str = "mount";

pub static METADATA: PluginMetadata = PluginMetadata {
    id: "sftp",
    label: "SFTP",
    description: "Browse the paired device's filesystem",
    incoming: &[PACKET_TYPE_SFTP],
    outgoing: &[PACKET_TYPE_SFTP_REQUEST],
    actions: &[
        ActionSpec {
            name: "mount",
            label: "Mount",
            parameter: ParameterShape::None,
            incoming: &[PACKET_TYPE_SFTP],
            outgoing: &[PACKET_TYPE_SFTP_REQUEST],
        },
        ActionSpec {
            name: "unmount",
            label: "Unmount",
            parameter: ParameterShape::None,
            incoming: &[],
            outgoing: &[],
        },
    ],
};

/// SFTP connection details sent by the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub multi_paths: Vec<String>,
    #[serde(default)]
    pub path_names: Vec<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl MountInfo {
    /// `sftp://user@ip:port/path`
    pub fn uri(&self) -> String {
        format!("sftp://{}@{}:{}{}", self.user, self.ip, self.port, self.path)
    }

    /// Browsable directories paired with their display names
    pub fn directories(&self) -> Vec<(&str, &str)> {
        self.multi_paths
            .iter()
            .zip(self.path_names.iter())
            .map(|(path, name)| (path.as_str(), name.as_str()))
            .collect()
    }
}

pub fn create_mount_request() -> Packet {
    Packet::new(PACKET_TYPE_SFTP_REQUEST, json!({ "startBrowsing": true }))
}

#[derive(Debug, Default)]
pub struct SftpPlugin {
    mount: Option<MountInfo>,
}

impl SftpPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last mount details received from the peer
    pub fn mount_info(&self) -> Option<&MountInfo> {
        self.mount.as_ref()
    }

    async fn handle_response(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        if let Some(message) = packet.get_body_field::<String>("errorMessage") {
            warn!("SFTP error from {}: {}", ctx.device_id(), message);
            ctx.notify(Notification::PluginError {
                device_id: ctx.device_id().to_string(),
                plugin: METADATA.id.to_string(),
                message,
            });
            return Ok(());
        }

        let info: MountInfo = match serde_json::from_value(packet.body.clone()) {
            Ok(info) => info,
            Err(e) => {
                warn!("Ignoring malformed SFTP response from {}: {}", ctx.device_id(), e);
                return Ok(());
            }
        };

        info!("SFTP share available on {}: {}", ctx.device_id(), info.uri());
        ctx.cache()
            .set(MOUNT_PROPERTY, serde_json::to_value(&info)?)
            .await?;
        self.mount = Some(info);
        Ok(())
    }

    async fn unmount(&mut self, ctx: &PluginContext) -> Result<()> {
        if self.mount.take().is_some() {
            debug!("Forgetting SFTP share of {}", ctx.device_id());
            ctx.cache().set(MOUNT_PROPERTY, Value::Null).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for SftpPlugin {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    async fn connected(&mut self, ctx: &PluginContext) -> Result<()> {
        self.cache_properties(ctx, &[MOUNT_PROPERTY]).await?;
        Ok(())
    }

    async fn handle_packet(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        if packet.is_type(PACKET_TYPE_SFTP) {
            self.handle_response(ctx, packet).await?;
        }
        Ok(())
    }

    async fn activate(
        &mut self,
        ctx: &PluginContext,
        action: &str,
        _param: ActionParameter,
    ) -> Result<()> {
        match action {
            "unmount" => self.unmount(ctx).await,
            _ => ctx.send_packet(create_mount_request()).await,
        }
    }

    fn cache_loaded(&mut self, values: &Map<String, Value>) {
        if let Some(value) = values.get(MOUNT_PROPERTY) {
            self.mount = serde_json::from_value(value.clone()).ok();
        }
    }
}

pub struct SftpPluginFactory;

impl PluginFactory for SftpPluginFactory {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(SftpPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_body() -> Value {
        json!({
            "ip": "127.0.0.1",
            "port": 2039,
            "user": "kdeconnect",
            "password": "remote-password",
            "path": "/",
            "multiPaths": ["/remote-directory"],
            "pathNames": ["Remote"]
        })
    }

    #[test]
    fn test_parse_mount_info() {
        let info: MountInfo = serde_json::from_value(response_body()).unwrap();
        assert_eq!(info.port, 2039);
        assert_eq!(info.uri(), "sftp://kdeconnect@127.0.0.1:2039/");
        assert_eq!(info.directories(), vec![("/remote-directory", "Remote")]);
    }

    #[test]
    fn test_mount_request_body() {
        let packet = create_mount_request();
        assert_eq!(packet.get_body_field::<bool>("startBrowsing"), Some(true));
    }

    #[test]
    fn test_cache_restores_mount() {
        let mut plugin = SftpPlugin::new();
        let mut values = Map::new();
        values.insert(MOUNT_PROPERTY.to_string(), response_body());
        plugin.cache_loaded(&values);
        assert_eq!(plugin.mount_info().map(|m| m.user.as_str()), Some("kdeconnect"));

        values.insert(MOUNT_PROPERTY.to_string(), Value::Null);
        plugin.cache_loaded(&values);
        assert!(plugin.mount_info().is_none());
    }
}
