//! Photo Plugin
//!
//! Asks the remote device to take a photo and receives the result.
//!
//! ## Protocol
//!
//! **Packet Types**
//! - `kdeconnect.photo.request`: ask the peer for a photo (empty body)
//! - `kdeconnect.photo`: the photo, sent as a payload with a `filename`
//!
//! A `kdeconnect.photo` without a payload means the peer had nothing to send.
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.photo",
//!     "body": { "filename": "IMG_0001.jpg" },
//!     "payloadSize": 204800,
//!     "payloadTransferInfo": { "port": 1739 }
//! }
//! ```
//!
//! Received photos are written to `<data_dir>/<filename>`. The download goes
//! to a `.part` file first and is renamed once complete.

use crate::notification::Notification;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginFactory,
    PluginMetadata,
};

pub const PACKET_TYPE_PHOTO: &str = "kdeconnect.photo";
pub const PACKET_TYPE_PHOTO_REQUEST: &str = "kdeconnect.photo.request";

const DEFAULT_FILENAME: &str = "photo.jpg";

pub static METADATA: PluginMetadata = PluginMetadata {
    id: "photo",
    label: "Photo",
    description: "Take photos on the remote device",
    incoming: &[PACKET_TYPE_PHOTO, PACKET_TYPE_PHOTO_REQUEST],
    outgoing: &[PACKET_TYPE_PHOTO, PACKET_TYPE_PHOTO_REQUEST],
    actions: &[ActionSpec {
        name: "photo",
        label: "Take Photo",
        parameter: ParameterShape::None,
        incoming: &[PACKET_TYPE_PHOTO],
        outgoing: &[PACKET_TYPE_PHOTO_REQUEST],
    }],
};

/// Supplies photos when the peer asks for one
#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Path of a photo to send, or `None` if there is nothing to offer
    async fn capture(&self) -> Result<Option<PathBuf>>;
}

/// Source with no camera behind it
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPhotoSource;

#[async_trait]
impl PhotoSource for NoPhotoSource {
    async fn capture(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

pub fn create_photo_request() -> Packet {
    Packet::new(PACKET_TYPE_PHOTO_REQUEST, json!({}))
}

/// Reduce a peer-supplied filename to a single safe path component
fn sanitize_filename(name: Option<&str>) -> String {
    name.and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && !name.starts_with('.'))
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

pub struct PhotoPlugin {
    data_dir: PathBuf,
    source: Arc<dyn PhotoSource>,
}

impl PhotoPlugin {
    pub fn new(data_dir: impl Into<PathBuf>, source: Arc<dyn PhotoSource>) -> Self {
        Self {
            data_dir: data_dir.into(),
            source,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Where a photo named `filename` by the peer is stored
    pub fn target_path(&self, filename: Option<&str>) -> PathBuf {
        self.data_dir.join(sanitize_filename(filename))
    }

    fn receive_photo(&self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        if !packet.has_payload() {
            debug!("Photo packet from {} carries no payload", ctx.device_id());
            return Ok(());
        }

        let target = self.target_path(packet.get_body_field::<String>("filename").as_deref());
        let ctx = ctx.clone();
        let packet = packet.clone();

        tokio::spawn(async move {
            if let Err(e) = download_photo(&ctx, packet, &target).await {
                warn!("Failed to receive photo from {}: {}", ctx.device_id(), e);
                ctx.notify(Notification::TransferFailed {
                    device_id: ctx.device_id().to_string(),
                    message: e.user_message(),
                });
            }
        });
        Ok(())
    }

    async fn answer_request(&self, ctx: &PluginContext) -> Result<()> {
        match self.source.capture().await? {
            Some(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let size = file.metadata().await?.len();
                let filename = sanitize_filename(path.file_name().and_then(|n| n.to_str()));
                let packet = Packet::new(PACKET_TYPE_PHOTO, json!({ "filename": filename }));

                let transfer = ctx.upload(packet, file, Some(size)).await?;
                let device_id = ctx.device_id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = transfer.start().await {
                        warn!("Failed to send photo to {}: {}", device_id, e);
                    }
                });
                Ok(())
            }
            None => {
                debug!("No photo available for {}", ctx.device_id());
                ctx.send_packet(Packet::new(PACKET_TYPE_PHOTO, json!({})))
                    .await
            }
        }
    }
}

async fn download_photo(ctx: &PluginContext, packet: Packet, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = target.with_extension(match target.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.part", ext),
        None => "part".to_string(),
    });

    let file = tokio::fs::File::create(&partial).await?;
    let result = match ctx.download(packet, file) {
        Ok(transfer) => transfer.start().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(bytes) => {
            tokio::fs::rename(&partial, target).await?;
            info!("Received photo {} ({} bytes)", target.display(), bytes);
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

#[async_trait]
impl Plugin for PhotoPlugin {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    async fn handle_packet(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        match packet.packet_type.as_str() {
            PACKET_TYPE_PHOTO => self.receive_photo(ctx, packet),
            PACKET_TYPE_PHOTO_REQUEST => self.answer_request(ctx).await,
            other => Err(ProtocolError::InvalidPacket(format!(
                "photo plugin cannot handle '{}'",
                other
            ))),
        }
    }

    async fn activate(
        &mut self,
        ctx: &PluginContext,
        _action: &str,
        _param: ActionParameter,
    ) -> Result<()> {
        debug!("Requesting photo from {}", ctx.device_id());
        ctx.send_packet(create_photo_request()).await
    }
}

pub struct PhotoPluginFactory {
    data_dir: PathBuf,
    source: Arc<dyn PhotoSource>,
}

impl PhotoPluginFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_source(data_dir, Arc::new(NoPhotoSource))
    }

    pub fn with_source(data_dir: impl Into<PathBuf>, source: Arc<dyn PhotoSource>) -> Self {
        Self {
            data_dir: data_dir.into(),
            source,
        }
    }
}

impl PluginFactory for PhotoPluginFactory {
    fn metadata(&self) -> &'static PluginMetadata {
        &METADATA
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PhotoPlugin::new(self.data_dir.clone(), self.source.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(Some("IMG_0001.jpg")), "IMG_0001.jpg");
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("/tmp/shot.png")), "shot.png");
        assert_eq!(sanitize_filename(Some(".hidden")), DEFAULT_FILENAME);
        assert_eq!(sanitize_filename(Some("")), DEFAULT_FILENAME);
        assert_eq!(sanitize_filename(None), DEFAULT_FILENAME);
    }

    #[test]
    fn test_target_path_stays_in_data_dir() {
        let plugin = PhotoPlugin::new("/data/photos", Arc::new(NoPhotoSource));
        assert_eq!(
            plugin.target_path(Some("../escape.jpg")),
            PathBuf::from("/data/photos/escape.jpg")
        );
    }

    #[tokio::test]
    async fn test_default_source_has_nothing() {
        assert!(NoPhotoSource.capture().await.unwrap().is_none());
    }
}
