//! User-facing notifications
//!
//! The library never renders UI. Anything the user should see is handed to a
//! [`Notifier`], which the embedding application implements.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A peer asked to pair and awaits confirmation
    PairingRequest {
        device_id: String,
        device_name: String,
        fingerprint: String,
    },
    /// Our pairing request went unanswered
    PairingFailed {
        device_id: String,
        device_name: String,
        message: String,
    },
    /// A packet was dropped because the device is not paired
    PairingRequired {
        device_id: String,
        packet_type: String,
    },
    Ping {
        device_id: String,
        message: Option<String>,
    },
    /// The peer asked us to ring (or stop ringing)
    Ringing { device_id: String, ringing: bool },
    PluginError {
        device_id: String,
        plugin: String,
        message: String,
    },
    TransferFailed { device_id: String, message: String },
}

impl Notification {
    pub fn device_id(&self) -> &str {
        match self {
            Notification::PairingRequest { device_id, .. }
            | Notification::PairingFailed { device_id, .. }
            | Notification::PairingRequired { device_id, .. }
            | Notification::Ping { device_id, .. }
            | Notification::Ringing { device_id, .. }
            | Notification::PluginError { device_id, .. }
            | Notification::TransferFailed { device_id, .. } => device_id,
        }
    }
}

/// Sink for notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::PairingFailed { .. }
            | Notification::PluginError { .. }
            | Notification::TransferFailed { .. } => {
                warn!(device = notification.device_id(), "{:?}", notification)
            }
            _ => info!(device = notification.device_id(), "{:?}", notification),
        }
    }
}

/// Forwards notifications to an mpsc receiver
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(Notification::Ringing {
            device_id: "dev".to_string(),
            ringing: true,
        });

        let received = rx.try_recv().unwrap();
        assert_eq!(received.device_id(), "dev");
        assert!(matches!(received, Notification::Ringing { ringing: true, .. }));
    }

    #[test]
    fn test_notification_serialization() {
        let json = serde_json::to_value(Notification::Ping {
            device_id: "dev".to_string(),
            message: None,
        })
        .unwrap();
        assert_eq!(json["kind"], "ping");
    }
}
