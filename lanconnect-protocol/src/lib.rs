//! LAN device connectivity protocol
//!
//! This library implements the KDE Connect wire protocol over a local
//! network: UDP discovery, TLS channels with trust-on-first-pair, pairing,
//! payload transfers, and a plugin contract with capability negotiation.
//!
//! ## Layers
//!
//! - [`transport`]: the [`LanChannelService`] discovers peers and opens
//!   authenticated [`Channel`]s
//! - [`payload`]: [`Transfer`]s stream file contents over side connections
//! - [`device`]: a [`Device`] tracks connection and pairing state, routes
//!   packets to plugins and gates their actions
//! - [`plugins`]: the [`Plugin`](plugins::Plugin) trait and the built-in
//!   plugins
//! - [`store`] and [`notification`]: the seams to settings storage and UI

pub mod codec;
pub mod device;
pub mod discovery;
pub mod notification;
pub mod packet;
pub mod pairing;
pub mod payload;
pub mod plugins;
pub mod store;
pub mod transport;

mod error;
pub use device::{
    ConnectionState, Device, DeviceEvent, DeviceOptions, LocalContext, NegotiatedCapabilities,
};
pub use discovery::{DeviceInfo, DeviceType};
pub use error::{ProtocolError, Result};
pub use notification::{Notification, Notifier};
pub use packet::{current_timestamp, Packet};
pub use pairing::{CertificateInfo, PairingPacket, PairingStatus};
pub use payload::{Transfer, TransferConfig, TransferDirection};
pub use plugins::PluginRegistry;
pub use store::{CacheStore, TrustStore};
pub use transport::{Channel, ChannelService, LanChannelService, ServiceConfig, ServiceEvent};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 8);
        assert_eq!(
            PROTOCOL_VERSION,
            transport::tls::IDENTITY_OVER_TLS_VERSION
        );
    }
}
