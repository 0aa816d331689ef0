//! Device Events
//!
//! Emitted by a [`Device`](super::Device) whenever its observable state
//! changes. Subscribe with [`Device::subscribe`](super::Device::subscribe).

use crate::PairingStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A channel was attached or lost
    ConnectionChanged {
        connected: bool,
    },

    PairingChanged {
        status: PairingStatus,
    },

    /// The negotiated capability sets changed
    CapabilitiesChanged,

    /// An action's enabled bit flipped
    ActionChanged {
        action: String,
        enabled: bool,
    },

    /// A pending pairing request expired
    PairingTimedOut,

    PluginAdded(String),

    PluginRemoved(String),
}
