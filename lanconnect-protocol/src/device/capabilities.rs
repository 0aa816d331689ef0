//! Capability negotiation between the local device and a peer

use crate::plugins::{ActionSpec, PluginMetadata};
use crate::{DeviceInfo, ProtocolError, Result};
use std::collections::BTreeSet;

/// Packet types both sides agree on
///
/// `incoming` holds what we can receive and the peer can send; `outgoing`
/// holds what we can send and the peer can receive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    pub incoming: BTreeSet<String>,
    pub outgoing: BTreeSet<String>,
}

impl NegotiatedCapabilities {
    pub fn negotiate(local: &DeviceInfo, peer: &DeviceInfo) -> Self {
        Self {
            incoming: intersect(&local.incoming_capabilities, &peer.outgoing_capabilities),
            outgoing: intersect(&local.outgoing_capabilities, &peer.incoming_capabilities),
        }
    }

    pub fn can_receive(&self, packet_type: &str) -> bool {
        self.incoming.contains(packet_type)
    }

    pub fn can_send(&self, packet_type: &str) -> bool {
        self.outgoing.contains(packet_type)
    }

    /// Whether any packet type of the plugin survived negotiation
    pub fn supports(&self, metadata: &PluginMetadata) -> bool {
        metadata
            .incoming
            .iter()
            .chain(metadata.outgoing.iter())
            .any(|packet_type| self.can_receive(packet_type) || self.can_send(packet_type))
    }

    /// Like [`supports`](Self::supports), as a `CapabilityMismatch` error
    pub fn check(&self, metadata: &PluginMetadata) -> Result<()> {
        if self.supports(metadata) {
            Ok(())
        } else {
            Err(ProtocolError::CapabilityMismatch(format!(
                "peer shares no packet types with plugin '{}'",
                metadata.id
            )))
        }
    }

    /// Whether every packet type the action needs is available
    pub fn satisfies(&self, action: &ActionSpec) -> bool {
        action.incoming.iter().all(|t| self.can_receive(t))
            && action.outgoing.iter().all(|t| self.can_send(t))
    }
}

fn intersect(ours: &[String], theirs: &[String]) -> BTreeSet<String> {
    let theirs: BTreeSet<&str> = theirs.iter().map(String::as_str).collect();
    ours.iter()
        .filter(|packet_type| theirs.contains(packet_type.as_str()))
        .cloned()
        .collect()
}
