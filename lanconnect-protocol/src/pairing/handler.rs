//! Pairing state machine
//!
//! Pairing is exchanged as `kdeconnect.pair` packets over an established
//! channel. `{"pair": true}` is a request or an acceptance depending on
//! state; `{"pair": false}` is a rejection or an unpair.
//!
//! ```text
//!              request()                 pair:true
//!   Unpaired ────────────▶ Requested ───────────────▶ Paired
//!      │  ▲                   │ timeout / pair:false     ▲
//!      │  └───────────────────┘                          │
//!      │ pair:true                         accept()      │
//!      └──────────────▶ RequestedByPeer ─────────────────┘
//! ```
//!
//! The machine is pure: it returns what should be sent and whether the
//! timeout must be armed, and leaves I/O and timers to the device.

use crate::packet::PACKET_TYPE_PAIR;
use crate::{Packet, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default pairing timeout
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    /// Not paired
    Unpaired,
    /// Pairing request sent, awaiting response
    Requested,
    /// Pairing request received, awaiting user confirmation
    #[serde(rename = "requested_by_peer")]
    RequestedByPeer,
    /// Successfully paired
    Paired,
}

impl PairingStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, PairingStatus::Requested | PairingStatus::RequestedByPeer)
    }
}

/// Pairing request/response packet
#[derive(Debug, Clone)]
pub struct PairingPacket {
    /// Whether pairing is requested (true) or rejected/unpaired (false)
    pub pair: bool,
}

impl PairingPacket {
    /// Create a pairing request packet
    pub fn request() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    /// Create a pairing accept response packet
    pub fn accept() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    /// Create a pairing reject response packet
    pub fn reject() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    /// Create an unpair packet
    pub fn unpair() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    /// Parse a pairing packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::InvalidPacket(
                "Not a pairing packet".to_string(),
            ));
        }

        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}

/// What the pairing timer should do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Leave any running timer alone
    Keep,
    /// Start (or restart) the timeout for the current generation
    Arm,
    /// Invalidate any running timer
    Disarm,
}

/// Result of a pairing transition
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    pub previous: PairingStatus,
    pub status: PairingStatus,
    /// Packet to send to the peer, if any
    pub reply: Option<Packet>,
    pub timer: TimerAction,
    /// Generation the armed timer belongs to
    pub generation: u64,
}

impl PairingOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }

    /// Whether the peer's certificate became trusted in this transition
    pub fn became_paired(&self) -> bool {
        self.previous != PairingStatus::Paired && self.status == PairingStatus::Paired
    }

    /// Whether an established pairing was dropped in this transition
    pub fn lost_pairing(&self) -> bool {
        self.previous == PairingStatus::Paired && self.status != PairingStatus::Paired
    }
}

/// Per-device pairing state
#[derive(Debug, Clone)]
pub struct PairingMachine {
    status: PairingStatus,
    generation: u64,
}

impl Default for PairingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingMachine {
    pub fn new() -> Self {
        Self {
            status: PairingStatus::Unpaired,
            generation: 0,
        }
    }

    /// Start from a previously persisted trust decision
    pub fn paired() -> Self {
        Self {
            status: PairingStatus::Paired,
            generation: 0,
        }
    }

    pub fn status(&self) -> PairingStatus {
        self.status
    }

    pub fn is_paired(&self) -> bool {
        self.status == PairingStatus::Paired
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send a pairing request
    ///
    /// Requesting while the peer's own request is pending accepts it.
    pub fn request(&mut self) -> Result<PairingOutcome> {
        match self.status {
            PairingStatus::Paired => Err(ProtocolError::InvalidState(
                "device is already paired".to_string(),
            )),
            PairingStatus::RequestedByPeer => self.accept(),
            PairingStatus::Unpaired | PairingStatus::Requested => {
                info!("Sending pairing request");
                Ok(self.transition(
                    PairingStatus::Requested,
                    Some(PairingPacket::request()),
                    TimerAction::Arm,
                ))
            }
        }
    }

    /// Accept the peer's pending request
    pub fn accept(&mut self) -> Result<PairingOutcome> {
        if self.status != PairingStatus::RequestedByPeer {
            return Err(ProtocolError::InvalidState(
                "No pairing request pending".to_string(),
            ));
        }
        info!("Accepting pairing request");
        Ok(self.transition(
            PairingStatus::Paired,
            Some(PairingPacket::accept()),
            TimerAction::Disarm,
        ))
    }

    /// Reject the peer's pending request
    pub fn reject(&mut self) -> Result<PairingOutcome> {
        if self.status != PairingStatus::RequestedByPeer {
            return Err(ProtocolError::InvalidState(
                "No pairing request pending".to_string(),
            ));
        }
        info!("Rejecting pairing request");
        Ok(self.transition(
            PairingStatus::Unpaired,
            Some(PairingPacket::reject()),
            TimerAction::Disarm,
        ))
    }

    /// Drop any pairing, telling the peer
    pub fn unpair(&mut self) -> PairingOutcome {
        self.transition(
            PairingStatus::Unpaired,
            Some(PairingPacket::unpair()),
            TimerAction::Disarm,
        )
    }

    /// Forget a pending request without telling the peer (channel lost)
    pub fn cancel_pending(&mut self) -> Option<PairingOutcome> {
        if !self.status.is_pending() {
            return None;
        }
        Some(self.transition(PairingStatus::Unpaired, None, TimerAction::Disarm))
    }

    /// Adopt a trust decision already made for the peer's certificate
    pub fn restore(&mut self, paired: bool) -> Option<PairingOutcome> {
        let status = if paired {
            PairingStatus::Paired
        } else {
            PairingStatus::Unpaired
        };
        if self.status == status {
            return None;
        }
        Some(self.transition(status, None, TimerAction::Disarm))
    }

    /// Handle an incoming `kdeconnect.pair` packet
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<PairingOutcome> {
        let pairing = PairingPacket::from_packet(packet)?;
        debug!(
            "Processing pairing packet (pair: {}) in state {:?}",
            pairing.pair, self.status
        );

        if !pairing.pair {
            if self.status == PairingStatus::Paired {
                info!("Peer unpaired");
            } else if self.status.is_pending() {
                info!("Pairing rejected");
            }
            return Ok(self.transition(PairingStatus::Unpaired, None, TimerAction::Disarm));
        }

        Ok(match self.status {
            PairingStatus::Unpaired => {
                info!("Received pairing request");
                self.transition(PairingStatus::RequestedByPeer, None, TimerAction::Arm)
            }
            PairingStatus::RequestedByPeer => {
                // A repeated request re-asserts the pending one
                debug!("Pairing request re-asserted, resetting timeout");
                self.transition(PairingStatus::RequestedByPeer, None, TimerAction::Arm)
            }
            PairingStatus::Requested => {
                info!("Pairing accepted by peer");
                self.transition(PairingStatus::Paired, None, TimerAction::Disarm)
            }
            PairingStatus::Paired => {
                warn!("Pairing request from already paired peer, confirming");
                self.transition(
                    PairingStatus::Paired,
                    Some(PairingPacket::accept()),
                    TimerAction::Keep,
                )
            }
        })
    }

    /// Expire the request armed at `generation`
    ///
    /// Returns the outcome if the request was still pending; stale timers
    /// from earlier generations are ignored.
    pub fn expire(&mut self, generation: u64) -> Option<PairingOutcome> {
        if generation != self.generation || !self.status.is_pending() {
            return None;
        }
        info!("Pairing request timed out");
        Some(self.transition(PairingStatus::Unpaired, None, TimerAction::Disarm))
    }

    fn transition(
        &mut self,
        status: PairingStatus,
        reply: Option<Packet>,
        timer: TimerAction,
    ) -> PairingOutcome {
        let previous = self.status;
        self.status = status;
        if timer != TimerAction::Keep {
            self.generation += 1;
        }
        PairingOutcome {
            previous,
            status,
            reply,
            timer,
            generation: self.generation,
        }
    }
}
