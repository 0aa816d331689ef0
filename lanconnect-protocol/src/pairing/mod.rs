//! Device Pairing
//!
//! Authentication and trust are separate steps:
//!
//! 1. **Identity**: Each device generates a self-signed certificate whose CN is
//!    its device id. The TLS handshake proves possession of that certificate.
//! 2. **Trust**: Users pair devices by exchanging `kdeconnect.pair` packets over
//!    the authenticated channel. Accepted certificates are recorded in a
//!    [`TrustStore`](crate::store::TrustStore) by fingerprint.
//!
//! A request that is not answered within [`PAIRING_TIMEOUT`] reverts to unpaired.

pub mod certificate;
pub mod handler;

pub use certificate::CertificateInfo;
pub use handler::{
    PairingMachine, PairingOutcome, PairingPacket, PairingStatus, TimerAction, PAIRING_TIMEOUT,
};
