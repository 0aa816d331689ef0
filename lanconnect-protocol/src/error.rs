//! Error handling for the LAN Connect protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are automatically converted from underlying library errors using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! Use `?` for propagation and match on variants where the caller can recover:
//!
//! ```rust
//! use lanconnect_protocol::{Packet, ProtocolError, Result};
//!
//! fn parse(data: &[u8]) -> Result<Packet> {
//!     let packet = Packet::from_bytes(data)?;
//!     Ok(packet)
//! }
//!
//! match parse(b"not json") {
//!     Err(ProtocolError::InvalidPacket(msg)) => assert!(!msg.is_empty()),
//!     other => panic!("unexpected result: {:?}", other),
//! }
//! ```
//!
//! ## Error Categories
//!
//! ### I/O, Serialization and TLS
//! Converted automatically from `std::io::Error`, `serde_json::Error`,
//! `openssl::ssl::Error` and `openssl::error::ErrorStack`.
//!
//! ### Transport Errors
//! - `MalformedFrame`: unrecoverable for the channel it occurred on
//! - `HandshakeFailure`: the connection attempt is dropped, never retried automatically
//!
//! ### Pairing Errors
//! - `PairingTimeout`: the request was not answered in time, state reverts to unpaired
//! - `ProtocolVersionMismatch`: the peer changed its protocol version inside TLS
//! - `NotPaired`: operation requires a paired device
//!
//! ### Transfer Errors
//! - `SizeMismatch`: more bytes than declared
//! - `TransferAborted`: the stream ended or failed before the declared size
//!
//! ### Plugin Errors
//! - `CapabilityMismatch`: the plugin is not instantiated, never surfaced to the user
//! - `UnsupportedAction`: action invoked while disabled, rejected without side effects

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use lanconnect_protocol::ProtocolError;
///
/// let error = ProtocolError::NotPaired;
/// assert_eq!(error.to_string(), "Not paired");
///
/// let error = ProtocolError::SizeMismatch { expected: 4, received: 5 };
/// assert_eq!(error.to_string(), "Payload size mismatch: expected 4 bytes, received 5");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS/SSL error during handshake or stream I/O
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or management error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Certificate validation error
    ///
    /// Raised when a peer certificate cannot be parsed or does not match
    /// the identity it was presented with.
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// Device is not paired
    #[error("Not paired")]
    NotPaired,

    /// Invalid or malformed packet content
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A byte stream could not be split into complete packets
    ///
    /// Fatal for the channel the frame was read from.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Connection handshake failed (TCP, TLS or identity exchange)
    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    /// Pairing request was not answered in time
    #[error("Pairing timed out: {0}")]
    PairingTimeout(String),

    /// Payload stream carried more bytes than declared
    #[error("Payload size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    /// Payload stream ended or failed before completion
    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    /// Negotiated capabilities do not satisfy a plugin
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Action is unknown, disabled, or was given the wrong parameter
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Plugin-specific error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Network unreachable
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Protocol version mismatch
    #[error("Protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Packet size exceeded
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is recoverable (transient error that can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::PairingTimeout(_)
                | ProtocolError::TransferAborted(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotPaired
                | ProtocolError::Certificate(_)
                | ProtocolError::CertificateValidation(_)
                | ProtocolError::PermissionDenied(_)
                | ProtocolError::Configuration(_)
                | ProtocolError::ProtocolVersionMismatch(_)
        )
    }

    /// Check if this error leaves the stream it occurred on unusable
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::MalformedFrame("eof".into()).closes_channel());
    /// assert!(!ProtocolError::TransferAborted("eof".into()).closes_channel());
    /// ```
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedFrame(_)
                | ProtocolError::PacketSizeExceeded(_, _)
                | ProtocolError::Io(_)
                | ProtocolError::Tls(_)
        )
    }

    /// Get a user-friendly error message suitable for display in notifications
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "Device not paired. Please pair the device first.".to_string()
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check if the service is running on the device.".to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "Network unreachable. Check if both devices are on the same network.".to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("Network error: {}. Connection may be unstable.", msg)
            }
            ProtocolError::PermissionDenied(msg) => {
                format!("Permission denied: {}. Check file and directory permissions.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::ProtocolVersionMismatch(msg) => {
                format!("Incompatible protocol version: {}. Update both applications.", msg)
            }
            ProtocolError::CertificateValidation(msg) => {
                format!("Certificate validation failed: {}. You may need to re-pair.", msg)
            }
            ProtocolError::PacketSizeExceeded(size, max) => {
                format!("Packet too large ({} bytes, max {} bytes).", size, max)
            }
            ProtocolError::InvalidPacket(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::MalformedFrame(msg) => format!("Connection data corrupted: {}.", msg),
            ProtocolError::HandshakeFailure(msg) => {
                format!("Could not establish a secure connection: {}.", msg)
            }
            ProtocolError::PairingTimeout(_) => {
                "Pairing request timed out. Try pairing again.".to_string()
            }
            ProtocolError::SizeMismatch { expected, received } => format!(
                "Transfer failed: expected {} bytes but received {}.",
                expected, received
            ),
            ProtocolError::TransferAborted(msg) => format!("Transfer interrupted: {}.", msg),
            ProtocolError::CapabilityMismatch(msg) => {
                format!("Feature not supported by the device: {}.", msg)
            }
            ProtocolError::UnsupportedAction(msg) => {
                format!("Action not available: {}.", msg)
            }
            ProtocolError::InvalidState(msg) => format!("Operation not possible now: {}.", msg),
            ProtocolError::Plugin(msg) => format!("Plugin error: {}.", msg),
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::Tls(e) => format!("Secure connection error: {}.", e),
            ProtocolError::Certificate(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::NotPaired;
        assert_eq!(error.to_string(), "Not paired");

        let error = ProtocolError::MalformedFrame("truncated".to_string());
        assert_eq!(error.to_string(), "Malformed frame: truncated");

        let error = ProtocolError::UnsupportedAction("ring".to_string());
        assert_eq!(error.to_string(), "Unsupported action: ring");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_io_error_mapping() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(Error::from(ErrorKind::BrokenPipe), "sending");
        assert!(matches!(error, ProtocolError::NetworkError(_)));
        assert!(error.is_recoverable());

        let error =
            ProtocolError::from_io_error(Error::from(ErrorKind::PermissionDenied), "binding");
        assert!(error.requires_user_action());
    }

    #[test]
    fn test_transfer_errors_do_not_close_channel() {
        let error = ProtocolError::SizeMismatch {
            expected: 10,
            received: 11,
        };
        assert!(!error.closes_channel());
        assert!(error.user_message().contains("expected 10 bytes"));

        assert!(ProtocolError::PacketSizeExceeded(20, 10).closes_channel());
    }
}
