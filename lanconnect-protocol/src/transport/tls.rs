//! TLS handshakes over established TCP streams
//!
//! Roles are inverted with respect to TCP: the side that accepted the TCP
//! connection runs the TLS client, and the side that dialled runs the server.
//! Payload transfers follow the same rule with the uploader as server.

use crate::codec::{read_identity_line, write_packet};
use crate::discovery::{DeviceInfo, MAX_IDENTITY_SIZE};
use crate::{CertificateInfo, ProtocolError, Result};
use openssl::ssl::Ssl;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, error};

use super::tls_config;

/// First protocol version that repeats the identity over TLS
pub const IDENTITY_OVER_TLS_VERSION: u32 = 8;

/// Run the TLS server side of a handshake
pub async fn accept_tls<S>(
    stream: S,
    our_cert: &CertificateInfo,
    handshake_timeout: Duration,
) -> Result<SslStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = tls_config::server_acceptor(our_cert)?;
    let ssl = Ssl::new(acceptor.context())?;
    let mut tls_stream = SslStream::new(ssl, stream)?;

    timeout(handshake_timeout, Pin::new(&mut tls_stream).accept())
        .await
        .map_err(|_| ProtocolError::HandshakeFailure("TLS handshake timed out".to_string()))?
        .map_err(|e| {
            error!("TLS handshake (server) failed: {}", e);
            ProtocolError::HandshakeFailure(format!("TLS handshake failed: {}", e))
        })?;

    debug!("TLS handshake complete (server)");
    Ok(tls_stream)
}

/// Run the TLS client side of a handshake
pub async fn connect_tls<S>(
    stream: S,
    our_cert: &CertificateInfo,
    handshake_timeout: Duration,
) -> Result<SslStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = tls_config::client_connector(our_cert)?;
    let ssl = Ssl::new(connector.context())?;
    let mut tls_stream = SslStream::new(ssl, stream)?;

    timeout(handshake_timeout, Pin::new(&mut tls_stream).connect())
        .await
        .map_err(|_| ProtocolError::HandshakeFailure("TLS handshake timed out".to_string()))?
        .map_err(|e| {
            error!("TLS handshake (client) failed: {}", e);
            ProtocolError::HandshakeFailure(format!("TLS handshake failed: {}", e))
        })?;

    debug!("TLS handshake complete (client)");
    Ok(tls_stream)
}

/// DER bytes of the certificate the peer presented
pub fn peer_certificate_der<S>(stream: &SslStream<S>) -> Result<Vec<u8>> {
    let cert = stream.ssl().peer_certificate().ok_or_else(|| {
        ProtocolError::HandshakeFailure("peer presented no certificate".to_string())
    })?;
    Ok(cert.to_der()?)
}

/// Check that the certificate Common Name is the claimed device id
pub fn verify_peer_identity(cert_der: &[u8], device_id: &str) -> Result<()> {
    let common_name = CertificateInfo::device_id_from_der(cert_der)
        .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))?;
    if common_name != device_id {
        return Err(ProtocolError::HandshakeFailure(format!(
            "certificate is for {} but identity claims {}",
            common_name, device_id
        )));
    }
    Ok(())
}

/// Repeat the identity exchange over the encrypted stream
///
/// Returns the identity the peer sent inside TLS. For peers older than
/// [`IDENTITY_OVER_TLS_VERSION`] nothing is exchanged and the plaintext
/// identity is kept.
pub async fn exchange_identity<S>(
    stream: &mut SslStream<S>,
    ours: &DeviceInfo,
    plaintext: DeviceInfo,
    read_timeout: Duration,
) -> Result<DeviceInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if plaintext.protocol_version < IDENTITY_OVER_TLS_VERSION {
        return Ok(plaintext);
    }

    write_packet(stream, &ours.to_identity_packet()).await?;
    let packet = read_identity_line(stream, MAX_IDENTITY_SIZE, read_timeout).await?;
    let secure = DeviceInfo::from_identity_packet(&packet)
        .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))?;

    if secure.device_id != plaintext.device_id {
        return Err(ProtocolError::HandshakeFailure(format!(
            "device id changed during handshake: {} -> {}",
            plaintext.device_id, secure.device_id
        )));
    }
    if secure.protocol_version != plaintext.protocol_version {
        return Err(ProtocolError::ProtocolVersionMismatch(format!(
            "protocol version changed during handshake: {} -> {}",
            plaintext.protocol_version, secure.protocol_version
        )));
    }

    Ok(secure)
}
