//! TLS contexts for channels and payload transfers
//!
//! Devices present self-signed certificates, so the handshake never verifies
//! a chain. The server side still requests the peer certificate so that its
//! Common Name and fingerprint can be checked once the handshake completes.
//!
//! TLS 1.0 and the legacy cipher below stay enabled for older Android peers.

use crate::{CertificateInfo, ProtocolError, Result};
use openssl::pkey::PKey;
use openssl::ssl::{
    SslAcceptor, SslAcceptorBuilder, SslConnector, SslConnectorBuilder, SslMethod,
    SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use std::sync::Arc;
use tracing::debug;

/// Cipher suites accepted by every known peer implementation
///
/// `@SECLEVEL=1` is needed for TLS 1.0 and ECDHE-RSA-AES128-SHA.
pub const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

fn config_error(what: &str, e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::CertificateValidation(format!("{}: {}", what, e))
}

fn load_identity(our_cert: &CertificateInfo) -> Result<(X509, PKey<openssl::pkey::Private>)> {
    let cert = X509::from_der(&our_cert.certificate)
        .map_err(|e| config_error("Failed to parse certificate", e))?;
    let pkey = PKey::private_key_from_der(&our_cert.private_key)
        .map_err(|e| config_error("Failed to parse private key", e))?;
    Ok((cert, pkey))
}

/// Create the acceptor used when we act as TLS server
///
/// We are the server when we dialled the TCP connection, or when we offer a
/// payload for upload.
pub fn server_acceptor(our_cert: &CertificateInfo) -> Result<Arc<SslAcceptor>> {
    debug!("Creating TLS server context for {}", our_cert.device_id);

    let mut builder: SslAcceptorBuilder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .map_err(|e| config_error("Failed to create SSL acceptor", e))?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1))
        .map_err(|e| config_error("Failed to set min TLS version", e))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| config_error("Failed to set max TLS version", e))?;
    builder
        .set_cipher_list(CIPHER_LIST)
        .map_err(|e| config_error("Failed to set cipher list", e))?;

    // Request the client certificate but accept any; trust is decided later
    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

    let (cert, pkey) = load_identity(our_cert)?;
    builder
        .set_certificate(&cert)
        .map_err(|e| config_error("Failed to set certificate", e))?;
    builder
        .set_private_key(&pkey)
        .map_err(|e| config_error("Failed to set private key", e))?;

    Ok(Arc::new(builder.build()))
}

/// Create the connector used when we act as TLS client
pub fn client_connector(our_cert: &CertificateInfo) -> Result<Arc<SslConnector>> {
    debug!("Creating TLS client context for {}", our_cert.device_id);

    let mut builder: SslConnectorBuilder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| config_error("Failed to create SSL connector", e))?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1))
        .map_err(|e| config_error("Failed to set min TLS version", e))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| config_error("Failed to set max TLS version", e))?;
    builder
        .set_cipher_list(CIPHER_LIST)
        .map_err(|e| config_error("Failed to set cipher list", e))?;

    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

    let (cert, pkey) = load_identity(our_cert)?;
    builder
        .set_certificate(&cert)
        .map_err(|e| config_error("Failed to set certificate", e))?;
    builder
        .set_private_key(&pkey)
        .map_err(|e| config_error("Failed to set private key", e))?;

    Ok(Arc::new(builder.build()))
}
