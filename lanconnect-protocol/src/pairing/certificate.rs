//! Device certificates
//!
//! Every device carries a self-signed certificate whose Common Name is its
//! device id. There is no certificate authority: a successful TLS handshake
//! only proves the peer holds the key for the certificate it presented.
//! Whether that certificate is trusted is a separate, persisted decision
//! keyed by its SHA256 fingerprint (see [`crate::store::TrustStore`]).
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: Device UUID
//! - **Validity**: 10 years

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate validity period (10 years)
const CERT_VALIDITY_YEARS: u32 = 10;

/// Organization name in certificate
const CERT_ORG: &str = "KDE";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Kde connect";

/// File names used by [`CertificateInfo::load_or_generate`]
pub const CERTIFICATE_FILE: &str = "certificate.pem";
pub const PRIVATE_KEY_FILE: &str = "private.pem";

/// Device certificate information
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device ID (UUID)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of certificate (for verification)
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// # Examples
    ///
    /// ```
    /// use lanconnect_protocol::pairing::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// assert_eq!(cert_info.fingerprint.split(':').count(), 32);
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        // Backdate by a day to tolerate clock skew between peers
        let not_before = Asn1Time::from_unix(chrono::Utc::now().timestamp() - 86_400)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_YEARS * 365)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate_der = cert.to_der()?;
        let private_key_der = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate_der);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate: certificate_der,
            private_key: private_key_der,
            fingerprint,
        })
    }

    /// Calculate SHA256 fingerprint of a certificate
    ///
    /// Returns fingerprint in format: XX:XX:XX:...:XX (hex bytes separated by colons)
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let hash = Sha256::digest(cert_der);

        hash.iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Read the device id (Common Name) out of a DER certificate
    pub fn device_id_from_der(cert_der: &[u8]) -> Result<String> {
        let cert = X509::from_der(cert_der).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to parse certificate: {}", e))
        })?;
        Self::extract_device_id_from_cert(&cert)
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", self.certificate.clone()));
        fs::write(cert_path, cert_pem)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        let key_pem = pkey.private_key_to_pem_pkcs8()?;
        fs::write(key_path, key_pem)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert_pem = fs::read(cert_path)?;
        let parsed = pem::parse(&cert_pem).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Invalid certificate PEM: {}", e))
        })?;
        let certificate = parsed.contents().to_vec();
        let cert = X509::from_der(&certificate)?;

        let key_pem = fs::read(key_path)?;
        let pkey = PKey::private_key_from_pem(&key_pem)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = Self::extract_device_id_from_cert(&cert)?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load the certificate stored in `dir`, generating one for `device_id` if absent
    ///
    /// A stored certificate for a different device id is replaced.
    pub fn load_or_generate(dir: impl AsRef<Path>, device_id: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CERTIFICATE_FILE);
        let key_path = dir.join(PRIVATE_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let existing = Self::load_from_files(&cert_path, &key_path)?;
            if existing.device_id == device_id {
                return Ok(existing);
            }
            info!(
                "Stored certificate belongs to {}, regenerating for {}",
                existing.device_id, device_id
            );
        }

        let cert = Self::generate(device_id)?;
        cert.save_to_files(&cert_path, &key_path)?;
        Ok(cert)
    }

    fn extract_device_id_from_cert(cert: &X509) -> Result<String> {
        let entry = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .ok_or_else(|| {
                ProtocolError::CertificateValidation(
                    "Certificate does not contain Common Name".to_string(),
                )
            })?;

        Ok(entry.data().to_string()?)
    }
}
