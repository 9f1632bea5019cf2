//! This device's long-lived identity: a self-signed certificate and key
//! pair whose CN is the device id, persisted under the data directory so
//! the same identity survives restarts (pairing is pinned to it).

use crate::error::{ProtocolError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

const CERT_FILE: &str = "certificate.pem";
const KEY_FILE: &str = "private.pem";

/// A generated or loaded identity: DER-encoded certificate plus the
/// matching private key, both kept around for the TLS config layer.
pub struct IdentityStore {
    device_id: String,
    cert_der: Vec<u8>,
    cert_pem: String,
    key_pem: String,
}

impl IdentityStore {
    /// Load the identity from `dir` if present, otherwise generate a new
    /// self-signed certificate with `CN = device_id` and persist it.
    pub async fn load_or_generate(dir: &Path, device_id: &str) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path).await?;
            let key_pem = fs::read_to_string(&key_path).await?;
            let cert_der = pem_to_der(&cert_pem)?;
            let stored_cn = common_name_of(&cert_der)?;
            if stored_cn != device_id {
                return Err(ProtocolError::invalid_data(format!(
                    "stored certificate CN {stored_cn} does not match device id {device_id}"
                )));
            }
            return Ok(Self {
                device_id: device_id.to_string(),
                cert_der,
                cert_pem,
                key_pem,
            });
        }

        fs::create_dir_all(dir).await?;
        let generated = Self::generate(device_id)?;
        fs::write(&cert_path, &generated.cert_pem).await?;
        fs::write(&key_path, &generated.key_pem).await?;
        Ok(generated)
    }

    /// Load the identity from `dir` if present; otherwise mint a fresh
    /// device id (spec 4.2: "a freshly generated device id (UUID-like, 32
    /// lowercase hex chars)") and generate+persist a certificate for it.
    /// Use this at first-ever startup, when the caller has no device id of
    /// its own to provide; [`IdentityStore::load_or_generate`] is for
    /// callers (tests, fixtures) that already know the id they want.
    pub async fn load_or_generate_default(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path).await?;
            let key_pem = fs::read_to_string(&key_path).await?;
            let cert_der = pem_to_der(&cert_pem)?;
            let device_id = common_name_of(&cert_der)?;
            return Ok(Self { device_id, cert_der, cert_pem, key_pem });
        }
        Self::load_or_generate(dir, &generate_device_id()).await
    }

    /// Generate a fresh self-signed certificate without touching disk.
    pub fn generate(device_id: &str) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(device_id.to_string())];

        // rcgen (backed by ring) cannot generate RSA keys; ECDSA P-256 is
        // the key type every KDE Connect-compatible TLS stack accepts.
        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        params.key_pair = Some(key_pair);

        let cert = rcgen::Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();
        let cert_der = cert.serialize_der()?;

        Ok(Self {
            device_id: device_id.to_string(),
            cert_der,
            cert_pem,
            key_pem,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// SHA-256 fingerprint of the DER-encoded certificate, as lowercase hex.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.cert_der)
    }
}

/// SHA-256 fingerprint of an arbitrary DER certificate, as lowercase hex.
pub fn fingerprint_of(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    hex::encode(digest)
}

/// Extract the certificate's subject common name.
pub fn common_name_of(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| ProtocolError::invalid_data(format!("malformed certificate: {e}")))?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ProtocolError::invalid_data("certificate has no common name"))
}

/// True if two DER certificates are byte-for-byte identical.
pub fn is_same_certificate(a: &[u8], b: &[u8]) -> bool {
    a == b
}

/// Mint a fresh device id: a v4 UUID with hyphens stripped, 32 lowercase
/// hex characters, matching the id shape every KDE Connect-compatible
/// peer expects.
pub fn generate_device_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn pem_to_der(pem_str: &str) -> Result<Vec<u8>> {
    let parsed = pem::parse(pem_str)
        .map_err(|e| ProtocolError::invalid_data(format!("malformed PEM: {e}")))?;
    Ok(parsed.into_contents())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_certificate_has_matching_common_name() {
        let store = IdentityStore::generate("device-123").unwrap();
        assert_eq!(common_name_of(store.cert_der()).unwrap(), "device-123");
    }

    #[test]
    fn fingerprint_is_stable_for_same_der() {
        let store = IdentityStore::generate("device-abc").unwrap();
        assert_eq!(store.fingerprint(), fingerprint_of(store.cert_der()));
        assert_eq!(store.fingerprint().len(), 64);
    }

    #[test]
    fn different_devices_get_different_fingerprints() {
        let a = IdentityStore::generate("device-a").unwrap();
        let b = IdentityStore::generate("device-b").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn same_certificate_bytes_compare_equal() {
        let store = IdentityStore::generate("device-x").unwrap();
        assert!(is_same_certificate(store.cert_der(), store.cert_der()));
    }

    #[tokio::test]
    async fn load_or_generate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityStore::load_or_generate(dir.path(), "device-persist")
            .await
            .unwrap();
        let second = IdentityStore::load_or_generate(dir.path(), "device-persist")
            .await
            .unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn load_or_generate_rejects_mismatched_device_id() {
        let dir = tempfile::tempdir().unwrap();
        IdentityStore::load_or_generate(dir.path(), "device-one")
            .await
            .unwrap();
        let result = IdentityStore::load_or_generate(dir.path(), "device-two").await;
        assert!(result.is_err());
    }

    #[test]
    fn generated_device_ids_are_32_lowercase_hex_chars() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn generated_device_ids_are_unique() {
        assert_ne!(generate_device_id(), generate_device_id());
    }

    #[tokio::test]
    async fn load_or_generate_default_mints_an_id_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::load_or_generate_default(dir.path()).await.unwrap();
        assert_eq!(store.device_id().len(), 32);
        assert_eq!(common_name_of(store.cert_der()).unwrap(), store.device_id());
    }

    #[tokio::test]
    async fn load_or_generate_default_reuses_persisted_identity() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityStore::load_or_generate_default(dir.path()).await.unwrap();
        let second = IdentityStore::load_or_generate_default(dir.path()).await.unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }
}
