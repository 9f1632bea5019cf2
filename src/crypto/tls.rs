//! rustls configuration for the channel service.
//!
//! Every peer presents a self-signed certificate; there is no CA to
//! validate against; trust is established out-of-band by the pairing
//! handshake and enforced by [`crate::crypto::TrustStore`] comparing raw
//! DER bytes, not by the TLS stack's certificate validator. The verifiers
//! here only check that the certificate is well-formed, matching the
//! "accept anything self-signed, pin after pairing" model used by every
//! KDE Connect-compatible implementation.

use crate::crypto::identity_store::IdentityStore;
use crate::error::{ProtocolError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pemfile::Item;
use std::sync::Arc;

/// Accepts any certificate; real trust happens after the identity packet
/// is parsed and compared against the pin table.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_signature_schemes()
    }
}

fn all_signature_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
        SignatureScheme::ED25519,
    ]
}

fn load_key_pair(key_pem: &str) -> Result<rustls_pki_types::PrivateKeyDer<'static>> {
    let mut reader = std::io::Cursor::new(key_pem.as_bytes());
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ProtocolError::invalid_data(format!("malformed private key PEM: {e}")))?
        {
            Some(Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(Item::Sec1Key(key)) => return Ok(key.into()),
            Some(_) => continue,
            None => {
                return Err(ProtocolError::invalid_data(
                    "no private key found in PEM".to_string(),
                ))
            }
        }
    }
}

fn cert_chain_from_der(der: &[u8]) -> Vec<rustls_pki_types::CertificateDer<'static>> {
    vec![rustls_pki_types::CertificateDer::from(der.to_vec())]
}

/// Build the TLS client config used by the connecting side of a channel
/// (the side that did not accept the TCP connection).
pub fn client_config_for(identity: &IdentityStore) -> Result<Arc<ClientConfig>> {
    let key = load_key_pair(identity.key_pem())?;
    let chain = cert_chain_from_der(identity.cert_der());

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(chain, key)
        .map_err(|e| ProtocolError::auth_failed(format!("client TLS config: {e}")))?;
    config.alpn_protocols.clear();
    Ok(Arc::new(config))
}

/// Accepts any client certificate; mirrors [`AcceptAnyServerCert`] for the
/// server side of the handshake.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[rustls_pki_types::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_signature_schemes()
    }
}

/// Build the TLS server config used by the accepting side of a channel.
pub fn server_config_for(identity: &IdentityStore) -> Result<Arc<ServerConfig>> {
    let key = load_key_pair(identity.key_pem())?;
    let chain = cert_chain_from_der(identity.cert_der());

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(chain, key)
        .map_err(|e| ProtocolError::auth_failed(format!("server TLS config: {e}")))?;
    config.alpn_protocols.clear();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_configs_build_from_a_generated_identity() {
        let identity = IdentityStore::generate("device-tls").unwrap();
        assert!(client_config_for(&identity).is_ok());
        assert!(server_config_for(&identity).is_ok());
    }
}
