//! Trust-on-first-use certificate pinning.
//!
//! The first certificate seen for a device id is pinned at pairing time;
//! every later connection from that device id must present byte-identical
//! DER, or the channel is rejected before any packet is exchanged.

use crate::crypto::identity_store::{fingerprint_of, is_same_certificate};
use std::collections::HashMap;
use std::sync::RwLock;

/// A pinned peer certificate, keyed by device id.
#[derive(Debug, Clone)]
pub struct PinnedCertificate {
    pub der: Vec<u8>,
    pub fingerprint: String,
}

impl PinnedCertificate {
    pub fn new(der: Vec<u8>) -> Self {
        let fingerprint = fingerprint_of(&der);
        Self { der, fingerprint }
    }
}

/// In-memory pin table. Persistence of pins lives with the device cache
/// (`device::manager`), which stores the PEM alongside the rest of a
/// device's record; this store is the fast lookup used during the TLS
/// handshake itself.
#[derive(Default)]
pub struct TrustStore {
    pins: RwLock<HashMap<String, PinnedCertificate>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `der` as the trusted certificate for `device_id`, replacing any
    /// previous pin (re-pairing always re-pins).
    pub fn pin(&self, device_id: &str, der: Vec<u8>) {
        let pinned = PinnedCertificate::new(der);
        self.pins
            .write()
            .expect("trust store lock poisoned")
            .insert(device_id.to_string(), pinned);
    }

    pub fn unpin(&self, device_id: &str) {
        self.pins
            .write()
            .expect("trust store lock poisoned")
            .remove(device_id);
    }

    pub fn is_pinned(&self, device_id: &str) -> bool {
        self.pins
            .read()
            .expect("trust store lock poisoned")
            .contains_key(device_id)
    }

    /// Compare `der` against the pin for `device_id`. Returns `None` if the
    /// device has no pin (unpaired); `Some(true)` if it matches exactly.
    pub fn verify(&self, device_id: &str, der: &[u8]) -> Option<bool> {
        self.pins
            .read()
            .expect("trust store lock poisoned")
            .get(device_id)
            .map(|pinned| is_same_certificate(&pinned.der, der))
    }

    pub fn fingerprint_of(&self, device_id: &str) -> Option<String> {
        self.pins
            .read()
            .expect("trust store lock poisoned")
            .get(device_id)
            .map(|pinned| pinned.fingerprint.clone())
    }
}
