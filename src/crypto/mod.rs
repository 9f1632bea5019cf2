//! Certificate generation, TOFU pinning, and the rustls configuration
//! built from them.

pub mod identity_store;
pub mod tls;
pub mod trust_store;

pub use identity_store::{
    common_name_of, fingerprint_of, generate_device_id, is_same_certificate, IdentityStore,
};
pub use tls::{client_config_for, server_config_for};
pub use trust_store::{PinnedCertificate, TrustStore};
