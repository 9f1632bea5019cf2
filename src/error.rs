//! Error types for the protocol core.
//!
//! A single [`ProtocolError`] enum spans every fallible operation in this
//! crate: packet validation, certificate handling, TLS, and the device
//! state machine. Transport and serialization errors convert automatically
//! via `#[from]`; domain errors are constructed directly.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the protocol core.
///
/// Variant names follow the taxonomy in the protocol specification
/// (`Io`, `Closed`, `InvalidData`, `AuthenticationFailed`, `NotSupported`,
/// `Cancelled`, `Timeout`, `BadRequest`); a few extra leaves exist purely to
/// carry `#[from]` conversions for the ambient stack.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Underlying socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel (or a payload subchannel) was closed, locally or by the
    /// peer.
    #[error("channel closed")]
    Closed,

    /// Malformed framing, JSON, or packet schema.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Peer certificate mismatch, or TLS handshake failure.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Packet type outside the peer's declared capability set.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The operation was cancelled (task cancellation, shutdown).
    #[error("cancelled")]
    Cancelled,

    /// A bounded wait (pairing, handshake, payload accept) expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A plugin rejected a packet's body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error from rustls.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error from rcgen.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// No device exists with the given id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired device.
    #[error("device not paired: {0}")]
    NotPaired(String),
}

impl ProtocolError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidData(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        ProtocolError::AuthenticationFailed(msg.into())
    }

    /// True if retrying the operation might succeed (transient transport
    /// failure), false if the error reflects a permanent precondition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::Timeout(_) | ProtocolError::Closed
        )
    }
}
