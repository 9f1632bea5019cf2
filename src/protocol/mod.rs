//! Wire protocol: packet envelope, identity packet, and pairing packet.

pub mod identity;
pub mod packet;

pub use identity::{DeviceType, Identity};
pub use packet::{Packet, DEFAULT_MAX_PACKET_SIZE, PORT_RANGE_END, PORT_RANGE_START};

/// Protocol version implemented by this crate. Peers below 7 are refused;
/// peers above 7 are logged and treated as 7 (see `spec.md` Open Questions).
pub const PROTOCOL_VERSION: i32 = 7;

/// The packet type naming the identity broadcast/handshake packet.
pub const IDENTITY_PACKET_TYPE: &str = "kdeconnect.identity";

/// The packet type naming the pairing request/response packet.
pub const PAIR_PACKET_TYPE: &str = "kdeconnect.pair";
