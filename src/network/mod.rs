//! LAN transport: UDP discovery, the TLS channel, and the channel service
//! that ties the two together.

pub mod channel;
pub mod channel_service;
pub mod discovery;
pub mod payload;

pub use channel::Channel;
pub use channel_service::{ChannelEvent, ChannelService};
pub use discovery::{DiscoveryEvent, DEFAULT_BROADCAST_INTERVAL, DISCOVERY_PORT};
pub use payload::{download, upload};
