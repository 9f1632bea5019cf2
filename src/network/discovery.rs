//! UDP broadcast discovery.
//!
//! Every `BROADCAST_INTERVAL`, and once at startup, this device's identity
//! packet is broadcast on [`DISCOVERY_PORT`]. Received identity packets are
//! pushed onto an mpsc channel for the channel service to turn into
//! outbound connection attempts.

use crate::protocol::{packet::Packet, Identity};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// UDP port used for identity broadcast and discovery.
pub const DISCOVERY_PORT: u16 = 1716;

/// How often the local identity is rebroadcast.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(15);

/// A discovered identity, paired with the address it arrived from.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub identity: Identity,
    pub addr: SocketAddr,
}

/// Runs the UDP broadcast/listen loop until `cancel` fires.
///
/// `local_identity` is recomputed on every tick via the closure so a
/// changing tcp port or capability set is picked up without restarting the
/// task.
pub async fn run(
    bind_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    local_identity: impl Fn() -> Identity + Send + Sync + 'static,
    events: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.set_broadcast(true)?;

    let mut interval = tokio::time::interval(DEFAULT_BROADCAST_INTERVAL);
    let mut buf = vec![0u8; crate::protocol::DEFAULT_MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = broadcast_identity(&socket, broadcast_addr, &local_identity()).await {
                    tracing::warn!(error = %e, "failed to broadcast identity");
                }
            }
            result = socket.recv_from(&mut buf) => {
                let (len, from) = result?;
                match parse_identity_datagram(&buf[..len]) {
                    Ok(identity) => {
                        if events.send(DiscoveryEvent { identity, addr: from }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, %from, "ignoring malformed discovery datagram"),
                }
            }
        }
    }
    Ok(())
}

async fn broadcast_identity(
    socket: &UdpSocket,
    broadcast_addr: SocketAddr,
    identity: &Identity,
) -> crate::error::Result<()> {
    let packet = identity.to_packet();
    let bytes = packet.to_bytes()?;
    socket.send_to(&bytes, broadcast_addr).await?;
    Ok(())
}

fn parse_identity_datagram(data: &[u8]) -> crate::error::Result<Identity> {
    let trimmed = data.strip_suffix(b"\n").unwrap_or(data);
    let packet = Packet::from_bytes(trimmed)?;
    Identity::from_packet(&packet)
}
