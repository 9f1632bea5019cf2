//! LAN transport: ties UDP discovery to TCP+TLS channel establishment.
//!
//! Two devices that have broadcast to each other both "want" a TCP
//! connection; letting both sides connect at once produces two sockets for
//! one logical channel. The tie-break used here: the device whose id sorts
//! greater initiates the connection, the other only accepts. This is a
//! deliberate total-order resolution of the race, not the receiver always
//! dialing out — whichever id sorts lower waits for the other side's next
//! broadcast instead of connecting itself (see DESIGN.md's Open Questions).

use crate::crypto::identity_store::common_name_of;
use crate::crypto::IdentityStore;
use crate::error::{ProtocolError, Result};
use crate::network::channel::Channel;
use crate::network::discovery::{self, DiscoveryEvent};
use crate::protocol::{packet::PORT_RANGE_END, packet::PORT_RANGE_START, Identity};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Emitted as channels come and go.
pub enum ChannelEvent {
    Connected {
        device_id: String,
        identity: Identity,
        channel: Channel,
    },
    Disconnected {
        device_id: String,
    },
}

/// Coordinates UDP discovery and TCP/TLS channel setup for the LAN
/// transport. Holds no device state of its own; `events` is the only
/// output, consumed by the device manager.
pub struct ChannelService {
    identity: Arc<IdentityStore>,
    local_device: Box<dyn Fn() -> Identity + Send + Sync>,
    tcp_port: u16,
    /// Shared with the `local_device` closure's captured state so the
    /// identity broadcast always reflects the port actually bound by
    /// [`ChannelService::run`], even when the requested port was taken and
    /// the service fell back to a later one in the range.
    bound_port: Arc<AtomicU16>,
    events: mpsc::Sender<ChannelEvent>,
    active: Mutex<HashMap<String, ()>>,
}

impl ChannelService {
    /// `bound_port` should be the same cell closed over by `local_device`,
    /// so that once [`ChannelService::run`] binds, both this accessor and
    /// every future identity broadcast see the real port.
    pub fn new(
        identity: Arc<IdentityStore>,
        tcp_port: u16,
        bound_port: Arc<AtomicU16>,
        local_device: impl Fn() -> Identity + Send + Sync + 'static,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            identity,
            local_device: Box::new(local_device),
            tcp_port,
            bound_port,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The TCP port actually bound once [`ChannelService::run`] has started
    /// accepting, which may differ from the requested port if it was taken
    /// preferring 1716 and incrementing on bind failure.
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    /// Run discovery and the TCP accept loop until `cancel` fires. Returns
    /// once both subtasks have stopped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let (disco_tx, mut disco_rx) = mpsc::channel(32);

        let bind_addr: SocketAddr = ([0, 0, 0, 0], discovery::DISCOVERY_PORT).into();
        let broadcast_addr: SocketAddr = ([255, 255, 255, 255], discovery::DISCOVERY_PORT).into();
        let local_device = self.local_device_snapshot();
        let discovery_cancel = cancel.clone();
        let discovery_task = tokio::spawn(discovery::run(
            bind_addr,
            broadcast_addr,
            move || local_device.clone(),
            disco_tx,
            discovery_cancel,
        ));

        let listener = self.bind_tcp_listener().await?;
        let accept_cancel = cancel.clone();
        let accept_self = self.clone();
        let accept_task = tokio::spawn(async move { accept_self.accept_loop(listener, accept_cancel).await });

        let connect_self = self.clone();
        let connect_cancel = cancel.clone();
        let connect_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = connect_cancel.cancelled() => break,
                    event = disco_rx.recv() => {
                        match event {
                            Some(ev) => connect_self.handle_discovery(ev).await,
                            None => break,
                        }
                    }
                }
            }
        });

        let _ = tokio::join!(discovery_task, accept_task, connect_task);
        Ok(())
    }

    fn local_device_snapshot(&self) -> Identity {
        (self.local_device)()
    }

    /// Bind the TCP accept socket, preferring the configured port and
    /// incrementing through the LAN range on bind failure.
    async fn bind_tcp_listener(&self) -> Result<TcpListener> {
        let start = self.tcp_port.max(PORT_RANGE_START);
        for port in start..=PORT_RANGE_END {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    self.bound_port.store(port, Ordering::Release);
                    return Ok(listener);
                }
                Err(e) => tracing::debug!(port, error = %e, "TCP bind failed, trying next port"),
            }
        }
        Err(ProtocolError::invalid_data("no free TCP port in the payload range"))
    }

    /// Broadcast this device's identity immediately, outside the periodic
    /// discovery cadence.
    pub async fn identify(&self) -> Result<()> {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        let packet = self.local_device_snapshot().to_packet();
        let bytes = packet.to_bytes()?;
        let broadcast_addr: SocketAddr = ([255, 255, 255, 255], discovery::DISCOVERY_PORT).into();
        socket.send_to(&bytes, broadcast_addr).await?;
        Ok(())
    }

    /// Decide whether *this* device should be the one to dial out, given a
    /// discovered peer identity.
    fn should_initiate(&self, peer_id: &str) -> bool {
        self.local_device_snapshot().device_id.as_str() > peer_id
    }

    async fn handle_discovery(&self, event: DiscoveryEvent) {
        let peer_id = event.identity.device_id.clone();
        if peer_id == self.local_device_snapshot().device_id {
            return;
        }
        if !self.should_initiate(&peer_id) {
            return;
        }
        {
            let active = self.active.lock().await;
            if active.contains_key(&peer_id) {
                return;
            }
        }

        let peer_addr = SocketAddr::new(event.addr.ip(), event.identity.tcp_port);
        match self.connect(peer_addr, event.identity.clone()).await {
            Ok(channel) => match self.verify_peer_cn(&channel, &peer_id) {
                Ok(()) => self.publish_connected(peer_id, event.identity, channel).await,
                Err(e) => tracing::warn!(error = %e, %peer_id, "dropping connection with mismatched certificate"),
            },
            Err(e) => tracing::warn!(error = %e, %peer_id, "outbound connection failed"),
        }
    }

    /// Connect to an accepter's advertised TCP port and upgrade to TLS as
    /// the client. Once the handshake completes, this device writes its
    /// own identity packet onto the now-encrypted channel so the accepter
    /// (who could not otherwise learn who just connected) can build its
    /// device entry; see spec 4.4 and the accept-side counterpart in
    /// [`ChannelService::handle_accepted`].
    async fn connect(&self, addr: SocketAddr, peer_identity: Identity) -> Result<Channel> {
        if !(PORT_RANGE_START..=PORT_RANGE_END).contains(&peer_identity.tcp_port) {
            return Err(ProtocolError::invalid_data("peer tcpPort out of range"));
        }
        let tcp = TcpStream::connect(addr).await?;
        let mut channel = Channel::from_connected(tcp, addr.ip(), &self.identity).await?;
        let local_identity = self.local_device_snapshot().to_packet();
        channel.write_packet(&local_identity).await?;
        Ok(channel)
    }

    /// Reject a connection whose presented certificate's common name does
    /// not equal the device id we believe we're talking to (spec 3: "The
    /// common name of the peer's certificate must equal `deviceId` of its
    /// identity packet; otherwise the connection is dropped.").
    fn verify_peer_cn(&self, channel: &Channel, expected_device_id: &str) -> Result<()> {
        let cn = common_name_of(channel.peer_cert_der())?;
        if cn != expected_device_id {
            return Err(ProtocolError::auth_failed(format!(
                "peer certificate CN {cn} does not match identity deviceId {expected_device_id}"
            )));
        }
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, addr)) => self.handle_accepted(tcp, addr).await,
                        Err(e) => tracing::warn!(error = %e, "TCP accept failed"),
                    }
                }
            }
        }
    }

    /// Accept a TCP connection and upgrade to TLS as the server. The
    /// connecting side writes its identity packet over the channel once
    /// the handshake completes (see [`ChannelService::connect`]); this
    /// side reads it and rejects the connection if the identity's
    /// `deviceId` doesn't match the presented certificate's CN.
    async fn handle_accepted(&self, tcp: TcpStream, addr: SocketAddr) {
        match Channel::from_accepted(tcp, &self.identity).await {
            Ok(mut channel) => match channel.read_packet().await {
                Ok(packet) => match Identity::from_packet(&packet) {
                    Ok(identity) => match self.verify_peer_cn(&channel, &identity.device_id) {
                        Ok(()) => {
                            let device_id = identity.device_id.clone();
                            self.publish_connected(device_id, identity, channel).await;
                        }
                        Err(e) => tracing::warn!(error = %e, %addr, "dropping connection with mismatched certificate"),
                    },
                    Err(e) => tracing::warn!(error = %e, %addr, "accepted connection sent no identity"),
                },
                Err(e) => tracing::warn!(error = %e, %addr, "failed to read identity packet"),
            },
            Err(e) => tracing::warn!(error = %e, %addr, "TLS accept failed"),
        }
    }

    async fn publish_connected(&self, device_id: String, identity: Identity, channel: Channel) {
        let replaced = {
            let mut active = self.active.lock().await;
            active.insert(device_id.clone(), ()).is_some()
        };
        if replaced {
            tracing::info!(%device_id, "replacing existing channel with newer connection");
            let _ = self
                .events
                .send(ChannelEvent::Disconnected {
                    device_id: device_id.clone(),
                })
                .await;
        }
        let _ = self
            .events
            .send(ChannelEvent::Connected {
                device_id,
                identity,
                channel,
            })
            .await;
    }

    /// Clear the active-connection marker for `device_id` once its
    /// connection task has actually torn down, so a later discovery
    /// broadcast from the same peer is allowed to initiate a fresh one.
    /// Does not emit a `ChannelEvent`: the device manager already knows
    /// about the disconnect (it drove the connection task that just
    /// exited); this only unblocks [`ChannelService::handle_discovery`]'s
    /// dedup check.
    pub async fn clear_active(&self, device_id: &str) {
        self.active.lock().await.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::identity::DeviceType;

    fn identity(id: &str) -> Identity {
        Identity::new(id, id, DeviceType::Desktop, 1716)
    }

    #[tokio::test]
    async fn higher_id_initiates_connection() {
        let store = Arc::new(IdentityStore::generate("bbbb").unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let bound_port = Arc::new(AtomicU16::new(1716));
        let service = ChannelService::new(store, 1716, bound_port, move || identity("bbbb"), tx);
        assert!(service.should_initiate("aaaa"));
        assert!(!service.should_initiate("cccc"));
    }

    #[tokio::test]
    async fn clear_active_unblocks_future_dedup() {
        let store = Arc::new(IdentityStore::generate("bbbb").unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let bound_port = Arc::new(AtomicU16::new(1716));
        let service = ChannelService::new(store, 1716, bound_port, move || identity("bbbb"), tx);
        service.active.lock().await.insert("aaaa".to_string(), ());
        assert!(service.active.lock().await.contains_key("aaaa"));
        service.clear_active("aaaa").await;
        assert!(!service.active.lock().await.contains_key("aaaa"));
    }
}
