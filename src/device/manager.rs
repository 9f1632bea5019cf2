//! Aggregates channel services, the persisted device cache, and the
//! pairing/connection state of every known device, serialized through a
//! single actor task so two channel events can never race each other's
//! mutation of the same device.
//!
//! Each connected device gets its own connection task (grounded in
//! `kdeconnect-protocol::connection::manager::ConnectionManager`'s
//! per-connection task + command-channel pattern): it owns the [`Channel`]
//! exclusively, multiplexing inbound reads and outbound writes with
//! `tokio::select!` so a stalled peer on one device can never block
//! another device's traffic or the actor's own command queue.

use crate::crypto::TrustStore;
use crate::device::{Device, PairState};
use crate::error::{ProtocolError, Result};
use crate::network::channel_service::ChannelService;
use crate::network::{Channel, ChannelEvent};
use crate::plugins::{DeviceContext, PluginHost};
use crate::protocol::identity::DeviceType;
use crate::protocol::packet::Packet;
use crate::protocol::{Identity, PAIR_PACKET_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const CACHE_FILE: &str = "devices.json";

/// The persisted subset of a device's state. Certificates are stored as
/// PEM so the cache file stays diffable and human-readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(rename = "incomingCapabilities")]
    pub incoming_capabilities: BTreeSet<String>,
    #[serde(rename = "outgoingCapabilities")]
    pub outgoing_capabilities: BTreeSet<String>,
    #[serde(rename = "peerCertificatePem", skip_serializing_if = "Option::is_none")]
    pub peer_certificate_pem: Option<String>,
    pub paired: bool,
}

/// A read-only snapshot of a device, for observers (UI, FFI, tests).
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub paired: bool,
    pub connected: bool,
}

/// A live connection's outbound half: send a packet to have the
/// connection task write it, or cancel the token to tear it down.
struct ConnectionHandle {
    write_tx: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    peer_cert_der: Vec<u8>,
}

struct DeviceEntry {
    device: Device,
    connection: Option<ConnectionHandle>,
    peer_cert_der: Option<Vec<u8>>,
    ctx: Option<DeviceContext>,
}

enum Command {
    RequestPairing { device_id: String, reply: oneshot::Sender<Result<()>> },
    AcceptPairing { device_id: String, reply: oneshot::Sender<Result<()>> },
    RejectPairing { device_id: String, reply: oneshot::Sender<Result<()>> },
    Unpair { device_id: String, reply: oneshot::Sender<Result<()>> },
    Send { device_id: String, packet: Packet, persistable: bool, reply: oneshot::Sender<Result<()>> },
    /// A packet read off a device's connection task. No reply: the read
    /// loop does not wait on dispatch.
    Inbound { device_id: String, packet: Packet },
    /// A connection task exited (peer closed, read/write error).
    ConnectionClosed { device_id: String },
}

/// A handle to the running device manager actor. Cloning is cheap; every
/// clone shares the same underlying task.
#[derive(Clone)]
pub struct DeviceManagerHandle {
    commands: mpsc::Sender<Command>,
    summaries: watch::Receiver<Vec<DeviceSummary>>,
}

impl DeviceManagerHandle {
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceSummary>> {
        self.summaries.clone()
    }

    pub async fn request_pairing(&self, device_id: impl Into<String>) -> Result<()> {
        self.call(|reply| Command::RequestPairing { device_id: device_id.into(), reply }).await
    }

    pub async fn accept_pairing(&self, device_id: impl Into<String>) -> Result<()> {
        self.call(|reply| Command::AcceptPairing { device_id: device_id.into(), reply }).await
    }

    pub async fn reject_pairing(&self, device_id: impl Into<String>) -> Result<()> {
        self.call(|reply| Command::RejectPairing { device_id: device_id.into(), reply }).await
    }

    pub async fn unpair(&self, device_id: impl Into<String>) -> Result<()> {
        self.call(|reply| Command::Unpair { device_id: device_id.into(), reply }).await
    }

    pub async fn send(&self, device_id: impl Into<String>, packet: Packet, persistable: bool) -> Result<()> {
        let device_id = device_id.into();
        self.call(|reply| Command::Send { device_id, packet, persistable, reply }).await
    }

    async fn call(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ProtocolError::Closed)?;
        rx.await.map_err(|_| ProtocolError::Closed)?
    }
}

/// Owns every known device and persists their cacheable state to
/// `devices.json` under the data directory.
pub struct DeviceManager {
    devices: HashMap<String, DeviceEntry>,
    local_incoming_capabilities: BTreeSet<String>,
    local_outgoing_capabilities: BTreeSet<String>,
    trust_store: Arc<TrustStore>,
    plugin_host: Arc<PluginHost>,
    data_dir: PathBuf,
    summaries_tx: watch::Sender<Vec<DeviceSummary>>,
    root_cancel: CancellationToken,
    /// Every channel service feeding this manager's `channel_events`, kept
    /// around purely so a connection's teardown can clear that service's
    /// dedup marker (spec 4.4's "duplicate connections" bookkeeping lives
    /// in the service; the manager is what actually learns a connection
    /// died).
    channel_services: Vec<Arc<ChannelService>>,
}

impl DeviceManager {
    /// Load the persisted cache (if any) and spawn the actor task. Returns
    /// a cheaply-clonable handle and the event feed the caller should pump
    /// channel events from.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        data_dir: PathBuf,
        trust_store: Arc<TrustStore>,
        plugin_host: Arc<PluginHost>,
        local_incoming_capabilities: BTreeSet<String>,
        local_outgoing_capabilities: BTreeSet<String>,
        mut channel_events: mpsc::Receiver<ChannelEvent>,
        root_cancel: CancellationToken,
        channel_services: Vec<Arc<ChannelService>>,
    ) -> Result<DeviceManagerHandle> {
        let records = load_cache(&data_dir).await.unwrap_or_default();
        let devices = device_entries_from_records(records, &trust_store);

        let (summaries_tx, summaries_rx) = watch::channel(Vec::new());
        let (commands_tx, mut commands_rx) = mpsc::channel(64);

        // Plugins emit outbound packets through a `DeviceContext`, which
        // forwards them here so the actor can route to the right
        // connection without plugins ever touching a `Channel` directly.
        let (plugin_outbound_tx, mut plugin_outbound_rx) = mpsc::channel::<(String, Packet, bool)>(128);
        let forward_commands_tx = commands_tx.clone();
        tokio::spawn(async move {
            while let Some((device_id, packet, persistable)) = plugin_outbound_rx.recv().await {
                let (reply_tx, _reply_rx) = oneshot::channel();
                let _ = forward_commands_tx
                    .send(Command::Send { device_id, packet, persistable, reply: reply_tx })
                    .await;
            }
        });

        let mut manager = Self {
            devices,
            local_incoming_capabilities,
            local_outgoing_capabilities,
            trust_store,
            plugin_host,
            data_dir,
            summaries_tx,
            root_cancel,
            channel_services,
        };
        manager.publish_summaries();

        tokio::spawn(async move {
            let mut pairing_sweep = tokio::time::interval(Duration::from_secs(5));
            pairing_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = channel_events.recv() => {
                        match event {
                            Some(event) => manager.on_channel_event(event, &commands_tx, &plugin_outbound_tx).await,
                            None => break,
                        }
                    }
                    cmd = commands_rx.recv() => {
                        match cmd {
                            Some(cmd) => manager.on_command(cmd).await,
                            None => break,
                        }
                    }
                    _ = pairing_sweep.tick() => {
                        manager.expire_pending_pairings();
                    }
                }
            }
        });

        Ok(DeviceManagerHandle { commands: commands_tx, summaries: summaries_rx })
    }

    async fn on_channel_event(
        &mut self,
        event: ChannelEvent,
        commands_tx: &mpsc::Sender<Command>,
        plugin_outbound_tx: &mpsc::Sender<(String, Packet, bool)>,
    ) {
        match event {
            ChannelEvent::Connected { device_id, identity, channel } => {
                self.on_connected(device_id, identity, channel, commands_tx, plugin_outbound_tx)
                    .await;
            }
            ChannelEvent::Disconnected { device_id } => {
                self.on_disconnected(&device_id).await;
            }
        }
    }

    async fn on_connected(
        &mut self,
        device_id: String,
        identity: Identity,
        channel: Channel,
        commands_tx: &mpsc::Sender<Command>,
        plugin_outbound_tx: &mpsc::Sender<(String, Packet, bool)>,
    ) {
        if let Some(pinned) = self.trust_store.verify(&device_id, channel.peer_cert_der()) {
            if !pinned {
                tracing::warn!(%device_id, "peer certificate does not match pin, refusing channel");
                let _ = channel.close().await;
                return;
            }
        }

        // Replace any existing connection for this device: the new one
        // wins (spec 4.4 "duplicate connections").
        if let Some(entry) = self.devices.get_mut(&device_id) {
            if let Some(old) = entry.connection.take() {
                old.cancel.cancel();
            }
        }

        let peer_cert_der = channel.peer_cert_der().to_vec();
        let entry = self.devices.entry(device_id.clone()).or_insert_with(|| DeviceEntry {
            device: Device::new(&device_id, &identity.device_name, identity.device_type),
            connection: None,
            peer_cert_der: None,
            ctx: None,
        });
        entry.device.name = identity.device_name.clone();
        entry
            .device
            .update_capabilities(identity.incoming_capabilities, identity.outgoing_capabilities);
        entry.device.set_connected(true);
        entry.peer_cert_der = Some(peer_cert_der.clone());

        let (write_tx, write_rx) = mpsc::channel::<Packet>(32);
        let cancel = self.root_cancel.child_token();
        let task_cancel = cancel.clone();
        let commands_tx = commands_tx.clone();
        let task_device_id = device_id.clone();
        tokio::spawn(async move {
            run_connection(task_device_id, channel, write_rx, commands_tx, task_cancel).await;
        });
        entry.connection = Some(ConnectionHandle {
            write_tx: write_tx.clone(),
            cancel,
            peer_cert_der,
        });

        let active_outgoing_types = entry
            .device
            .outgoing_active_types(&self.local_outgoing_capabilities);
        let ctx = DeviceContext::new(device_id.clone(), active_outgoing_types, plugin_outbound_tx.clone());
        self.plugin_host.activate_all(&ctx).await;
        entry.ctx = Some(ctx);

        let queued = entry.device.drain_outbound();
        for packet in queued {
            let _ = write_tx.send(packet).await;
        }

        self.publish_summaries();
        self.persist().await;
    }

    async fn on_disconnected(&mut self, device_id: &str) {
        let Some(entry) = self.devices.get_mut(device_id) else { return };
        if let Some(conn) = entry.connection.take() {
            conn.cancel.cancel();
        }
        entry.device.set_connected(false);
        if let Some(ctx) = entry.ctx.take() {
            self.plugin_host.deactivate_all(&ctx).await;
        }

        if !entry.device.is_paired() {
            tracing::info!(%device_id, "unpaired device disconnected, removing");
            self.devices.remove(device_id);
        }
        for service in &self.channel_services {
            service.clear_active(device_id).await;
        }
        self.publish_summaries();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::RequestPairing { device_id, reply } => {
                let result = self.request_pairing(&device_id).await;
                let _ = reply.send(result);
            }
            Command::AcceptPairing { device_id, reply } => {
                let result = self.accept_pairing(&device_id).await;
                let _ = reply.send(result);
            }
            Command::RejectPairing { device_id, reply } => {
                let result = self.reject_pairing(&device_id).await;
                let _ = reply.send(result);
            }
            Command::Unpair { device_id, reply } => {
                let result = self.unpair(&device_id).await;
                let _ = reply.send(result);
            }
            Command::Send { device_id, packet, persistable, reply } => {
                let result = self.send(&device_id, packet, persistable).await;
                let _ = reply.send(result);
            }
            Command::Inbound { device_id, packet } => {
                self.on_inbound(&device_id, packet).await;
            }
            Command::ConnectionClosed { device_id } => {
                self.on_disconnected(&device_id).await;
            }
        }
    }

    /// Route one packet read off a device's connection: pairing packets
    /// drive the pair state machine directly; everything else is dropped
    /// unless its type survived capability intersection, in which case it
    /// is dispatched to the plugin host.
    async fn on_inbound(&mut self, device_id: &str, packet: Packet) {
        if packet.is_type(PAIR_PACKET_TYPE) {
            if let Err(e) = self.handle_pair_packet(device_id, &packet).await {
                tracing::warn!(%device_id, error = %e, "failed to handle pair packet");
            }
            return;
        }

        let Some(entry) = self.devices.get(device_id) else { return };
        let active_incoming = entry.device.incoming_active_types(&self.local_incoming_capabilities);
        if !active_incoming.contains(packet.packet_type.as_str()) {
            tracing::debug!(%device_id, packet_type = %packet.packet_type, "dropping packet outside active capability set");
            return;
        }
        let Some(ctx) = entry.ctx.clone() else { return };
        if let Err(e) = self.plugin_host.dispatch(&ctx, &packet).await {
            tracing::warn!(%device_id, error = %e, "plugin dispatch failed");
        }
    }

    async fn request_pairing(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        entry.device.request_pairing();
        if let Some(conn) = entry.connection.as_ref() {
            if let Some(der) = entry.peer_cert_der.clone() {
                self.trust_store.pin(device_id, der);
            }
            let packet = Packet::new(PAIR_PACKET_TYPE, serde_json::json!({"pair": true}));
            conn.write_tx.send(packet).await.map_err(|_| ProtocolError::Closed)?;
        }
        self.publish_summaries();
        Ok(())
    }

    async fn accept_pairing(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        if !entry.device.accept_pairing() {
            return Err(ProtocolError::invalid_data("no pending pairing request"));
        }
        if let Some(der) = entry.peer_cert_der.clone() {
            self.trust_store.pin(device_id, der);
        }
        if let Some(conn) = entry.connection.as_ref() {
            let packet = Packet::new(PAIR_PACKET_TYPE, serde_json::json!({"pair": true}));
            conn.write_tx.send(packet).await.map_err(|_| ProtocolError::Closed)?;
        }
        self.publish_summaries();
        self.persist().await;
        Ok(())
    }

    async fn reject_pairing(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        entry.device.receive_pair_rejection();
        if let Some(conn) = entry.connection.as_ref() {
            let packet = Packet::new(PAIR_PACKET_TYPE, serde_json::json!({"pair": false}));
            conn.write_tx.send(packet).await.map_err(|_| ProtocolError::Closed)?;
        }
        self.trust_store.unpin(device_id);
        self.publish_summaries();
        Ok(())
    }

    async fn unpair(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        entry.device.unpair();
        if let Some(conn) = entry.connection.as_ref() {
            let packet = Packet::new(PAIR_PACKET_TYPE, serde_json::json!({"pair": false}));
            conn.write_tx.send(packet).await.map_err(|_| ProtocolError::Closed)?;
        }
        self.trust_store.unpin(device_id);
        self.publish_summaries();
        self.persist().await;
        Ok(())
    }

    /// Drive the pair state machine from a `kdeconnect.pair` packet.
    async fn handle_pair_packet(&mut self, device_id: &str, packet: &Packet) -> Result<()> {
        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::invalid_data("kdeconnect.pair missing 'pair' field"))?;
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        if pair {
            entry.device.receive_pair_request();
            if entry.device.is_paired() {
                if let Some(der) = entry.peer_cert_der.clone() {
                    self.trust_store.pin(device_id, der);
                }
                self.persist().await;
            }
        } else {
            entry.device.receive_pair_rejection();
            self.trust_store.unpin(device_id);
        }
        self.publish_summaries();
        Ok(())
    }

    async fn send(&mut self, device_id: &str, packet: Packet, persistable: bool) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        if !entry.device.is_paired() {
            return Err(ProtocolError::NotPaired(device_id.to_string()));
        }
        match entry.connection.as_ref() {
            Some(conn) => conn.write_tx.send(packet).await.map_err(|_| ProtocolError::Closed),
            None => {
                entry.device.enqueue_outbound(packet, persistable);
                Ok(())
            }
        }
    }

    /// Revert any pairing request (ours or the peer's) that has outlived
    /// [`crate::device::PAIR_TIMEOUT`] back to `Unpaired` (spec 4.5:
    /// "RequestedByUs/RequestedByPeer, timeout -> Unpaired").
    fn expire_pending_pairings(&mut self) {
        let mut changed = false;
        for entry in self.devices.values_mut() {
            if entry.device.pairing_expired() {
                entry.device.expire_pairing();
                changed = true;
            }
        }
        if changed {
            self.publish_summaries();
        }
    }

    fn publish_summaries(&self) {
        let summaries = self
            .devices
            .values()
            .map(|e| DeviceSummary {
                id: e.device.id.clone(),
                name: e.device.name.clone(),
                device_type: e.device.device_type,
                paired: e.device.is_paired(),
                connected: e.device.is_connected(),
            })
            .collect();
        let _ = self.summaries_tx.send(summaries);
    }

    async fn persist(&self) {
        let records: Vec<DeviceRecord> = self
            .devices
            .values()
            .filter(|e| e.device.is_paired())
            .map(|e| DeviceRecord {
                id: e.device.id.clone(),
                name: e.device.name.clone(),
                device_type: e.device.device_type,
                incoming_capabilities: e.device.peer_incoming_capabilities.clone(),
                outgoing_capabilities: e.device.peer_outgoing_capabilities.clone(),
                peer_certificate_pem: e.peer_cert_der.as_ref().map(|der| {
                    pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()))
                }),
                paired: true,
            })
            .collect();

        if let Err(e) = save_cache(&self.data_dir, &records).await {
            tracing::warn!(error = %e, "failed to persist device cache");
        }
    }
}

/// The per-connection task: owns the [`Channel`] exclusively and
/// multiplexes inbound reads with outbound writes queued on `write_rx`, so
/// neither direction can starve the other and a stalled peer on this
/// device never blocks any other device's task.
async fn run_connection(
    device_id: String,
    mut channel: Channel,
    mut write_rx: mpsc::Receiver<Packet>,
    commands_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = write_rx.recv() => {
                match outbound {
                    Some(packet) => {
                        if let Err(e) = channel.write_packet(&packet).await {
                            tracing::warn!(%device_id, error = %e, "write failed, closing connection");
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = channel.read_packet() => {
                match inbound {
                    Ok(packet) => {
                        if commands_tx.send(Command::Inbound { device_id: device_id.clone(), packet }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::info!(%device_id, error = %e, "connection closed");
                        break;
                    }
                }
            }
        }
    }
    let _ = channel.close().await;
    let _ = commands_tx.send(Command::ConnectionClosed { device_id }).await;
}

/// Rebuild the in-memory device table from the persisted cache, restoring
/// pair state, both capability sets, and any pinned peer certificate (spec
/// 4.7 Startup, spec 8's deserialize-then-equivalent round-trip law).
fn device_entries_from_records(
    records: Vec<DeviceRecord>,
    trust_store: &TrustStore,
) -> HashMap<String, DeviceEntry> {
    let mut devices = HashMap::new();
    for record in records {
        let mut device = Device::new(&record.id, &record.name, record.device_type);
        if record.paired {
            device.pair_state = PairState::Paired;
        }
        device.update_capabilities(record.incoming_capabilities.clone(), record.outgoing_capabilities.clone());
        if let Some(pem) = &record.peer_certificate_pem {
            if let Ok(parsed) = pem::parse(pem) {
                let der = parsed.into_contents();
                trust_store.pin(&record.id, der.clone());
                devices.insert(
                    record.id.clone(),
                    DeviceEntry { device, connection: None, peer_cert_der: Some(der), ctx: None },
                );
                continue;
            }
        }
        devices.insert(
            record.id.clone(),
            DeviceEntry { device, connection: None, peer_cert_der: None, ctx: None },
        );
    }
    devices
}

async fn load_cache(dir: &Path) -> Result<Vec<DeviceRecord>> {
    let path = dir.join(CACHE_FILE);
    let data = fs::read(&path).await?;
    Ok(serde_json::from_slice(&data)?)
}

async fn save_cache(dir: &Path, records: &[DeviceRecord]) -> Result<()> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(CACHE_FILE);
    let data = serde_json::to_vec_pretty(records)?;
    fs::write(path, data).await?;
    Ok(())
}
