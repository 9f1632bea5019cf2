//! The device pairing state machine and per-device capability/queue state.
//!
//! This module is deliberately free of I/O: [`Device`] tracks pairing
//! state, capability intersection, and the outbound packet queue, while
//! [`crate::device::manager::DeviceManager`] drives it from channel events
//! and actually writes to the wire. Keeping the state machine synchronous
//! makes its transition table exhaustively testable without a runtime.

pub mod manager;

use crate::protocol::identity::DeviceType;
use crate::protocol::packet::Packet;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// How long a pairing request waits for a response before expiring.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on how many packets are queued for a disconnected-but-paired
/// device before the oldest is dropped.
pub const MAX_QUEUED_PACKETS: usize = 64;

/// The pairing state machine. Transitions are driven by
/// `kdeconnect.pair` packets (`{"pair": true}` / `{"pair": false}`) and by
/// local user action (`request_pairing`, `accept_pairing`, `unpair`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    RequestedByUs,
    RequestedByPeer,
    Paired,
}

/// A known peer device: capability set, pairing state, and (while
/// disconnected) a bounded outbound queue.
#[derive(Debug)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub pair_state: PairState,
    pub peer_incoming_capabilities: BTreeSet<String>,
    pub peer_outgoing_capabilities: BTreeSet<String>,
    pair_requested_at: Option<Instant>,
    connected: bool,
    outbound_queue: VecDeque<Packet>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type,
            pair_state: PairState::Unpaired,
            peer_incoming_capabilities: BTreeSet::new(),
            peer_outgoing_capabilities: BTreeSet::new(),
            pair_requested_at: None,
            connected: false,
            outbound_queue: VecDeque::new(),
        }
    }

    pub fn update_capabilities(
        &mut self,
        incoming: BTreeSet<String>,
        outgoing: BTreeSet<String>,
    ) {
        self.peer_incoming_capabilities = incoming;
        self.peer_outgoing_capabilities = outgoing;
    }

    pub fn is_paired(&self) -> bool {
        self.pair_state == PairState::Paired
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Packet types this device will actually send us: the peer's
    /// declared outgoing capabilities intersected with what we accept.
    pub fn incoming_active_types(&self, local_incoming_capabilities: &BTreeSet<String>) -> BTreeSet<String> {
        self.peer_outgoing_capabilities
            .intersection(local_incoming_capabilities)
            .cloned()
            .collect()
    }

    /// Packet types we may send this device: our outgoing capabilities
    /// intersected with what the peer accepts.
    pub fn outgoing_active_types(&self, local_outgoing_capabilities: &BTreeSet<String>) -> BTreeSet<String> {
        self.peer_incoming_capabilities
            .intersection(local_outgoing_capabilities)
            .cloned()
            .collect()
    }

    /// We requested pairing. No-op (besides logging, left to the caller)
    /// if already paired or already requested.
    pub fn request_pairing(&mut self) {
        if self.pair_state == PairState::Unpaired {
            self.pair_state = PairState::RequestedByUs;
            self.pair_requested_at = Some(Instant::now());
        }
    }

    /// The peer sent `kdeconnect.pair` with `pair: true`.
    pub fn receive_pair_request(&mut self) {
        match self.pair_state {
            PairState::Unpaired => {
                self.pair_state = PairState::RequestedByPeer;
                self.pair_requested_at = Some(Instant::now());
            }
            PairState::RequestedByUs => {
                // Both sides requested simultaneously: accept.
                self.pair_state = PairState::Paired;
                self.pair_requested_at = None;
            }
            PairState::RequestedByPeer | PairState::Paired => {}
        }
    }

    /// The peer sent `kdeconnect.pair` with `pair: false`: reject or unpair.
    pub fn receive_pair_rejection(&mut self) {
        self.pair_state = PairState::Unpaired;
        self.pair_requested_at = None;
        self.outbound_queue.clear();
    }

    /// We accept a pairing request the peer sent us.
    pub fn accept_pairing(&mut self) -> bool {
        if self.pair_state == PairState::RequestedByPeer {
            self.pair_state = PairState::Paired;
            self.pair_requested_at = None;
            true
        } else {
            false
        }
    }

    /// Local user or the peer unpairs an already-paired device.
    pub fn unpair(&mut self) {
        self.pair_state = PairState::Unpaired;
        self.pair_requested_at = None;
        self.outbound_queue.clear();
    }

    /// True if a pending request (ours or the peer's) has outlived
    /// [`PAIR_TIMEOUT`] and should be cancelled back to `Unpaired`.
    pub fn pairing_expired(&self) -> bool {
        matches!(
            self.pair_state,
            PairState::RequestedByUs | PairState::RequestedByPeer
        ) && self
            .pair_requested_at
            .map(|t| t.elapsed() >= PAIR_TIMEOUT)
            .unwrap_or(false)
    }

    pub fn expire_pairing(&mut self) {
        if self.pairing_expired() {
            self.pair_state = PairState::Unpaired;
            self.pair_requested_at = None;
        }
    }

    /// Queue a packet for later delivery while disconnected. Dropped
    /// immediately unless `persistable` and the device is paired; the
    /// queue itself is bounded and drops the oldest entry when full.
    pub fn enqueue_outbound(&mut self, packet: Packet, persistable: bool) {
        if !persistable || !self.is_paired() {
            return;
        }
        if self.outbound_queue.len() >= MAX_QUEUED_PACKETS {
            self.outbound_queue.pop_front();
        }
        self.outbound_queue.push_back(packet);
    }

    pub fn drain_outbound(&mut self) -> Vec<Packet> {
        self.outbound_queue.drain(..).collect()
    }

    pub fn queued_len(&self) -> usize {
        self.outbound_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("dev", "Dev", DeviceType::Phone)
    }

    #[test]
    fn request_then_peer_accept_pairs() {
        let mut d = device();
        d.request_pairing();
        assert_eq!(d.pair_state, PairState::RequestedByUs);
        // Peer's acceptance arrives as a pair:true packet too.
        d.receive_pair_request();
        assert_eq!(d.pair_state, PairState::Paired);
    }

    #[test]
    fn peer_requests_then_we_accept() {
        let mut d = device();
        d.receive_pair_request();
        assert_eq!(d.pair_state, PairState::RequestedByPeer);
        assert!(d.accept_pairing());
        assert!(d.is_paired());
    }

    #[test]
    fn accept_pairing_without_request_is_rejected() {
        let mut d = device();
        assert!(!d.accept_pairing());
        assert_eq!(d.pair_state, PairState::Unpaired);
    }

    #[test]
    fn rejection_clears_pending_request_and_queue() {
        let mut d = device();
        d.request_pairing();
        d.enqueue_outbound(Packet::new("kdeconnect.ping", serde_json::json!({})), true);
        d.receive_pair_rejection();
        assert_eq!(d.pair_state, PairState::Unpaired);
    }

    #[test]
    fn unpair_resets_state_and_drops_queue() {
        let mut d = device();
        d.request_pairing();
        d.receive_pair_request();
        assert!(d.is_paired());
        d.enqueue_outbound(Packet::new("kdeconnect.ping", serde_json::json!({})), true);
        d.unpair();
        assert_eq!(d.pair_state, PairState::Unpaired);
        assert_eq!(d.queued_len(), 0);
    }

    #[test]
    fn capability_intersection_is_symmetric_and_correct() {
        let mut d = device();
        d.update_capabilities(
            ["kdeconnect.ping".to_string(), "kdeconnect.battery".to_string()]
                .into_iter()
                .collect(),
            ["kdeconnect.ping".to_string()].into_iter().collect(),
        );
        let local_incoming: BTreeSet<String> = ["kdeconnect.ping".to_string()].into_iter().collect();
        let local_outgoing: BTreeSet<String> = ["kdeconnect.ping".to_string(), "kdeconnect.battery".to_string()]
            .into_iter()
            .collect();

        assert_eq!(
            d.incoming_active_types(&local_incoming),
            ["kdeconnect.ping".to_string()].into_iter().collect()
        );
        assert_eq!(
            d.outgoing_active_types(&local_outgoing),
            ["kdeconnect.ping".to_string(), "kdeconnect.battery".to_string()]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn non_persistable_packet_is_dropped_while_disconnected() {
        let mut d = device();
        d.request_pairing();
        d.receive_pair_request();
        d.enqueue_outbound(Packet::new("kdeconnect.ping", serde_json::json!({})), false);
        assert_eq!(d.queued_len(), 0);
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let mut d = device();
        d.request_pairing();
        d.receive_pair_request();
        for i in 0..MAX_QUEUED_PACKETS + 5 {
            d.enqueue_outbound(
                Packet::with_id(i as i64, "kdeconnect.ping", serde_json::json!({})),
                true,
            );
        }
        assert_eq!(d.queued_len(), MAX_QUEUED_PACKETS);
        let drained = d.drain_outbound();
        assert_eq!(drained.first().unwrap().id, 5);
    }
}
