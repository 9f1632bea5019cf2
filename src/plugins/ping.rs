//! Ping plugin: the minimal worked example of the [`Plugin`] contract.
//!
//! Handles `kdeconnect.ping` by surfacing it (spec 8 scenario 3: receive a
//! ping, show it, nothing else happens); sending one back to the peer is a
//! separate user action via `invoke_action("send")`, not an automatic
//! reply. Not a feature of the core — a fixture that exercises
//! [`PluginHost::dispatch`] against a real packet type.

use super::{Action, DeviceContext, Plugin};
use crate::error::Result;
use crate::protocol::packet::Packet;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

/// Packet type this plugin speaks, in both directions.
pub const PING_PACKET_TYPE: &str = "kdeconnect.ping";

/// Counts pings received, for tests and the worked-example action surface.
#[derive(Debug, Default)]
pub struct PingPlugin {
    received: AtomicU64,
}

impl PingPlugin {
    pub fn pings_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn id(&self) -> &'static str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<&'static str> {
        vec![PING_PACKET_TYPE]
    }

    fn outgoing_capabilities(&self) -> Vec<&'static str> {
        vec![PING_PACKET_TYPE]
    }

    fn actions(&self, ctx: &DeviceContext) -> Vec<Action> {
        if ctx.active_outgoing_types.contains(PING_PACKET_TYPE) {
            vec![Action {
                id: "send".to_string(),
                label: "Send ping".to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    async fn handle_packet(&self, ctx: &DeviceContext, packet: &Packet) -> Result<()> {
        // Surface only: a reply here would echo forever with a peer that
        // does the same (spec scenario 3 has no reply half of the round
        // trip). Sending a ping back is a user action, via `invoke_action`.
        self.received.fetch_add(1, Ordering::Relaxed);
        let message = packet
            .get_body_field::<String>("message")
            .unwrap_or_default();
        if message.is_empty() {
            tracing::info!(device_id = %ctx.device_id, "received ping");
        } else {
            tracing::info!(device_id = %ctx.device_id, %message, "received ping");
        }
        Ok(())
    }

    async fn invoke_action(&self, ctx: &DeviceContext, action_id: &str) -> Result<()> {
        if action_id == "send" {
            ctx.send(Packet::new(PING_PACKET_TYPE, json!({})), false).await
        } else {
            Ok(())
        }
    }
}
