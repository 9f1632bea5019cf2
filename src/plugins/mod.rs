//! The device-plugin host.
//!
//! A [`Plugin`] adds packet types and user-facing actions to a paired
//! device. The host dispatches inbound packets by type, isolates plugin
//! panics and errors so one broken plugin cannot take a device offline,
//! and exposes the combined action surface as `<plugin-id>.<action-id>`.

pub mod ping;

use crate::error::Result;
use crate::protocol::packet::Packet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use ping::PingPlugin;

/// Bound on how many plugins a single host will register, mirroring the
/// fixed, compiled-in plugin set (no dynamic loading in this crate).
pub const MAX_PLUGINS: usize = 32;

/// A user-facing action a plugin exposes on a device, e.g. "ring" on the
/// find-my-phone plugin. Keyed as `<plugin_id>.<action_id>` in the
/// combined registry.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: String,
    pub label: String,
}

/// Per-device context handed to a plugin on every call: the packet types
/// it may actually use (after capability intersection) and a sender for
/// outbound packets on that device's channel.
#[derive(Clone)]
pub struct DeviceContext {
    pub device_id: String,
    pub active_outgoing_types: std::collections::BTreeSet<String>,
    outbound: tokio::sync::mpsc::Sender<(String, Packet, bool)>,
}

impl DeviceContext {
    pub fn new(
        device_id: impl Into<String>,
        active_outgoing_types: std::collections::BTreeSet<String>,
        outbound: tokio::sync::mpsc::Sender<(String, Packet, bool)>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            active_outgoing_types,
            outbound,
        }
    }

    /// Send a packet to this device, persisting it in the outbound queue
    /// if the device is currently disconnected.
    pub async fn send(&self, packet: Packet, persistable: bool) -> Result<()> {
        let _ = self
            .outbound
            .send((self.device_id.clone(), packet, persistable))
            .await;
        Ok(())
    }
}

/// The contract every device plugin implements.
///
/// `handle_packet` is called only for packet types the plugin declared in
/// [`Plugin::incoming_capabilities`] and that survived capability
/// intersection with the peer; the host still checks the type before
/// dispatch so a misbehaving peer can't invoke an undeclared handler.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identifier, used as the action-namespace prefix and in the
    /// persisted enabled-plugins list.
    fn id(&self) -> &'static str;

    /// Packet types this plugin can receive.
    fn incoming_capabilities(&self) -> Vec<&'static str>;

    /// Packet types this plugin can send.
    fn outgoing_capabilities(&self) -> Vec<&'static str>;

    /// User-facing actions this plugin exposes for a device, given that
    /// device's active outgoing types (so e.g. "ring" only appears if the
    /// peer actually accepts `kdeconnect.findmyphone.request`).
    fn actions(&self, _ctx: &DeviceContext) -> Vec<Action> {
        Vec::new()
    }

    /// Called when a device pairs (or reconnects while already paired).
    async fn activate(&self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    /// Called when a device disconnects or unpairs.
    async fn deactivate(&self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    /// Handle one inbound packet addressed to this plugin.
    async fn handle_packet(&self, ctx: &DeviceContext, packet: &Packet) -> Result<()>;

    /// Invoke a user-facing action by id (the part after the dot).
    async fn invoke_action(&self, _ctx: &DeviceContext, _action_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Owns the compiled-in plugin set and dispatches packets/actions to it.
pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
    by_packet_type: HashMap<&'static str, Vec<usize>>,
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut by_packet_type: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for (idx, plugin) in plugins.iter().enumerate() {
            for packet_type in plugin.incoming_capabilities() {
                by_packet_type.entry(packet_type).or_default().push(idx);
            }
        }
        Self { plugins, by_packet_type }
    }

    pub fn plugin_ids(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.id()).collect()
    }

    pub fn all_incoming_capabilities(&self) -> Vec<&'static str> {
        self.plugins.iter().flat_map(|p| p.incoming_capabilities()).collect()
    }

    pub fn all_outgoing_capabilities(&self) -> Vec<&'static str> {
        self.plugins.iter().flat_map(|p| p.outgoing_capabilities()).collect()
    }

    pub async fn activate_all(&self, ctx: &DeviceContext) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.activate(ctx).await {
                tracing::warn!(plugin = plugin.id(), error = %e, "plugin activate failed");
            }
        }
    }

    pub async fn deactivate_all(&self, ctx: &DeviceContext) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.deactivate(ctx).await {
                tracing::warn!(plugin = plugin.id(), error = %e, "plugin deactivate failed");
            }
        }
    }

    /// Dispatch an inbound packet to every plugin that declared its type, in
    /// registration order. Each handler runs on its own task so a panicking
    /// or erroring plugin surfaces as a log line instead of taking the
    /// device's connection task, or any other plugin's handler, down with
    /// it.
    pub async fn dispatch(&self, ctx: &DeviceContext, packet: &Packet) -> Result<()> {
        let Some(indices) = self.by_packet_type.get(packet.packet_type.as_str()) else {
            tracing::debug!(packet_type = %packet.packet_type, "no plugin registered for packet type");
            return Ok(());
        };
        for &idx in indices {
            let plugin = self.plugins[idx].clone();
            let ctx = ctx.clone();
            let packet = packet.clone();
            let handle = tokio::spawn(async move { plugin.handle_packet(&ctx, &packet).await });
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "plugin returned an error handling packet");
                }
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!("plugin panicked handling packet");
                }
                Err(_) => {}
            }
        }
        Ok(())
    }

    /// Invoke `<plugin_id>.<action_id>` for a device.
    pub async fn invoke_action(&self, ctx: &DeviceContext, qualified_action: &str) -> Result<()> {
        let (plugin_id, action_id) = qualified_action
            .split_once('.')
            .ok_or_else(|| crate::error::ProtocolError::invalid_data("malformed action id"))?;
        let plugin = self
            .plugins
            .iter()
            .find(|p| p.id() == plugin_id)
            .ok_or_else(|| crate::error::ProtocolError::NotSupported(plugin_id.to_string()))?;
        plugin.invoke_action(ctx, action_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tx: tokio::sync::mpsc::Sender<(String, Packet, bool)>) -> DeviceContext {
        DeviceContext::new("dev1", Default::default(), tx)
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_declaring_plugin() {
        let ping = Arc::new(PingPlugin::default());
        let host = PluginHost::new(vec![ping.clone()]);
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = ctx(tx);
        let packet = Packet::new("kdeconnect.ping", json!({}));
        host.dispatch(&ctx, &packet).await.unwrap();
        assert_eq!(ping.pings_received(), 1);
    }

    #[tokio::test]
    async fn dispatch_ignores_unregistered_packet_types() {
        let host = PluginHost::new(vec![Arc::new(PingPlugin::default())]);
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = ctx(tx);
        let packet = Packet::new("kdeconnect.unknown", json!({}));
        assert!(host.dispatch(&ctx, &packet).await.is_ok());
    }

    /// A second plugin sharing `PingPlugin`'s incoming packet type (spec
    /// 4.6: "fan-outs to all plugins that registered interest"). Both must
    /// see the packet, in registration order, and neither shadows the
    /// other in the index.
    struct CountingEcho {
        seen: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl Plugin for CountingEcho {
        fn id(&self) -> &'static str {
            "counting-echo"
        }

        fn incoming_capabilities(&self) -> Vec<&'static str> {
            vec!["kdeconnect.ping"]
        }

        fn outgoing_capabilities(&self) -> Vec<&'static str> {
            Vec::new()
        }

        async fn handle_packet(&self, _ctx: &DeviceContext, _packet: &Packet) -> Result<()> {
            self.seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_fans_out_to_every_plugin_registered_for_a_type() {
        let ping = Arc::new(PingPlugin::default());
        let echo = Arc::new(CountingEcho { seen: std::sync::atomic::AtomicU64::new(0) });
        let host = PluginHost::new(vec![ping.clone(), echo.clone()]);
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = ctx(tx);
        let packet = Packet::new("kdeconnect.ping", json!({}));

        host.dispatch(&ctx, &packet).await.unwrap();

        assert_eq!(ping.pings_received(), 1);
        assert_eq!(echo.seen.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
