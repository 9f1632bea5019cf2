//! KDE Connect protocol core: LAN discovery, the TLS channel, device
//! pairing, and the plugin host.
//!
//! This crate is transport and state machine only; it has no GUI and no
//! concrete feature plugins (clipboard, sftp, sms, ...) beyond the `ping`
//! worked example. A caller wires this crate's [`Core`] into whatever
//! desktop shell or FFI surface needs it (see `DESIGN.md` for the
//! reasoning behind dropping this repo's original UniFFI bindings).

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod network;
pub mod plugins;
pub mod protocol;

pub use config::CoreConfig;
pub use crypto::{IdentityStore, TrustStore};
pub use device::manager::{DeviceManagerHandle, DeviceSummary};
pub use error::{ProtocolError, Result};
pub use network::{ChannelEvent, ChannelService};
pub use plugins::{Plugin, PluginHost};
pub use protocol::{DeviceType, Identity, Packet, PROTOCOL_VERSION};

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU16;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The running service: one [`ChannelService`] driving LAN discovery and
/// channel setup, feeding a [`device::manager::DeviceManager`] actor that
/// owns pairing state and plugin dispatch. Dropping or cancelling
/// [`Core::shutdown`] tears down every spawned task.
pub struct Core {
    identity: Arc<IdentityStore>,
    channel_service: Arc<ChannelService>,
    devices: DeviceManagerHandle,
    root_cancel: CancellationToken,
}

impl Core {
    /// Bootstrap identity, trust store, and plugin host from `config`, then
    /// start the channel service and device manager. Registers only the
    /// compiled-in `ping` plugin; use [`Core::start_with_plugins`] to add
    /// real feature plugins.
    pub async fn start(config: CoreConfig) -> Result<Self> {
        Self::start_with_plugins(config, Vec::new()).await
    }

    /// Like [`Core::start`], but with caller-supplied plugins registered
    /// alongside the built-in `ping` fixture.
    pub async fn start_with_plugins(
        config: CoreConfig,
        mut plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Self> {
        let identity = Arc::new(IdentityStore::load_or_generate_default(&config.data_dir).await?);
        let trust_store = Arc::new(TrustStore::new());

        if !config.enabled_plugins.is_empty() {
            plugins.retain(|p| config.enabled_plugins.iter().any(|id| id == p.id()));
        }
        plugins.insert(0, Arc::new(plugins::PingPlugin::default()));
        let incoming_capabilities: BTreeSet<String> = plugins
            .iter()
            .flat_map(|p| p.incoming_capabilities())
            .map(str::to_string)
            .collect();
        let outgoing_capabilities: BTreeSet<String> = plugins
            .iter()
            .flat_map(|p| p.outgoing_capabilities())
            .map(str::to_string)
            .collect();
        let plugin_host = Arc::new(PluginHost::new(plugins));

        let device_id = identity.device_id().to_string();
        let device_name = config.device_name.clone();
        let device_type = config.device_type;
        let bound_port = Arc::new(AtomicU16::new(config.tcp_port));
        let snapshot_port = bound_port.clone();
        let snapshot_incoming = incoming_capabilities.clone();
        let snapshot_outgoing = outgoing_capabilities.clone();
        let local_device = move || {
            Identity::new(
                device_id.clone(),
                device_name.clone(),
                device_type,
                snapshot_port.load(std::sync::atomic::Ordering::Acquire),
            )
            .with_incoming_capabilities(snapshot_incoming.iter().cloned())
            .with_outgoing_capabilities(snapshot_outgoing.iter().cloned())
        };

        let (events_tx, events_rx) = mpsc::channel(64);
        let channel_service = Arc::new(ChannelService::new(
            identity.clone(),
            config.tcp_port,
            bound_port,
            local_device,
            events_tx,
        ));

        let root_cancel = CancellationToken::new();
        let run_service = channel_service.clone();
        let run_cancel = root_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_service.run(run_cancel).await {
                tracing::error!(error = %e, "channel service exited");
            }
        });

        let devices = device::manager::DeviceManager::spawn(
            config.data_dir.clone(),
            trust_store,
            plugin_host,
            incoming_capabilities,
            outgoing_capabilities,
            events_rx,
            root_cancel.clone(),
            vec![channel_service.clone()],
        )
        .await?;

        Ok(Self {
            identity,
            channel_service,
            devices,
            root_cancel,
        })
    }

    /// This device's persistent id (the CN of its self-signed certificate).
    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    /// The TCP port the channel service actually bound (may differ from
    /// the configured port if it was taken).
    pub fn bound_port(&self) -> u16 {
        self.channel_service.bound_port()
    }

    /// Broadcast this device's identity immediately, outside the periodic
    /// discovery cadence.
    pub async fn identify(&self) -> Result<()> {
        self.channel_service.identify().await
    }

    /// Handle to the device manager: pairing, sending, and the observable
    /// device summary list.
    pub fn devices(&self) -> &DeviceManagerHandle {
        &self.devices
    }

    /// Cancel every spawned task (discovery, TCP accept/connect, per-device
    /// connections). Does not block for their shutdown; tasks observe the
    /// cancellation cooperatively.
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_bootstraps_identity_and_binds_a_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::new(dir.path(), "Test Desktop").with_tcp_port(17160);
        let core = Core::start(config).await.unwrap();
        assert_eq!(core.device_id().len(), 32);
        assert!(core.devices().subscribe().borrow().is_empty());
        core.shutdown();
    }

    #[tokio::test]
    async fn start_reuses_identity_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = Core::start(CoreConfig::new(dir.path(), "A").with_tcp_port(17162))
            .await
            .unwrap();
        let first_id = first.device_id().to_string();
        first.shutdown();

        let second = Core::start(CoreConfig::new(dir.path(), "A").with_tcp_port(17164))
            .await
            .unwrap();
        assert_eq!(second.device_id(), first_id);
        second.shutdown();
    }
}
