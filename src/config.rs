//! Caller-supplied configuration for [`crate::Core`].
//!
//! The core does not mandate a configuration file format (spec 6): callers
//! parse whatever format they use (TOML, GSettings, a Cosmic/GNOME config
//! backend) into this plain struct and hand it to [`crate::Core::start`].

use crate::protocol::identity::DeviceType;
use std::path::PathBuf;

/// Data the core needs at startup: where to persist identity/device state,
/// which plugins to enable, and any LAN transport overrides.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding `certificate.pem`/`private.pem` and
    /// `devices.json`. Created on first use if it doesn't exist.
    pub data_dir: PathBuf,

    /// This device's user-facing name, advertised in identity packets.
    pub device_name: String,

    /// This device's form factor, advertised in identity packets.
    pub device_type: DeviceType,

    /// Preferred TCP listen port; the channel service falls back to later
    /// ports in `1716..=1764` if this one is taken (spec 4.4).
    pub tcp_port: u16,

    /// Plugin ids to activate. An empty list still gets the built-in
    /// `ping` fixture (see `DESIGN.md`) because it is not a concrete
    /// feature plugin but a worked example of the plugin contract; real
    /// concrete plugins (clipboard, sms, sftp, ...) are out-of-core per
    /// `spec.md` §1 and are supplied by the caller via
    /// [`crate::Core::start_with_plugins`].
    pub enabled_plugins: Vec<String>,
}

impl CoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            device_name: device_name.into(),
            device_type: DeviceType::Desktop,
            tcp_port: crate::protocol::packet::PORT_RANGE_START,
            enabled_plugins: Vec::new(),
        }
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    pub fn with_enabled_plugins(mut self, plugins: impl IntoIterator<Item = String>) -> Self {
        self.enabled_plugins = plugins.into_iter().collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = CoreConfig::new("/tmp/valent-test", "My Desktop")
            .with_device_type(DeviceType::Laptop)
            .with_tcp_port(1720)
            .with_enabled_plugins(["ping".to_string()]);
        assert_eq!(config.device_name, "My Desktop");
        assert_eq!(config.device_type, DeviceType::Laptop);
        assert_eq!(config.tcp_port, 1720);
        assert_eq!(config.enabled_plugins, vec!["ping".to_string()]);
    }

    #[test]
    fn defaults_are_reasonable() {
        let config = CoreConfig::new("/tmp/valent-test-2", "Desktop");
        assert_eq!(config.device_type, DeviceType::Desktop);
        assert_eq!(config.tcp_port, crate::protocol::packet::PORT_RANGE_START);
        assert!(config.enabled_plugins.is_empty());
    }
}
