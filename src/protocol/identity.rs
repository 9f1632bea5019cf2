//! The identity packet: `kdeconnect.identity`.
//!
//! Emitted at connect time on the channel and broadcast as the UDP
//! discovery datagram. `deviceId` must equal the CN of the sender's
//! certificate; that check lives in the channel service, not here, since
//! it needs the peer certificate alongside the packet.

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::Packet;
use crate::protocol::{IDENTITY_PACKET_TYPE, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

/// Device form factor, as declared in the identity packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(DeviceType::Desktop),
            "laptop" => Ok(DeviceType::Laptop),
            "phone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            "tv" => Ok(DeviceType::Tv),
            other => Err(ProtocolError::invalid_data(format!(
                "unknown deviceType: {other}"
            ))),
        }
    }
}

/// The parsed body of an identity packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: i32,
    pub incoming_capabilities: BTreeSet<String>,
    pub outgoing_capabilities: BTreeSet<String>,
    pub tcp_port: u16,
}

impl Identity {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
            tcp_port,
        }
    }

    pub fn with_incoming_capabilities(mut self, caps: impl IntoIterator<Item = String>) -> Self {
        self.incoming_capabilities.extend(caps);
        self
    }

    pub fn with_outgoing_capabilities(mut self, caps: impl IntoIterator<Item = String>) -> Self {
        self.outgoing_capabilities.extend(caps);
        self
    }

    /// Render this identity as a `kdeconnect.identity` packet.
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            IDENTITY_PACKET_TYPE,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse and validate an identity packet's body.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(IDENTITY_PACKET_TYPE) {
            return Err(ProtocolError::invalid_data(format!(
                "expected {IDENTITY_PACKET_TYPE}, got {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::invalid_data("identity: missing deviceId"))?;
        let device_name = packet
            .get_body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::invalid_data("identity: missing deviceName"))?;
        let device_type: DeviceType = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::invalid_data("identity: missing deviceType"))?
            .parse()?;
        let tcp_port = packet
            .get_body_field::<u16>("tcpPort")
            .ok_or_else(|| ProtocolError::invalid_data("identity: missing tcpPort"))?;
        if !(super::PORT_RANGE_START..=super::PORT_RANGE_END).contains(&tcp_port) {
            return Err(ProtocolError::invalid_data(format!(
                "identity: tcpPort {tcp_port} out of range"
            )));
        }

        let mut protocol_version = packet
            .get_body_field::<i32>("protocolVersion")
            .unwrap_or(PROTOCOL_VERSION);
        if protocol_version < PROTOCOL_VERSION {
            return Err(ProtocolError::invalid_data(format!(
                "protocolVersion {protocol_version} is older than the minimum supported {PROTOCOL_VERSION}"
            )));
        }
        if protocol_version > PROTOCOL_VERSION {
            tracing::info!(
                peer_version = protocol_version,
                "peer advertises a newer protocol version; treating as {PROTOCOL_VERSION}"
            );
            protocol_version = PROTOCOL_VERSION;
        }

        let incoming_capabilities = packet
            .get_body_field::<BTreeSet<String>>("incomingCapabilities")
            .unwrap_or_default();
        let outgoing_capabilities = packet
            .get_body_field::<BTreeSet<String>>("outgoingCapabilities")
            .unwrap_or_default();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_packet() {
        let id = Identity::new("aaaa", "My Phone", DeviceType::Phone, 1716)
            .with_incoming_capabilities(["kdeconnect.ping".to_string()])
            .with_outgoing_capabilities(["kdeconnect.ping".to_string()]);
        let packet = id.to_packet();
        let parsed = Identity::from_packet(&packet).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_wrong_packet_type() {
        let p = Packet::new("kdeconnect.ping", json!({}));
        assert!(Identity::from_packet(&p).is_err());
    }

    #[test]
    fn rejects_port_out_of_range() {
        let p = Packet::new(
            IDENTITY_PACKET_TYPE,
            json!({
                "deviceId": "x", "deviceName": "x", "deviceType": "phone",
                "protocolVersion": 7, "incomingCapabilities": [], "outgoingCapabilities": [],
                "tcpPort": 80,
            }),
        );
        assert!(Identity::from_packet(&p).is_err());
    }

    #[test]
    fn rejects_protocol_version_below_minimum() {
        let p = Packet::new(
            IDENTITY_PACKET_TYPE,
            json!({
                "deviceId": "x", "deviceName": "x", "deviceType": "phone",
                "protocolVersion": 6, "incomingCapabilities": [], "outgoingCapabilities": [],
                "tcpPort": 1716,
            }),
        );
        assert!(Identity::from_packet(&p).is_err());
    }

    #[test]
    fn clamps_newer_protocol_version_to_current() {
        let p = Packet::new(
            IDENTITY_PACKET_TYPE,
            json!({
                "deviceId": "x", "deviceName": "x", "deviceType": "phone",
                "protocolVersion": 9, "incomingCapabilities": [], "outgoingCapabilities": [],
                "tcpPort": 1716,
            }),
        );
        let parsed = Identity::from_packet(&p).unwrap();
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }
}
