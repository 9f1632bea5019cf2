//! The on-wire packet envelope.
//!
//! Channel traffic is line-delimited UTF-8 JSON: one JSON object per line,
//! terminated by `\n`, with no length prefix. [`Packet`] is the envelope;
//! [`Packet::to_bytes`]/[`Packet::from_bytes`] handle the framing, and
//! [`Packet::validate`] enforces the invariants below.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Minimum port of the LAN payload/TCP range.
pub const PORT_RANGE_START: u16 = 1716;
/// Maximum port of the LAN payload/TCP range.
pub const PORT_RANGE_END: u16 = 1764;

/// Default bound on a single encoded packet, before framing. Within the
/// spec's "≥512 KiB, observed up to ~8 MiB" guidance; callers that need to
/// inline larger attachments should raise this explicitly.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Transport-specific hints accompanying an out-of-band payload.
pub type PayloadTransferInfo = HashMap<String, Value>;

/// A single protocol packet.
///
/// `id`/`type`/`body` are mandatory; `payload_size`/`payload_transfer_info`
/// are present iff the packet carries an out-of-band payload (enforced by
/// [`Packet::validate`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    pub packet_type: String,

    #[serde(default = "default_body")]
    pub body: Value,

    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<PayloadTransferInfo>,
}

fn default_body() -> Value {
    Value::Object(Map::new())
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom("id must fit in i64")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| D::Error::custom("id string is not a valid integer")),
        _ => Err(D::Error::custom("id must be a number or numeric string")),
    }
}

impl Packet {
    /// Build a packet whose `id` is the current wall-clock time in
    /// milliseconds.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp_ms(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Build a packet with an explicit `id`, for tests and replay.
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Attach payload metadata for the LAN transport: `port` must fall in
    /// `PORT_RANGE_START..=PORT_RANGE_END`. `size` of `-1` means unknown
    /// length (read until EOF).
    pub fn with_payload(mut self, size: i64, port: u16) -> Self {
        let mut info = HashMap::new();
        info.insert("port".to_string(), Value::from(port));
        self.payload_size = Some(size);
        self.payload_transfer_info = Some(info);
        self
    }

    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Validate the packet against the wire invariants: non-empty `type`,
    /// object `body`, and payload fields present together or not at all,
    /// with `payloadTransferInfo.port` in range.
    pub fn validate(&self) -> Result<()> {
        if self.packet_type.is_empty() {
            return Err(ProtocolError::invalid_data("packet type must not be empty"));
        }
        if !self.body.is_object() {
            return Err(ProtocolError::invalid_data("packet body must be an object"));
        }
        match (&self.payload_size, &self.payload_transfer_info) {
            (None, None) => {}
            (Some(_), Some(info)) => {
                let port = info
                    .get("port")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| ProtocolError::invalid_data("payloadTransferInfo.port missing"))?;
                if !(PORT_RANGE_START as i64..=PORT_RANGE_END as i64).contains(&port) {
                    return Err(ProtocolError::invalid_data(format!(
                        "payloadTransferInfo.port {port} out of range {PORT_RANGE_START}-{PORT_RANGE_END}"
                    )));
                }
            }
            _ => {
                return Err(ProtocolError::invalid_data(
                    "payloadSize and payloadTransferInfo must both be present or both absent",
                ));
            }
        }
        Ok(())
    }

    /// Compact JSON encoding followed by the line delimiter.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode and validate a single packet from its JSON bytes (without the
    /// trailing delimiter, which the caller's framing has already stripped).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let packet: Packet = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::invalid_data(format!("malformed packet: {e}")))?;
        packet.validate()?;
        Ok(packet)
    }

    /// Returns the `port` from `payloadTransferInfo`, if present.
    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u16)
    }
}

pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_preserves_fields() {
        let p = Packet::with_id(42, "kdeconnect.ping", json!({"message": "hi"}));
        let bytes = p.to_bytes().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        let decoded = Packet::from_bytes(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn rejects_empty_type() {
        let p = Packet::with_id(1, "", json!({}));
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_non_object_body() {
        let mut p = Packet::with_id(1, "kdeconnect.ping", json!({}));
        p.body = json!("not an object");
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_payload_fields_presence_mismatch() {
        let mut p = Packet::with_id(1, "kdeconnect.share.request", json!({}));
        p.payload_size = Some(8);
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_payload_port_out_of_range() {
        let p = Packet::with_id(1, "kdeconnect.share.request", json!({})).with_payload(8, 80);
        let err = p.validate();
        // with_payload always writes a valid u16, construct the bad case
        // manually via body mutation to exercise the range check.
        assert!(err.is_ok());
        let mut bad = p;
        bad.payload_transfer_info
            .as_mut()
            .unwrap()
            .insert("port".to_string(), json!(1));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn accepts_stringly_id_on_decode() {
        let json_str = r#"{"id":"1700000000000","type":"kdeconnect.ping","body":{}}"#;
        let p = Packet::from_bytes(json_str.as_bytes()).unwrap();
        assert_eq!(p.id, 1700000000000);
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let json_str = r#"{"id":1,"type":"kdeconnect.ping","body":{},"extra":"ignored"}"#;
        let p = Packet::from_bytes(json_str.as_bytes()).unwrap();
        assert_eq!(p.packet_type, "kdeconnect.ping");
    }

    #[test]
    fn payload_port_accessor() {
        let p = Packet::with_id(1, "kdeconnect.share.request", json!({})).with_payload(-1, 1740);
        assert_eq!(p.payload_port(), Some(1740));
    }
}
