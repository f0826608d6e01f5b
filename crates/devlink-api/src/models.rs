// Wire records exchanged with the cloud service and the LAN link.
//
// The cloud wraps most objects in a single-key envelope
// (`{"device": {...}}`, `{"property": {...}}`, `{"datapoint": {...}}`).
// The wrappers are stripped inside this crate; callers only see records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form key/value metadata attached to properties and datapoints.
pub type Metadata = BTreeMap<String, String>;

/// One device registered to the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub dsn: String,
    #[serde(default)]
    pub key: Option<u64>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub oem_model: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub lan_ip: Option<String>,
    /// Whether the device supports LAN mode at all.
    #[serde(default)]
    pub lan_enabled: bool,
    /// "Online" / "Offline" as reported by the service.
    #[serde(default)]
    pub connection_status: Option<String>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sw_version: Option<String>,
}

/// Latest value of one named property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub name: String,
    /// One of `boolean`, `integer`, `decimal`, `string` (others are ignored by the core).
    pub base_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Timestamp of the datapoint that produced `value`. LAN readings
    /// usually omit it.
    #[serde(default)]
    pub data_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// `input` (to device, writable) or `output` (from device, read-only).
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub ack_enabled: bool,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// A datapoint as echoed back by the transport after a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapointRecord {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub echo: bool,
}

/// Body of a datapoint write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDatapoint {
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// LAN session parameters published by the cloud for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanConfigRecord {
    #[serde(default)]
    pub lanip_key_id: Option<i64>,
    #[serde(default)]
    pub lanip_key: Option<String>,
    /// Seconds between keep-alives the device expects.
    #[serde(default)]
    pub keep_alive: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl LanConfigRecord {
    /// A config without a key cannot be used for a handshake.
    pub fn is_usable(&self) -> bool {
        self.lanip_key_id.is_some()
            && self.lanip_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.status.as_deref().is_none_or(|s| s.eq_ignore_ascii_case("enable"))
    }
}

// ── Envelopes ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct DeviceEnvelope {
    pub device: DeviceRecord,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PropertyEnvelope {
    pub property: PropertyRecord,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DatapointEnvelope<T> {
    pub datapoint: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LanConfigEnvelope {
    pub lanip: LanConfigRecord,
}
