//! Wire and domain data types shared across the connector.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A device instance as declared by a connector client (`put` handler payload).
///
/// Tag format is `key:value` — see [`crate::registry::index_tags`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDevice {
    pub iot_type: String,
    /// Unique per-user device URL, e.g. `<<MAC>>+<<local_device_id>>`.
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A service exposed by a device type ("Actuator" or "Sensor").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortService {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub url: String,
}

/// Short device type: id + its services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortDeviceType {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub services: Vec<ShortService>,
}

/// A registry-side device instance, as returned by the registry API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInstance {
    pub id: String,
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub device_type: String,
}

/// `{device, services}` join — the session's unit of reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceServiceEntity {
    pub device: DeviceInstance,
    pub services: Vec<ShortService>,
}

/// A gateway record as returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub devices: Vec<DeviceInstance>,
}

/// Committed manifest sent to `commitGateway`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRef {
    #[serde(default)]
    pub id: String,
    pub devices: Vec<String>,
    pub hash: String,
}

/// Inbound platform message delivered by the subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub device_id: String,
    #[serde(default)]
    pub service_id: Option<String>,
    pub value: Value,
}

/// Outbound normalized event, published on the event topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub value: Value,
}

/// `event` handler payload: raw device/service URIs plus the client value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub device_uri: String,
    pub service_uri: String,
    pub value: Value,
}

/// Connector/gateway/device up-down telemetry records (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLog {
    pub device: String,
    pub connected: bool,
    pub connector: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayLog {
    pub gateway: String,
    pub connected: bool,
    pub connector: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorLog {
    pub connected: bool,
    pub connector: String,
    pub time: String,
    #[serde(default)]
    pub gateways: Vec<GatewayLog>,
    #[serde(default)]
    pub devices: Vec<DeviceLog>,
}

/// A parsed inbound client frame, before being dispatched through C11.
#[derive(Debug, Clone)]
pub struct Request {
    pub handler: String,
    pub token: String,
    pub content_type: String,
    pub raw_payload: Value,
}

/// A response/command frame written back to the client.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub status: u16,
    pub handler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub content_type: String,
    pub payload: Value,
}

/// Merge tag-index maps: client overrides platform for shared keys, other
/// platform keys are preserved. See [`Request::payload`] usage sites.
#[must_use]
pub fn merge_tag_indexes(
    platform: &HashMap<String, String>,
    client: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut result = platform.clone();
    for (key, value) in client {
        result.insert(key.clone(), value.clone());
    }
    result
}

/// Parse a `key:value` tag list into an index map.
#[must_use]
pub fn index_tags(tags: &[String]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for tag in tags {
        if let Some((k, v)) = tag.split_once(':') {
            index.insert(k.to_string(), v.to_string());
        }
    }
    index
}

/// Inverse of [`index_tags`]: turn an index map back into `key:value` tags.
#[must_use]
pub fn tag_index_to_tag_list(index: &HashMap<String, String>) -> Vec<String> {
    index.iter().map(|(k, v)| format!("{k}:{v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_merge_prefers_client_values() {
        let mut platform = HashMap::new();
        platform.insert("room".to_string(), "kitchen".to_string());
        platform.insert("floor".to_string(), "1".to_string());
        let mut client = HashMap::new();
        client.insert("room".to_string(), "office".to_string());

        let merged = merge_tag_indexes(&platform, &client);
        assert_eq!(merged.get("room"), Some(&"office".to_string()));
        assert_eq!(merged.get("floor"), Some(&"1".to_string()));
    }

    #[test]
    fn index_tags_round_trips_through_tag_list() {
        let mut index = HashMap::new();
        index.insert("room".to_string(), "kitchen".to_string());
        index.insert("floor".to_string(), "1".to_string());

        let tags = tag_index_to_tag_list(&index);
        let round_tripped = index_tags(&tags);
        assert_eq!(round_tripped, index);
    }
}
