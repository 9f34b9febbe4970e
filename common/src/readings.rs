use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::params::to_int;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorData {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub value: i32,
}

/// Latest reading per reporting node, keyed by the sender's IP address.
#[derive(Debug, Default, Clone)]
pub struct SensorRegistry {
    readings: BTreeMap<String, SensorData>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sender_ip: &str, client_id: &str, value: i32) {
        log::debug!("sensor update from {sender_ip}: clientId={client_id}, value={value}");
        self.readings.insert(
            sender_ip.to_string(),
            SensorData {
                client_id: client_id.to_string(),
                value,
            },
        );
    }

    pub fn to_json(&self) -> String {
        // BTreeMap<String, _> of plain fields cannot fail to serialize.
        serde_json::to_string(&self.readings).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn all(&self) -> &BTreeMap<String, SensorData> {
        &self.readings
    }

    pub fn get(&self, sender_ip: &str) -> Option<&SensorData> {
        self.readings.get(sender_ip)
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    pub fn has_data(&self) -> bool {
        !self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReport {
    pub client_id: String,
    pub value: i32,
}

/// Reads `clientId` and `value` from decoded form or query parameters.
/// Missing fields fall back to an empty id and 0.
pub fn parse_report(params: &HashMap<String, String>) -> SensorReport {
    SensorReport {
        client_id: params.get("clientId").cloned().unwrap_or_default(),
        value: params.get("value").map(|raw| to_int(raw)).unwrap_or(0),
    }
}
