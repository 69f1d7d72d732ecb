//! OCPP configuration-key store
//!
//! An ordered sequence of `{key, value, readonly, visible, reboot}` entries.
//! Insertion order is preserved; lookups are case-sensitive by default with a
//! case-insensitive variant for the handful of keys the 1.6 spec treats that
//! way. `HeartbeatInterval` and its legacy camel-case twin
//! `HeartBeatInterval` are kept in sync as one logical key.

use fleet_messages::v16::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Well-known key names installed at station initialization
pub mod keys {
    pub const HEARTBEAT_INTERVAL: &str = "HeartbeatInterval";
    pub const HEARTBEAT_INTERVAL_LEGACY: &str = "HeartBeatInterval";
    pub const SUPPORTED_FEATURE_PROFILES: &str = "SupportedFeatureProfiles";
    pub const NUMBER_OF_CONNECTORS: &str = "NumberOfConnectors";
    pub const METER_VALUES_SAMPLED_DATA: &str = "MeterValuesSampledData";
    pub const METER_VALUE_SAMPLE_INTERVAL: &str = "MeterValueSampleInterval";
    pub const CONNECTOR_PHASE_ROTATION: &str = "ConnectorPhaseRotation";
    pub const AUTHORIZE_REMOTE_TX_REQUESTS: &str = "AuthorizeRemoteTxRequests";
    pub const CONNECTION_TIMEOUT: &str = "ConnectionTimeOut";
    pub const LOCAL_AUTH_LIST_ENABLED: &str = "LocalAuthListEnabled";
    pub const WEB_SOCKET_PING_INTERVAL: &str = "WebSocketPingInterval";
}

/// One configuration entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationKey {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub reboot: bool,
}

fn default_visible() -> bool {
    true
}

impl ConfigurationKey {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            readonly: false,
            visible: true,
            reboot: false,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn reboot_required(mut self) -> Self {
        self.reboot = true;
        self
    }
}

/// Outcome of a ChangeConfiguration-style mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKeyOutcome {
    Changed,
    /// Key exists but is read-only
    ReadOnly,
    /// Value accepted; a reboot is required for it to apply
    RebootRequired,
    /// Key is not present in the store
    Unknown,
}

/// Ordered configuration-key store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OcppConfigKeys {
    entries: Vec<ConfigurationKey>,
}

impl OcppConfigKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ConfigurationKey>) -> Self {
        let mut store = Self::new();
        for entry in entries {
            store.add(entry, false);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ConfigurationKey] {
        &self.entries
    }

    /// Case-sensitive lookup
    pub fn get(&self, key: &str) -> Option<&ConfigurationKey> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Case-insensitive lookup
    pub fn get_ignore_case(&self, key: &str) -> Option<&ConfigurationKey> {
        self.entries
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
    }

    /// Parse a key's value; `None` when absent or unparsable
    pub fn get_as<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|entry| entry.value.parse().ok())
    }

    /// Insert a key. An existing key is replaced only with `overwrite`;
    /// otherwise the insert is a logged no-op.
    pub fn add(&mut self, entry: ConfigurationKey, overwrite: bool) -> bool {
        if let Some(position) = self.entries.iter().position(|e| e.key == entry.key) {
            if overwrite {
                self.entries[position] = entry;
                return true;
            }
            debug!(key = %entry.key, "Configuration key already present, keeping existing value");
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Install a key only when absent
    pub fn add_if_absent(&mut self, entry: ConfigurationKey) {
        self.add(entry, false);
    }

    /// Mutate a key's value the way ChangeConfiguration does. Writing either
    /// heartbeat twin updates both.
    pub fn set_value(&mut self, key: &str, value: &str) -> SetKeyOutcome {
        let is_heartbeat = key == keys::HEARTBEAT_INTERVAL || key == keys::HEARTBEAT_INTERVAL_LEGACY;
        if is_heartbeat {
            let mut outcome = SetKeyOutcome::Unknown;
            for twin in [keys::HEARTBEAT_INTERVAL, keys::HEARTBEAT_INTERVAL_LEGACY] {
                match self.set_single(twin, value) {
                    SetKeyOutcome::Unknown => {}
                    other => outcome = other,
                }
            }
            return outcome;
        }
        self.set_single(key, value)
    }

    fn set_single(&mut self, key: &str, value: &str) -> SetKeyOutcome {
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            None => SetKeyOutcome::Unknown,
            Some(entry) if entry.readonly => SetKeyOutcome::ReadOnly,
            Some(entry) => {
                entry.value = value.to_string();
                if entry.reboot {
                    SetKeyOutcome::RebootRequired
                } else {
                    SetKeyOutcome::Changed
                }
            }
        }
    }

    /// Remove a key; returns the removed entry
    pub fn remove(&mut self, key: &str) -> Option<ConfigurationKey> {
        let position = self.entries.iter().position(|entry| entry.key == key)?;
        Some(self.entries.remove(position))
    }

    /// Visible entries projected onto the GetConfiguration wire shape,
    /// optionally filtered to the requested key names
    pub fn wire_entries(&self, filter: Option<&[String]>) -> (Vec<KeyValue>, Vec<String>) {
        match filter {
            None => {
                let known = self
                    .entries
                    .iter()
                    .filter(|entry| entry.visible)
                    .map(|entry| KeyValue {
                        key: entry.key.clone(),
                        readonly: entry.readonly,
                        value: Some(entry.value.clone()),
                    })
                    .collect();
                (known, Vec::new())
            }
            Some(names) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for name in names {
                    match self.get(name).filter(|entry| entry.visible) {
                        Some(entry) => known.push(KeyValue {
                            key: entry.key.clone(),
                            readonly: entry.readonly,
                            value: Some(entry.value.clone()),
                        }),
                        None => unknown.push(name.clone()),
                    }
                }
                (known, unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_defaults() -> OcppConfigKeys {
        let mut store = OcppConfigKeys::new();
        store.add_if_absent(ConfigurationKey::new(keys::HEARTBEAT_INTERVAL, "0"));
        store.add_if_absent(ConfigurationKey::new(keys::HEARTBEAT_INTERVAL_LEGACY, "0").hidden());
        store.add_if_absent(ConfigurationKey::new(keys::NUMBER_OF_CONNECTORS, "2").readonly());
        store
    }

    #[test]
    fn test_insertion_order_preserved() {
        let store = store_with_defaults();
        let order: Vec<&str> = store.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            order,
            vec![
                keys::HEARTBEAT_INTERVAL,
                keys::HEARTBEAT_INTERVAL_LEGACY,
                keys::NUMBER_OF_CONNECTORS
            ]
        );
    }

    #[test]
    fn test_add_existing_without_overwrite_is_noop() {
        let mut store = store_with_defaults();
        let added = store.add(ConfigurationKey::new(keys::HEARTBEAT_INTERVAL, "999"), false);
        assert!(!added);
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "0");

        let replaced = store.add(ConfigurationKey::new(keys::HEARTBEAT_INTERVAL, "999"), true);
        assert!(replaced);
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "999");
    }

    #[test]
    fn test_case_sensitivity() {
        let store = store_with_defaults();
        assert!(store.get("heartbeatinterval").is_none());
        assert!(store.get_ignore_case("heartbeatinterval").is_some());
    }

    #[test]
    fn test_heartbeat_twins_stay_in_sync() {
        let mut store = store_with_defaults();
        assert_eq!(
            store.set_value(keys::HEARTBEAT_INTERVAL, "30"),
            SetKeyOutcome::Changed
        );
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "30");
        assert_eq!(
            store.get(keys::HEARTBEAT_INTERVAL_LEGACY).unwrap().value,
            "30"
        );

        assert_eq!(
            store.set_value(keys::HEARTBEAT_INTERVAL_LEGACY, "45"),
            SetKeyOutcome::Changed
        );
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "45");
    }

    #[test]
    fn test_readonly_refused() {
        let mut store = store_with_defaults();
        assert_eq!(
            store.set_value(keys::NUMBER_OF_CONNECTORS, "4"),
            SetKeyOutcome::ReadOnly
        );
        assert_eq!(store.get(keys::NUMBER_OF_CONNECTORS).unwrap().value, "2");
    }

    #[test]
    fn test_unknown_key() {
        let mut store = store_with_defaults();
        assert_eq!(store.set_value("NoSuchKey", "1"), SetKeyOutcome::Unknown);
    }

    #[test]
    fn test_reboot_required() {
        let mut store = OcppConfigKeys::new();
        store.add_if_absent(
            ConfigurationKey::new("AllowOfflineTxForUnknownId", "false").reboot_required(),
        );
        assert_eq!(
            store.set_value("AllowOfflineTxForUnknownId", "true"),
            SetKeyOutcome::RebootRequired
        );
    }

    #[test]
    fn test_wire_entries_hide_invisible() {
        let store = store_with_defaults();
        let (known, unknown) = store.wire_entries(None);
        assert!(known.iter().all(|kv| kv.key != keys::HEARTBEAT_INTERVAL_LEGACY));
        assert!(unknown.is_empty());

        let (known, unknown) = store.wire_entries(Some(&[
            keys::HEARTBEAT_INTERVAL.to_string(),
            "Bogus".to_string(),
        ]));
        assert_eq!(known.len(), 1);
        assert_eq!(unknown, vec!["Bogus".to_string()]);
    }

    #[test]
    fn test_get_as() {
        let store = store_with_defaults();
        assert_eq!(store.get_as::<u64>(keys::NUMBER_OF_CONNECTORS), Some(2));
        assert_eq!(store.get_as::<u64>("NoSuchKey"), None);
    }
}
