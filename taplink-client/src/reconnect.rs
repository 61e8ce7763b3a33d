//! The persisted reconnect policy.
//!
//! Remembers the last successful endpoint and device across processes,
//! keeps a per-device map of advertised service endpoints, and answers
//! whether a startup auto-connect should be proposed.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use taplink_types::DeviceId;

use crate::{
    config::ConnectionConfig,
    store::{PreferenceStore, keys},
};

/// The remembered endpoint of one known device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceServiceInfo {
    /// The device this record belongs to.
    pub device_id: String,
    /// The mDNS instance name last seen for the device.
    pub service_name: String,
    /// Last advertised host.
    pub host: String,
    /// Last advertised port.
    pub port: u16,
    /// When the advertisement was seen, ms since epoch.
    pub last_seen: u64,
}

/// Typed access to the persisted reconnect snapshot.
#[derive(Clone)]
pub struct ReconnectPolicy {
    store: Arc<dyn PreferenceStore>,
}

impl ReconnectPolicy {
    /// Wraps a preference store.
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// The configuration of the last successful connection.
    pub fn last_connection_config(&self) -> Option<ConnectionConfig> {
        let raw = self.store.get(keys::LAST_CONNECTION_CONFIG)?;
        serde_json::from_str(&raw).ok()
    }

    /// The device id of the last successful connection.
    pub fn connected_device_id(&self) -> Option<DeviceId> {
        self.store.get(keys::CONNECTED_DEVICE_ID).map(DeviceId::new)
    }

    /// Whether a startup auto-connect should be proposed.
    pub fn auto_connect_enabled(&self) -> bool {
        self.store
            .get(keys::AUTO_CONNECT_ENABLED)
            .is_some_and(|value| value == "true")
    }

    /// The configuration to propose on startup, if auto-connect is on.
    pub fn startup_config(&self) -> Option<ConnectionConfig> {
        if self.auto_connect_enabled() {
            self.last_connection_config()
        } else {
            None
        }
    }

    /// Records a successful connection and re-arms auto-connect.
    pub fn remember_connection(&self, config: &ConnectionConfig, device_id: &DeviceId) {
        let serialized = serde_json::to_string(config).expect("config serializes");
        self.store.put(keys::LAST_CONNECTION_CONFIG, serialized);
        self.store
            .put(keys::CONNECTED_DEVICE_ID, device_id.to_string());
        self.store
            .put(keys::AUTO_CONNECT_ENABLED, "true".to_string());
    }

    /// Clears the auto-connect intent after a manual disconnect.
    pub fn clear_auto_connect(&self) {
        self.store
            .put(keys::AUTO_CONNECT_ENABLED, "false".to_string());
    }

    /// Records a fresh advertisement for a known device.
    pub fn remember_service(&self, device_id: &str, service_name: &str, host: &str, port: u16) {
        let info = DeviceServiceInfo {
            device_id: device_id.to_string(),
            service_name: service_name.to_string(),
            host: host.to_string(),
            port,
            last_seen: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        let serialized = serde_json::to_string(&info).expect("service info serializes");
        self.store.put(&keys::device_service_info(device_id), serialized);
    }

    /// The last remembered endpoint of a device.
    pub fn service_for(&self, device_id: &str) -> Option<DeviceServiceInfo> {
        let raw = self.store.get(&keys::device_service_info(device_id))?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPreferenceStore;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Arc::new(MemoryPreferenceStore::new()))
    }

    #[test]
    fn startup_config_requires_auto_connect() {
        let policy = policy();
        let config = ConnectionConfig::lan("192.168.1.10", 8443, false);
        assert!(policy.startup_config().is_none());

        policy.remember_connection(&config, &DeviceId::new("D-7"));
        let proposed = policy.startup_config().expect("auto-connect armed");
        assert!(proposed.is_equivalent(&config));
        assert_eq!(policy.connected_device_id(), Some(DeviceId::new("D-7")));

        policy.clear_auto_connect();
        assert!(policy.startup_config().is_none());
        // the endpoint itself stays remembered
        assert!(policy.last_connection_config().is_some());
    }

    #[test]
    fn device_service_map_round_trips() {
        let policy = policy();
        policy.remember_service("D-7", "TaproService_D-7", "10.0.0.42", 8443);
        let info = policy.service_for("D-7").expect("recorded");
        assert_eq!(info.host, "10.0.0.42");
        assert_eq!(info.port, 8443);
        assert!(info.last_seen > 0);
        assert!(policy.service_for("D-9").is_none());
    }
}
