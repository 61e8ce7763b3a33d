//! Persisted key/value preferences.
//!
//! The SDK persists a small snapshot between processes: the last successful
//! connection, the connected device id, the auto-connect intent, per-device
//! service endpoints and the detected cable protocol. The storage backend
//! is pluggable; the file-backed implementation keeps everything in one
//! JSON document.

use std::{collections::HashMap, path::PathBuf};

use parking_lot::Mutex;

/// Well-known preference keys.
pub mod keys {
    /// Serialized [`ConnectionConfig`](crate::config::ConnectionConfig) of
    /// the last successful connection.
    pub const LAST_CONNECTION_CONFIG: &str = "last_connection_config";
    /// The device id of the last successful connection.
    pub const CONNECTED_DEVICE_ID: &str = "connected_device_id";
    /// Whether the SDK should reconnect on startup.
    pub const AUTO_CONNECT_ENABLED: &str = "auto_connect_enabled";
    /// The detected cable protocol.
    pub const DETECTED_CABLE_PROTOCOL: &str = "detected_cable_protocol";
    /// When the cable protocol was detected, ms since epoch.
    pub const DETECTED_CABLE_PROTOCOL_AT: &str = "detected_cable_protocol_at";

    /// Per-device service endpoint records.
    pub fn device_service_info(device_id: &str) -> String {
        format!("device_service_info_{device_id}")
    }
}

/// String key/value storage.
pub trait PreferenceStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;
    /// Writes a value.
    fn put(&self, key: &str, value: String);
    /// Deletes a value.
    fn remove(&self, key: &str);
}

/// In-memory store, for tests and hosts that manage persistence themselves.
#[derive(Default)]
pub struct MemoryPreferenceStore(Mutex<HashMap<String, String>>);

impl MemoryPreferenceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.0.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.0.lock().remove(key);
    }
}

/// Store backed by a single JSON file.
///
/// Writes are flushed synchronously; the snapshot is small and changes only
/// on connection lifecycle events.
pub struct FilePreferenceStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FilePreferenceStore {
    /// Opens the store, loading the existing snapshot if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let cache = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn flush(&self, cache: &HashMap<String, String>) {
        let bytes = serde_json::to_vec_pretty(cache).expect("string map serializes");
        if let Err(err) = std::fs::write(&self.path, bytes) {
            tracing::warn!("cannot persist preferences to {}: {err}", self.path.display());
        }
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        let mut cache = self.cache.lock();
        cache.insert(key.to_string(), value);
        self.flush(&cache);
    }

    fn remove(&self, key: &str) {
        let mut cache = self.cache.lock();
        if cache.remove(key).is_some() {
            self.flush(&cache);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn file_store_round_trips_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        {
            let store = FilePreferenceStore::open(&path).unwrap();
            store.put(keys::CONNECTED_DEVICE_ID, "D-7".to_string());
            store.put(keys::AUTO_CONNECT_ENABLED, "true".to_string());
            store.remove(keys::AUTO_CONNECT_ENABLED);
        }
        let reopened = FilePreferenceStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(keys::CONNECTED_DEVICE_ID).as_deref(),
            Some("D-7")
        );
        assert_eq!(reopened.get(keys::AUTO_CONNECT_ENABLED), None);
    }

    #[test]
    fn device_service_info_keys_are_per_device() {
        assert_eq!(
            keys::device_service_info("D-7"),
            "device_service_info_D-7"
        );
    }
}
