// ── Persistence ──
//
// One flat JSON document holds everything the fleet remembers between runs:
// per-hardware connection configs, per-device user settings, port aliases,
// and the received-message log. Supervisors hold the store as a trait object
// so tests can substitute an in-memory implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{DeviceConfig, UserConfig};
use crate::error::CoreError;
use crate::model::{IncomingMessage, UsbLocationId};

/// Everything the fleet persists.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Stored connection config for a hardware model (USB vendor/product).
    async fn device_config(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<DeviceConfig>, CoreError>;

    /// Remember the config a hardware model connected with.
    async fn save_device_config(
        &self,
        vendor_id: u16,
        product_id: u16,
        config: DeviceConfig,
    ) -> Result<(), CoreError>;

    /// Per-device user overrides, keyed by equipment identity (IMEI).
    async fn user_config(&self, imei: &str) -> Result<Option<UserConfig>, CoreError>;

    /// Operator-assigned display name for a USB location.
    async fn port_alias(&self, location: &UsbLocationId) -> Result<Option<String>, CoreError>;

    /// Append a reassembled message to the log.
    async fn save_message(&self, message: &IncomingMessage) -> Result<(), CoreError>;
}

fn hardware_key(vendor_id: u16, product_id: u16) -> String {
    format!("{vendor_id:04x}:{product_id:04x}")
}

// ── Document shape ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    device_configs: HashMap<String, DeviceConfig>,
    #[serde(default)]
    user_configs: HashMap<String, UserConfig>,
    #[serde(default)]
    port_aliases: HashMap<String, String>,
    #[serde(default)]
    messages: Vec<IncomingMessage>,
}

// ── JSON file store ──────────────────────────────────────────────────

/// File-backed store: the whole document is rewritten on every mutation.
/// Fine for fleet-sized data; not a database.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonStore {
    /// Open (or initialize) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(CoreError::store)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(CoreError::store(e)),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    async fn persist(&self) -> Result<(), CoreError> {
        let snapshot = self
            .data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?
            .clone();
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(CoreError::store)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(CoreError::store)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T, CoreError> {
        let data = self
            .data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?;
        Ok(f(&data))
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T, CoreError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?;
        Ok(f(&mut data))
    }
}

#[async_trait]
impl FleetStore for JsonStore {
    async fn device_config(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<DeviceConfig>, CoreError> {
        self.read(|d| {
            d.device_configs
                .get(&hardware_key(vendor_id, product_id))
                .copied()
        })
    }

    async fn save_device_config(
        &self,
        vendor_id: u16,
        product_id: u16,
        config: DeviceConfig,
    ) -> Result<(), CoreError> {
        self.write(|d| {
            d.device_configs
                .insert(hardware_key(vendor_id, product_id), config);
        })?;
        self.persist().await
    }

    async fn user_config(&self, imei: &str) -> Result<Option<UserConfig>, CoreError> {
        self.read(|d| d.user_configs.get(imei).cloned())
    }

    async fn port_alias(&self, location: &UsbLocationId) -> Result<Option<String>, CoreError> {
        self.read(|d| d.port_aliases.get(location.as_str()).cloned())
    }

    async fn save_message(&self, message: &IncomingMessage) -> Result<(), CoreError> {
        self.write(|d| d.messages.push(message.clone()))?;
        self.persist().await
    }
}

// ── In-memory store ──────────────────────────────────────────────────

/// Volatile store for tests and ad-hoc runs.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a per-device user config (test setup).
    pub fn insert_user_config(&self, imei: impl Into<String>, config: UserConfig) {
        if let Ok(mut data) = self.data.lock() {
            data.user_configs.insert(imei.into(), config);
        }
    }

    /// Seed a per-hardware config (test setup).
    pub fn insert_device_config(&self, vendor_id: u16, product_id: u16, config: DeviceConfig) {
        if let Ok(mut data) = self.data.lock() {
            data.device_configs
                .insert(hardware_key(vendor_id, product_id), config);
        }
    }

    /// Seed a port alias (test setup).
    pub fn insert_port_alias(&self, location: &UsbLocationId, alias: impl Into<String>) {
        if let Ok(mut data) = self.data.lock() {
            data.port_aliases
                .insert(location.as_str().to_owned(), alias.into());
        }
    }

    /// Messages saved so far, oldest first.
    pub fn messages(&self) -> Vec<IncomingMessage> {
        self.data
            .lock()
            .map(|d| d.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn device_config(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<DeviceConfig>, CoreError> {
        Ok(self
            .data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?
            .device_configs
            .get(&hardware_key(vendor_id, product_id))
            .copied())
    }

    async fn save_device_config(
        &self,
        vendor_id: u16,
        product_id: u16,
        config: DeviceConfig,
    ) -> Result<(), CoreError> {
        self.data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?
            .device_configs
            .insert(hardware_key(vendor_id, product_id), config);
        Ok(())
    }

    async fn user_config(&self, imei: &str) -> Result<Option<UserConfig>, CoreError> {
        Ok(self
            .data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?
            .user_configs
            .get(imei)
            .cloned())
    }

    async fn port_alias(&self, location: &UsbLocationId) -> Result<Option<String>, CoreError> {
        Ok(self
            .data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?
            .port_aliases
            .get(location.as_str())
            .cloned())
    }

    async fn save_message(&self, message: &IncomingMessage) -> Result<(), CoreError> {
        self.data
            .lock()
            .map_err(|_| CoreError::store("store lock poisoned"))?
            .messages
            .push(message.clone());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn message(text: &str) -> IncomingMessage {
        IncomingMessage {
            location: UsbLocationId::new("1-1.2"),
            sender: "+79161234567".into(),
            text: text.into(),
            timestamp: None,
            received_at: Utc::now(),
            parts: 1,
        }
    }

    #[tokio::test]
    async fn json_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleet.json");

        let store = JsonStore::open(&path).await.expect("open");
        store
            .save_device_config(
                0x12d1,
                0x1506,
                DeviceConfig {
                    baud_rate: 9_600,
                    command_timeout_ms: 7_000,
                },
            )
            .await
            .expect("save config");
        store.save_message(&message("hello")).await.expect("save");

        let reopened = JsonStore::open(&path).await.expect("reopen");
        let config = reopened
            .device_config(0x12d1, 0x1506)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(config.baud_rate, 9_600);
        assert_eq!(
            reopened.read(|d| d.messages.len()).expect("read"),
            1
        );
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::open(dir.path().join("absent.json"))
            .await
            .expect("open");
        assert_eq!(
            store.device_config(0, 0).await.expect("lookup"),
            None
        );
    }

    #[tokio::test]
    async fn memory_store_keeps_messages_in_order() {
        let store = MemoryStore::new();
        store.save_message(&message("one")).await.expect("save");
        store.save_message(&message("two")).await.expect("save");
        let texts: Vec<String> = store.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
