// ── Device configuration ──

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Connection parameters for one device.
///
/// Resolution order, most specific wins: per-device user overrides (keyed
/// by IMEI), then the stored per-hardware config (keyed by USB
/// vendor/product), then the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub baud_rate: u32,
    pub command_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl DeviceConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Per-device user overrides and presentation settings, keyed by IMEI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub baud_rate: Option<u32>,
    pub command_timeout_ms: Option<u64>,
    /// Display name for this device in listings.
    pub alias: Option<String>,
}

/// Merge the configuration layers for one device.
pub fn resolve(device: Option<DeviceConfig>, user: Option<&UserConfig>) -> DeviceConfig {
    let mut config = device.unwrap_or_default();
    if let Some(user) = user {
        if let Some(baud) = user.baud_rate {
            config.baud_rate = baud;
        }
        if let Some(timeout) = user.command_timeout_ms {
            config.command_timeout_ms = timeout;
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_when_nothing_is_stored() {
        let config = resolve(None, None);
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.command_timeout_ms, 5_000);
    }

    #[test]
    fn user_overrides_beat_device_config() {
        let device = DeviceConfig {
            baud_rate: 9_600,
            command_timeout_ms: 10_000,
        };
        let user = UserConfig {
            baud_rate: Some(57_600),
            command_timeout_ms: None,
            alias: None,
        };
        let config = resolve(Some(device), Some(&user));
        assert_eq!(config.baud_rate, 57_600);
        // Unset user fields fall through to the device layer.
        assert_eq!(config.command_timeout_ms, 10_000);
    }
}
