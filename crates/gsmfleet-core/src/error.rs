use thiserror::Error;

use gsmfleet_at::AtError;

use crate::model::UsbLocationId;

/// Top-level error type for the `gsmfleet-core` crate.
///
/// Wire-level failures from `gsmfleet-at` surface through [`CoreError::Modem`];
/// everything else is fleet-level: discovery, persistence, and device
/// addressing.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Wire layer ──────────────────────────────────────────────────
    #[error(transparent)]
    Modem(#[from] AtError),

    // ── Discovery ───────────────────────────────────────────────────
    /// Enumerating serial ports failed outright.
    #[error("port discovery failed: {message}")]
    Discovery { message: String },

    // ── Device addressing ───────────────────────────────────────────
    /// No tracked device at this USB location.
    #[error("no device at {location}")]
    DeviceNotFound { location: UsbLocationId },

    /// The device exists but its supervisor is gone or shutting down.
    #[error("device at {location} is unavailable")]
    DeviceUnavailable { location: UsbLocationId },

    /// Every candidate port of a device group failed the probe.
    #[error("no port answered after {attempts} attempt(s)")]
    ConnectFailed { attempts: usize },

    // ── Persistence ─────────────────────────────────────────────────
    #[error("store error: {message}")]
    Store { message: String },

    // ── Lifecycle ───────────────────────────────────────────────────
    /// The fleet manager is shutting down.
    #[error("fleet manager closed")]
    Closed,
}

impl CoreError {
    /// Returns `true` if the device connection behind this error is gone
    /// and the supervisor should tear the session down.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Modem(e) => e.is_connection_fatal(),
            Self::ConnectFailed { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}
