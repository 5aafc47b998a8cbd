use thiserror::Error;

use crate::pdu::PduError;

/// Top-level error type for the `gsmfleet-at` crate.
///
/// Covers every failure mode of the wire layer: transport faults, protocol
/// timeouts, AT `ERROR` rejections, and payload decoding. `gsmfleet-core`
/// maps these into device-level diagnostics.
#[derive(Debug, Error)]
pub enum AtError {
    // ── Transport ───────────────────────────────────────────────────
    /// The serial channel failed (open refused, write error, line stream
    /// closed mid-command). Fatal to the current connection.
    #[error("transport fault: {message}")]
    Transport { message: String },

    /// The engine was closed or never opened; no further commands accepted.
    #[error("command engine closed")]
    EngineClosed,

    // ── Protocol ────────────────────────────────────────────────────
    /// No terminal result-code line arrived within the command window.
    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The modem answered `ERROR` to a command the caller treats as required.
    #[error("command rejected by modem: {command}")]
    CommandRejected { command: String },

    /// A response line did not match the expected shape.
    #[error("malformed {context} line: {line:?}")]
    Parse {
        context: &'static str,
        line: String,
    },

    // ── USSD ────────────────────────────────────────────────────────
    /// The USSD notification did not arrive within the session window.
    /// Distinct from [`AtError::Timeout`]: the command itself succeeded.
    #[error("no USSD notification within {timeout_ms}ms")]
    UssdTimeout { timeout_ms: u64 },

    // ── Payload decoding ────────────────────────────────────────────
    #[error(transparent)]
    Pdu(#[from] PduError),
}

impl AtError {
    /// Returns `true` if the underlying connection is unusable and the
    /// device should be reconnected.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::EngineClosed)
    }
}
