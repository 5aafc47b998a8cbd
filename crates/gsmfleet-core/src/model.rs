// ── Fleet data model ──

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use gsmfleet_at::ModemIdentity;

use crate::identity::ResolvedSim;

// ── Identification ───────────────────────────────────────────────────

/// Stable identifier of one physical modem: its position on the USB tree.
///
/// Ports come and go and `ttyUSB` numbers shuffle on replug, but the
/// location survives as long as the stick stays in the same socket. The
/// whole fleet is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsbLocationId(String);

impl UsbLocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UsbLocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One serial port found during a discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPort {
    pub name: String,
    pub location: UsbLocationId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// All ports of one physical device, candidate command ports first.
///
/// Modem sticks expose several ports at the same location (command, data,
/// diagnostics); which one answers AT commands varies by model, so the
/// supervisor probes them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    pub location: UsbLocationId,
    pub ports: Vec<DiscoveredPort>,
}

impl DeviceGroup {
    /// `vendor:product` of the group, for config lookup.
    pub fn hardware_id(&self) -> Option<(u16, u16)> {
        self.ports.first().map(|p| (p.vendor_id, p.product_id))
    }
}

// ── Device state ─────────────────────────────────────────────────────

/// Lifecycle of one supervised device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Probing candidate ports and running the setup sequence.
    Connecting,
    /// Probed, configured, and answering the liveness poll.
    Online,
    /// Lost mid-session; a fresh connect attempt is underway.
    Reconnecting,
    /// Taken offline by an operator; stays tracked but idle.
    Disconnected,
}

/// Identity fields as persisted and reported, mirroring the wire layer's
/// [`ModemIdentity`] with serde support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    pub serial: String,
}

impl From<ModemIdentity> for DeviceIdentity {
    fn from(id: ModemIdentity) -> Self {
        Self {
            manufacturer: id.manufacturer,
            model: id.model,
            revision: id.revision,
            serial: id.serial,
        }
    }
}

/// Point-in-time view of one device, as reported to API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub location: UsbLocationId,
    /// The port that answered the probe.
    pub port: String,
    pub alias: Option<String>,
    pub state: ConnectionState,
    pub identity: DeviceIdentity,
    pub imsi: Option<String>,
    pub sim: Option<ResolvedSim>,
    /// Last unsolicited signal-strength report, verbatim.
    pub signal: Option<String>,
}

// ── Messages ─────────────────────────────────────────────────────────

/// A fully reassembled inbound SMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub location: UsbLocationId,
    pub sender: String,
    pub text: String,
    /// Service centre timestamp of the (last) part, when decodable.
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub received_at: DateTime<Utc>,
    /// Part count this message was glued from; 1 for plain messages.
    pub parts: u8,
}

// ── Events ───────────────────────────────────────────────────────────

/// What a device supervisor reports upward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SupervisorEvent {
    State(ConnectionState),
    /// Connect finished; the full snapshot is known.
    Ready(Box<DeviceSnapshot>),
    Message(IncomingMessage),
    /// Unsolicited signal-strength report.
    Signal(String),
    /// A maintenance poll (SIM recheck + message sweep) is running.
    PollStarted,
    PollFinished,
    VoltageWarning,
    /// SIM missing or locked (`+CPIN: NOT ...`).
    SimFault(String),
    /// One candidate port failed; others may still succeed.
    PortError { port: String, message: String },
    /// The supervisor gave up; the device leaves the fleet until the next
    /// discovery pass finds it again.
    Failed { message: String },
}

/// Fleet-level event stream, device events tagged by location.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A connect batch started (`active`) or every pending connect settled.
    /// Discovery pauses while one is active.
    Loading {
        active: bool,
    },
    DeviceDiscovered {
        location: UsbLocationId,
        ports: Vec<String>,
    },
    DeviceRemoved {
        location: UsbLocationId,
    },
    Device {
        location: UsbLocationId,
        event: SupervisorEvent,
    },
}
