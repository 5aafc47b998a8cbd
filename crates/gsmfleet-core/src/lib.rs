//! Fleet management core for GSM/cellular modem pools.
//!
//! Builds on [`gsmfleet_at`] (one modem, one wire) to run an entire rack of
//! sticks: USB discovery, per-device supervision with reconnect, multipart
//! message reassembly, USSD routing, and persistence.
//!
//! The shape is actor-per-concern:
//!
//! - [`fleet::FleetManager`] — single task owning the fleet table, driven by
//!   a discovery timer and supervisor events.
//! - [`supervisor::DeviceSupervisor`] — one task per physical modem, owning
//!   its connection lifecycle.
//! - [`store::FleetStore`] — persistence seam ([`store::JsonStore`] on disk,
//!   [`store::MemoryStore`] for tests).
//!
//! Handles are message-passing facades; no fleet state is shared between
//! tasks.

pub mod config;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod identity;
pub mod model;
pub mod reassembly;
pub mod store;
pub mod supervisor;

pub use config::{DeviceConfig, UserConfig};
pub use discovery::{PortScanner, SerialPortScanner};
pub use error::CoreError;
pub use fleet::{FleetManager, FleetOptions};
pub use model::{
    ConnectionState, DeviceGroup, DeviceSnapshot, DiscoveredPort, FleetEvent, IncomingMessage,
    SupervisorEvent, UsbLocationId,
};
pub use store::{FleetStore, JsonStore, MemoryStore};
