//! Async AT command protocol engine for GSM/cellular modems.
//!
//! This crate is the wire layer of the fleet manager. It knows how to talk
//! to one modem over a line-oriented serial channel and nothing about fleets:
//!
//! - [`transport`] — the duplex line channel abstraction and its
//!   `tokio-serial` implementation.
//! - [`engine`] — the single-in-flight command queue with unsolicited event
//!   demultiplexing and timed-out-response discarding.
//! - [`ops`] — typed modem operations: identity, message storage, preferred
//!   memory, USSD sessions.
//! - [`pdu`] — SMS-DELIVER and USSD payload codecs (GSM 7-bit, UCS-2,
//!   concatenation headers).
//!
//! # Example
//!
//! ```no_run
//! use gsmfleet_at::{AtEngine, EngineOptions, ModemOps, SerialOpener, TransportOpener};
//!
//! # async fn demo() -> Result<(), gsmfleet_at::AtError> {
//! let channel = SerialOpener.open("/dev/ttyUSB0", 115_200).await?;
//! let engine = AtEngine::open(channel, EngineOptions::default()).await?;
//! let ops = ModemOps::new(engine);
//! ops.run_connect_sequence().await?;
//! for stored in ops.list_messages(true).await? {
//!     println!("{}: {}", stored.sms.sender, stored.sms.text);
//! }
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod event;
pub mod ops;
pub mod pdu;
pub mod transport;

pub use engine::{AtEngine, CommandResponse, EngineOptions, ResultCode, DEFAULT_COMMAND_TIMEOUT};
pub use error::AtError;
pub use event::UnsolicitedEvent;
pub use ops::{
    MemorySlot, MemoryStatus, MemoryType, ModemIdentity, ModemOps, StoredSms, UssdReply,
};
pub use pdu::{ConcatInfo, DecodedSms, PduError};
pub use transport::{LineChannel, SerialOpener, TransportOpener};
