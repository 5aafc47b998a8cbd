// ── Modem operations ──
//
// The typed vocabulary spoken over an [`AtEngine`]: identity queries, PDU
// message storage, preferred-memory selection, and USSD sessions. Each
// operation owns the quirks of its command: which failures are fatal, which
// degrade to a placeholder, and how the response lines are shaped.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::engine::{AtEngine, CommandResponse};
use crate::error::AtError;
use crate::event::UnsolicitedEvent;
use crate::pdu::{self, DecodedSms};

/// USSD responses carry no correlation id, so one session at a time.
const USSD_DCS: u8 = 15;

// ── Data shapes ──────────────────────────────────────────────────────

/// Hardware identity, assembled from `AT+CGMI/CGMM/CGMR/CGSN`. Sticks with
/// stripped-down firmware reject some of these; the affected field degrades
/// to `"unknown"` rather than failing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemIdentity {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    pub serial: String,
}

/// Preferred message storage, per `AT+CPMS`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum MemoryType {
    /// SIM card storage.
    Sm,
    /// Modem flash.
    Me,
    /// Combined SIM + modem.
    Mt,
    /// Broadcast messages.
    Bm,
    /// Status reports.
    Sr,
    /// TA storage.
    Ta,
}

/// One slot of the `AT+CPMS?` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySlot {
    pub memory: MemoryType,
    pub used: u32,
    pub total: u32,
}

/// The three preferred-storage slots: read, send, receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatus {
    pub read: MemorySlot,
    pub send: MemorySlot,
    pub receive: MemorySlot,
}

/// A message as stored on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSms {
    /// Storage index, used for `AT+CMGR`/`AT+CMGD`.
    pub index: u32,
    /// Numeric PDU-mode status (0 = received unread .. 3 = stored sent).
    pub status: u8,
    /// TPDU length in octets as reported by the modem.
    pub length: u32,
    pub sms: DecodedSms,
}

/// Decoded network reply to a USSD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UssdReply {
    /// Session disposition from `+CUSD` (0 done, 1 more input expected...).
    pub code: u8,
    pub text: String,
}

// ── Operations ───────────────────────────────────────────────────────

/// Typed operations over one modem's command engine.
#[derive(Clone)]
pub struct ModemOps {
    engine: AtEngine,
}

impl ModemOps {
    pub fn new(engine: AtEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AtEngine {
        &self.engine
    }

    /// Put the modem into the state every other operation assumes:
    /// PDU message mode, periodic status reports silenced.
    pub async fn run_connect_sequence(&self) -> Result<(), AtError> {
        self.require_ok("AT+CMGF=0").await?;
        // Huawei-specific; other vendors answer ERROR, which is fine.
        let _ = self.engine.submit("AT^CURC=0").await?;
        Ok(())
    }

    /// IMSI of the inserted SIM. Absent or locked SIMs answer `ERROR`,
    /// reported as `None` so the device can still come online.
    pub async fn imsi(&self) -> Result<Option<String>, AtError> {
        let resp = self.engine.submit("AT+CIMI").await?;
        Ok(resp
            .is_ok()
            .then(|| resp.first_line().map(str::to_owned))
            .flatten())
    }

    /// Query hardware identity, degrading rejected fields to `"unknown"`.
    pub async fn identity(&self) -> Result<ModemIdentity, AtError> {
        Ok(ModemIdentity {
            manufacturer: self.identity_field("AT+CGMI").await?,
            model: self.identity_field("AT+CGMM").await?,
            revision: self.identity_field("AT+CGMR").await?,
            serial: self.identity_field("AT+CGSN").await?,
        })
    }

    async fn identity_field(&self, command: &str) -> Result<String, AtError> {
        match self.engine.submit(command).await {
            Ok(resp) => Ok(resp
                .is_ok()
                .then(|| resp.first_line())
                .flatten()
                .filter(|l| !l.is_empty())
                .map_or_else(|| "unknown".to_owned(), str::to_owned)),
            Err(e) if e.is_connection_fatal() => Err(e),
            Err(e) => {
                debug!(command, error = %e, "identity query degraded");
                Ok("unknown".to_owned())
            }
        }
    }

    // ── Message storage ─────────────────────────────────────────────

    /// List stored messages: unread only, or everything.
    #[instrument(skip(self))]
    pub async fn list_messages(&self, all: bool) -> Result<Vec<StoredSms>, AtError> {
        let filter = if all { 4 } else { 0 };
        let resp = self.require_ok(&format!("AT+CMGL={filter}")).await?;

        // Lines alternate: `+CMGL: <idx>,<stat>,,<length>` then the PDU hex.
        let mut messages = Vec::new();
        let mut lines = resp.lines.iter();
        while let Some(header) = lines.next() {
            let (index, status, length) = parse_cmgl_header(header)?;
            let payload = lines.next().ok_or_else(|| AtError::Parse {
                context: "+CMGL payload",
                line: header.clone(),
            })?;
            messages.push(StoredSms {
                index,
                status,
                length,
                sms: pdu::decode_sms_deliver(payload)?,
            });
        }
        Ok(messages)
    }

    /// Read a single stored message by index.
    pub async fn read_message(&self, index: u32) -> Result<StoredSms, AtError> {
        let resp = self.require_ok(&format!("AT+CMGR={index}")).await?;
        let [header, payload, ..] = resp.lines.as_slice() else {
            return Err(AtError::Parse {
                context: "+CMGR response",
                line: resp.lines.first().cloned().unwrap_or_default(),
            });
        };
        let (status, length) = parse_cmgr_header(header)?;
        Ok(StoredSms {
            index,
            status,
            length,
            sms: pdu::decode_sms_deliver(payload)?,
        })
    }

    /// Delete a stored message. `false` means the modem refused (already
    /// deleted, or an index it never handed out), which callers treat as
    /// a stale-index race rather than a fault.
    pub async fn delete_message(&self, index: u32) -> Result<bool, AtError> {
        let resp = self.engine.submit(format!("AT+CMGD={index}")).await?;
        Ok(resp.is_ok())
    }

    // ── Preferred storage ───────────────────────────────────────────

    /// Current storage occupation across the three slots.
    pub async fn memory_status(&self) -> Result<MemoryStatus, AtError> {
        let resp = self.require_ok("AT+CPMS?").await?;
        let line = resp.first_line().ok_or(AtError::Parse {
            context: "+CPMS? response",
            line: String::new(),
        })?;
        parse_cpms_status(line)
    }

    /// Storage types this modem accepts for the read slot.
    pub async fn supported_read_memory_types(&self) -> Result<Vec<MemoryType>, AtError> {
        let resp = self.require_ok("AT+CPMS=?").await?;
        let line = resp.first_line().ok_or(AtError::Parse {
            context: "+CPMS=? response",
            line: String::new(),
        })?;

        // `+CPMS: ("SM","ME"),("SM","ME"),("SM","ME")` — the first group
        // is the read slot; the groups are always the same length.
        let tokens: Vec<&str> = quoted_tokens(line).collect();
        let per_slot = tokens.len() / 3;
        Ok(tokens
            .into_iter()
            .take(per_slot)
            .filter_map(|t| t.parse().ok())
            .collect())
    }

    /// Select preferred storage for all three slots.
    pub async fn set_memory(
        &self,
        read: MemoryType,
        send: MemoryType,
        receive: MemoryType,
    ) -> Result<(), AtError> {
        self.require_ok(&format!("AT+CPMS=\"{read}\",\"{send}\",\"{receive}\""))
            .await?;
        Ok(())
    }

    // ── USSD ────────────────────────────────────────────────────────

    /// Run a USSD session: send the request, then wait up to `wait` for the
    /// network's `+CUSD` notification.
    #[instrument(skip(self), fields(request = text))]
    pub async fn send_ussd(&self, text: &str, wait: Duration) -> Result<UssdReply, AtError> {
        let payload = pdu::encode_ussd(text)?;
        // Subscribe before submitting so a fast network cannot slip the
        // notification past us.
        let mut events = self.engine.events();
        self.require_ok(&format!("AT+CUSD=1,\"{payload}\",{USSD_DCS}"))
            .await?;

        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(AtError::UssdTimeout {
                        timeout_ms: wait.as_millis() as u64,
                    });
                }
                event = events.recv() => match event {
                    Ok(UnsolicitedEvent::UssdResult { code, text, .. }) => {
                        return Ok(UssdReply {
                            code,
                            text: pdu::decode_ucs2(&text)?,
                        });
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AtError::EngineClosed);
                    }
                },
            }
        }
    }

    /// Submit a command whose rejection is a hard failure.
    async fn require_ok(&self, command: &str) -> Result<CommandResponse, AtError> {
        let resp = self.engine.submit(command).await?;
        if !resp.is_ok() {
            return Err(AtError::CommandRejected {
                command: command.to_owned(),
            });
        }
        Ok(resp)
    }
}

// ── Response line parsing ────────────────────────────────────────────

/// `+CMGL: <index>,<stat>,[<alpha>],<length>`
fn parse_cmgl_header(line: &str) -> Result<(u32, u8, u32), AtError> {
    let parse = || {
        let fields: Vec<&str> = line.strip_prefix("+CMGL:")?.trim().split(',').collect();
        let index = fields.first()?.trim().parse().ok()?;
        let status = fields.get(1)?.trim().parse().ok()?;
        let length = fields.get(3)?.trim().parse().ok()?;
        Some((index, status, length))
    };
    parse().ok_or_else(|| AtError::Parse {
        context: "+CMGL header",
        line: line.to_owned(),
    })
}

/// `+CMGR: <stat>,[<alpha>],<length>`
fn parse_cmgr_header(line: &str) -> Result<(u8, u32), AtError> {
    let parse = || {
        let fields: Vec<&str> = line.strip_prefix("+CMGR:")?.trim().split(',').collect();
        let status = fields.first()?.trim().parse().ok()?;
        let length = fields.get(2)?.trim().parse().ok()?;
        Some((status, length))
    };
    parse().ok_or_else(|| AtError::Parse {
        context: "+CMGR header",
        line: line.to_owned(),
    })
}

/// `+CPMS: "ME",10,50,"SM",3,30,"ME",10,50`
fn parse_cpms_status(line: &str) -> Result<MemoryStatus, AtError> {
    let err = || AtError::Parse {
        context: "+CPMS? status",
        line: line.to_owned(),
    };

    let fields: Vec<&str> = line
        .strip_prefix("+CPMS:")
        .ok_or_else(err)?
        .trim()
        .split(',')
        .map(str::trim)
        .collect();
    if fields.len() < 9 {
        return Err(err());
    }

    let slot = |chunk: &[&str]| -> Option<MemorySlot> {
        Some(MemorySlot {
            memory: chunk[0].trim_matches('"').parse().ok()?,
            used: chunk[1].parse().ok()?,
            total: chunk[2].parse().ok()?,
        })
    };

    Ok(MemoryStatus {
        read: slot(&fields[0..3]).ok_or_else(err)?,
        send: slot(&fields[3..6]).ok_or_else(err)?,
        receive: slot(&fields[6..9]).ok_or_else(err)?,
    })
}

fn quoted_tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split('"').skip(1).step_by(2)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cmgl_header_extracts_index_status_length() {
        assert_eq!(
            parse_cmgl_header("+CMGL: 3,1,,26").unwrap(),
            (3, 1, 26)
        );
    }

    #[test]
    fn cmgl_header_rejects_garbage() {
        assert!(parse_cmgl_header("+CMGL: x,y").is_err());
        assert!(parse_cmgl_header("OK").is_err());
    }

    #[test]
    fn cpms_status_parses_all_three_slots() {
        let status =
            parse_cpms_status("+CPMS: \"ME\",10,50,\"SM\",3,30,\"ME\",10,50").unwrap();
        assert_eq!(
            status.read,
            MemorySlot {
                memory: MemoryType::Me,
                used: 10,
                total: 50,
            }
        );
        assert_eq!(status.send.memory, MemoryType::Sm);
        assert_eq!(status.receive.total, 50);
    }

    #[test]
    fn cpms_status_rejects_short_reports() {
        assert!(parse_cpms_status("+CPMS: \"ME\",10,50").is_err());
    }

    #[test]
    fn memory_type_round_trips_uppercase() {
        assert_eq!(MemoryType::Me.to_string(), "ME");
        assert_eq!("SM".parse::<MemoryType>().unwrap(), MemoryType::Sm);
        assert!("XX".parse::<MemoryType>().is_err());
    }

    #[test]
    fn quoted_tokens_take_first_group() {
        let tokens: Vec<&str> =
            quoted_tokens("(\"SM\",\"ME\"),(\"SM\",\"ME\"),(\"SM\",\"ME\")").collect();
        assert_eq!(tokens.len(), 6);
        assert_eq!(&tokens[..2], &["SM", "ME"]);
    }
}
