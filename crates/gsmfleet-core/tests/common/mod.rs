//! Shared doubles: a scripted modem behind the transport seam and a
//! scripted port scanner.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gsmfleet_at::{AtError, LineChannel, TransportOpener};
use gsmfleet_core::discovery::PortScanner;
use gsmfleet_core::model::{DeviceGroup, DiscoveredPort, SupervisorEvent, UsbLocationId};
use gsmfleet_core::CoreError;

/// SMS-DELIVER from +79161234567, GSM 7-bit "hello".
pub const HELLO_PDU: &str = "00040B919761214365F700004260512103542105E8329BFD06";
/// Concatenated pair (reference 7): part 1/2 "Hi", part 2/2 "ok".
pub const PART1_PDU: &str = "00440B919761214365F7000042605121035421090500030702019069";
pub const PART2_PDU: &str = "00440B919761214365F700004260512103542109050003070202DE6B";

// ── Scripted modem ───────────────────────────────────────────────────

/// Behavior of one fake modem. Everything not configured answers like a
/// healthy, empty Huawei stick.
#[derive(Debug, Clone, Default)]
pub struct ModemBehavior {
    /// `None` plays a SIM-less stick: `AT+CIMI` and every storage command
    /// answer `ERROR`, as real hardware does.
    pub imsi: Option<String>,
    /// Messages listed by the first `AT+CMGL=4` sweep.
    pub stored: Vec<(u32, String)>,
    /// Messages readable via `AT+CMGR=<index>`.
    pub readable: HashMap<u32, String>,
    /// Hex text of the `+CUSD` notification sent after `AT+CUSD=1,...`.
    pub ussd_reply: Option<String>,
    /// Override for the `AT+CPMS?` report (default: matching `ME` banks).
    pub cpms_status: Option<String>,
    /// `AT+CPMS=?` answers `ERROR`.
    pub cpms_query_fails: bool,
    /// Every command received, shared across clones.
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl ModemBehavior {
    pub fn with_imsi(imsi: &str) -> Self {
        Self {
            imsi: Some(imsi.to_owned()),
            ..Self::default()
        }
    }

    fn respond(&mut self, command: &str) -> Vec<String> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_owned());
        }

        let ok = |lines: &[&str]| -> Vec<String> {
            lines
                .iter()
                .map(|l| (*l).to_owned())
                .chain(std::iter::once("OK".to_owned()))
                .collect()
        };

        // Storage and USSD need a SIM; `AT+CMGF` works without one.
        let sim_backed = command.starts_with("AT+CPMS")
            || command.starts_with("AT+CMGL")
            || command.starts_with("AT+CMGR=")
            || command.starts_with("AT+CMGD=")
            || command.starts_with("AT+CUSD=");
        if sim_backed && self.imsi.is_none() {
            return vec!["ERROR".to_owned()];
        }

        match command {
            "AT" | "AT+CMGF=0" | "AT^CURC=0" => ok(&[]),
            "AT+CIMI" => match &self.imsi {
                Some(imsi) => ok(&[imsi]),
                None => vec!["ERROR".to_owned()],
            },
            "AT+CGMI" => ok(&["huawei"]),
            "AT+CGMM" => ok(&["E3372"]),
            "AT+CGMR" => ok(&["21.316.01.00.00"]),
            "AT+CGSN" => ok(&["867322050000000"]),
            "AT+CPMS?" => match &self.cpms_status {
                Some(line) => ok(&[line.as_str()]),
                None => ok(&["+CPMS: \"ME\",0,50,\"ME\",0,50,\"ME\",0,50"]),
            },
            "AT+CPMS=?" if self.cpms_query_fails => vec!["ERROR".to_owned()],
            "AT+CPMS=?" => ok(&["+CPMS: (\"SM\",\"ME\"),(\"SM\",\"ME\"),(\"SM\",\"ME\")"]),
            "AT+CMGL=4" | "AT+CMGL=0" => {
                let stored = std::mem::take(&mut self.stored);
                let mut lines = Vec::new();
                for (index, pdu) in stored {
                    lines.push(format!("+CMGL: {index},0,,24"));
                    lines.push(pdu);
                }
                lines.push("OK".to_owned());
                lines
            }
            _ if command.starts_with("AT+CMGR=") => {
                let index: Option<u32> = command["AT+CMGR=".len()..].parse().ok();
                match index.and_then(|i| self.readable.get(&i)) {
                    Some(pdu) => ok(&["+CMGR: 0,,24", pdu.as_str()]),
                    None => vec!["ERROR".to_owned()],
                }
            }
            _ if command.starts_with("AT+CMGD=") => ok(&[]),
            _ if command.starts_with("AT+CPMS=") => ok(&[]),
            _ if command.starts_with("AT+CUSD=") => {
                let mut lines = vec!["OK".to_owned()];
                if let Some(hex) = &self.ussd_reply {
                    lines.push(format!("+CUSD: 0,\"{hex}\",72"));
                }
                lines
            }
            _ => vec!["ERROR".to_owned()],
        }
    }
}

/// Drive one side of a channel pair with a [`ModemBehavior`]. Returns a
/// sender the test can use to inject unsolicited lines.
pub fn spawn_modem(far: LineChannel, mut behavior: ModemBehavior) -> mpsc::Sender<String> {
    let injector = far.writer.clone();
    tokio::spawn(async move {
        let LineChannel { writer, mut reader } = far;
        while let Some(command) = reader.recv().await {
            for line in behavior.respond(&command) {
                if writer.send(line).await.is_err() {
                    return;
                }
            }
        }
    });
    injector
}

// ── Transport doubles ────────────────────────────────────────────────

/// Opener whose every port is a scripted modem.
pub struct MockOpener {
    pub behavior: ModemBehavior,
    /// Ports that refuse to open at all.
    pub failing_ports: Vec<String>,
    /// `(port, baud)` of every `open` call.
    pub opened: Mutex<Vec<(String, u32)>>,
    /// Line injectors for every opened channel, in open order.
    pub injectors: Mutex<Vec<mpsc::Sender<String>>>,
}

impl MockOpener {
    pub fn new(behavior: ModemBehavior) -> Self {
        Self {
            behavior,
            failing_ports: Vec::new(),
            opened: Mutex::new(Vec::new()),
            injectors: Mutex::new(Vec::new()),
        }
    }

    pub fn last_injector(&self) -> mpsc::Sender<String> {
        self.injectors
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .expect("no channel opened yet")
    }

    /// Injector of the channel opened for `port`.
    pub fn injector_for(&self, port: &str) -> mpsc::Sender<String> {
        let opened = self.opened.lock().expect("lock");
        let index = opened
            .iter()
            .position(|(name, _)| name == port)
            .expect("port never opened");
        self.injectors.lock().expect("lock")[index].clone()
    }
}

#[async_trait]
impl TransportOpener for MockOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<LineChannel, AtError> {
        self.opened
            .lock()
            .expect("lock")
            .push((port.to_owned(), baud_rate));
        if self.failing_ports.iter().any(|p| p == port) {
            return Err(AtError::Transport {
                message: format!("open {port}: no such device"),
            });
        }
        let (near, far) = LineChannel::pair();
        let injector = spawn_modem(far, self.behavior.clone());
        self.injectors.lock().expect("lock").push(injector);
        Ok(near)
    }
}

/// Opener that never completes; for connect-budget tests.
pub struct HangingOpener;

#[async_trait]
impl TransportOpener for HangingOpener {
    async fn open(&self, _port: &str, _baud_rate: u32) -> Result<LineChannel, AtError> {
        std::future::pending().await
    }
}

// ── Scanner double ───────────────────────────────────────────────────

/// Scanner that plays back a fixed sequence of passes, repeating the last.
pub struct ScriptedScanner {
    passes: Mutex<Vec<Vec<DiscoveredPort>>>,
    last: Mutex<Vec<DiscoveredPort>>,
}

impl ScriptedScanner {
    pub fn new(passes: Vec<Vec<DiscoveredPort>>) -> Self {
        Self {
            passes: Mutex::new(passes),
            last: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PortScanner for ScriptedScanner {
    async fn scan(&self) -> Result<Vec<DiscoveredPort>, CoreError> {
        let mut passes = self.passes.lock().expect("lock");
        if passes.is_empty() {
            Ok(self.last.lock().expect("lock").clone())
        } else {
            let pass = passes.remove(0);
            *self.last.lock().expect("lock") = pass.clone();
            Ok(pass)
        }
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

pub fn port(name: &str, location: &str) -> DiscoveredPort {
    DiscoveredPort {
        name: name.to_owned(),
        location: UsbLocationId::new(location),
        vendor_id: 0x12d1,
        product_id: 0x1506,
        manufacturer: Some("huawei".into()),
        product: Some("E3372".into()),
        serial_number: None,
    }
}

pub fn group(location: &str, port_names: &[&str]) -> DeviceGroup {
    DeviceGroup {
        location: UsbLocationId::new(location),
        ports: port_names.iter().map(|n| port(n, location)).collect(),
    }
}

/// Receive the next supervisor event or panic after two seconds.
pub async fn next_event(
    rx: &mut mpsc::Receiver<(UsbLocationId, SupervisorEvent)>,
) -> SupervisorEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
        .1
}
