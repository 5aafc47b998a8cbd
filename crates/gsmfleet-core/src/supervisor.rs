// ── Device supervisor ──
//
// One task per physical modem. It owns the device end to end: probing the
// candidate ports, running the setup sequence, draining stored messages,
// serving operator commands, and reconnecting when the liveness poll fails.
// Everything it learns is reported upward as [`SupervisorEvent`]s tagged
// with the device's USB location.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gsmfleet_at::engine::{AtEngine, EngineOptions};
use gsmfleet_at::{MemoryType, ModemOps, StoredSms, TransportOpener, UnsolicitedEvent, UssdReply};

use crate::config::{self, DeviceConfig};
use crate::error::CoreError;
use crate::identity::resolve_sim;
use crate::model::{
    ConnectionState, DeviceGroup, DeviceSnapshot, DiscoveredPort, IncomingMessage,
    SupervisorEvent, UsbLocationId,
};
use crate::reassembly::ReassemblyBuffer;
use crate::store::FleetStore;

const COMMAND_QUEUE: usize = 16;

// ── Handle ───────────────────────────────────────────────────────────

/// Operator commands addressed to one device.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Run a USSD session and return the decoded network reply.
    Ussd {
        text: String,
        reply: oneshot::Sender<Result<UssdReply, CoreError>>,
    },
    /// List messages currently stored on the device, without deleting them.
    ReadStored {
        all: bool,
        reply: oneshot::Sender<Result<Vec<StoredSms>, CoreError>>,
    },
    /// Current snapshot, `None` until the first connect completes.
    Snapshot {
        reply: oneshot::Sender<Option<DeviceSnapshot>>,
    },
    /// Persist new connection parameters for this hardware, then reconnect
    /// so they take effect.
    SaveConfig {
        config: DeviceConfig,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    /// Take the device offline; it stays tracked but idle until `Reconnect`.
    Disconnect,
    /// Tear the session down and connect again from scratch.
    Reconnect,
}

/// Handle onto a running supervisor task.
pub struct SupervisorHandle {
    location: UsbLocationId,
    commands: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn location(&self) -> &UsbLocationId {
        &self.location
    }

    /// Queue a command without waiting. Fails when the supervisor is gone
    /// or its queue is full; the command (and its reply channel) comes back.
    pub fn try_send(
        &self,
        command: SupervisorCommand,
    ) -> Result<(), Box<mpsc::error::TrySendError<SupervisorCommand>>> {
        self.commands.try_send(command).map_err(Box::new)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait up to `grace` for the task to finish
    /// before aborting it.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!(location = %self.location, "supervisor did not stop in time, aborting");
            abort.abort();
        }
    }

    /// Abandon the task immediately (connect budget exceeded).
    pub fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Shared dependencies handed to every supervisor.
#[derive(Clone)]
pub struct SupervisorContext {
    pub opener: Arc<dyn TransportOpener>,
    pub store: Arc<dyn FleetStore>,
    pub events: mpsc::Sender<(UsbLocationId, SupervisorEvent)>,
    /// Liveness poll period while online.
    pub poll_interval: Duration,
}

// ── Supervisor ───────────────────────────────────────────────────────

enum SessionEnd {
    /// The connection is gone or was asked to restart.
    Reconnect,
    /// Operator took the device offline.
    Suspend,
    /// Shutdown requested.
    Stop,
}

struct Session {
    ops: ModemOps,
    config: DeviceConfig,
}

pub struct DeviceSupervisor {
    group: DeviceGroup,
    ctx: SupervisorContext,
    commands: mpsc::Receiver<SupervisorCommand>,
    cancel: CancellationToken,
    reassembly: ReassemblyBuffer,
    snapshot: Option<DeviceSnapshot>,
    suspended: bool,
}

impl DeviceSupervisor {
    /// Spawn a supervisor for one device group.
    pub fn spawn(group: DeviceGroup, ctx: SupervisorContext) -> SupervisorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        let location = group.location.clone();

        let supervisor = Self {
            group,
            ctx,
            commands: cmd_rx,
            cancel: cancel.clone(),
            reassembly: ReassemblyBuffer::new(),
            snapshot: None,
            suspended: false,
        };
        let task = tokio::spawn(supervisor.run());

        SupervisorHandle {
            location,
            commands: cmd_tx,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            if self.suspended && !self.wait_while_suspended().await {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;
            match self.connect().await {
                Ok(session) => {
                    if let Some(snapshot) = self.snapshot.clone() {
                        self.emit(SupervisorEvent::Ready(Box::new(snapshot))).await;
                    }
                    self.set_state(ConnectionState::Online).await;

                    match self.run_session(&session).await {
                        SessionEnd::Reconnect => {
                            session.ops.engine().close();
                            self.set_state(ConnectionState::Reconnecting).await;
                        }
                        SessionEnd::Suspend => {
                            session.ops.engine().close();
                            self.suspended = true;
                            self.set_state(ConnectionState::Disconnected).await;
                        }
                        SessionEnd::Stop => {
                            session.ops.engine().close();
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(location = %self.group.location, error = %e, "connect failed");
                    self.emit(SupervisorEvent::Failed {
                        message: e.to_string(),
                    })
                    .await;
                    break;
                }
            }
        }
    }

    // ── Connect ─────────────────────────────────────────────────────

    /// Probe candidate ports in order until one passes the full setup
    /// sequence. Per-port failures are reported and the next port is tried.
    async fn connect(&mut self) -> Result<Session, CoreError> {
        let stored = match self.group.hardware_id() {
            Some((vendor, product)) => self.ctx.store.device_config(vendor, product).await?,
            None => None,
        };
        let base = stored.unwrap_or_default();

        let ports = self.group.ports.clone();
        for port in &ports {
            match self.try_port(port, base).await {
                Ok(session) => {
                    info!(
                        location = %self.group.location,
                        port = %port.name,
                        baud = session.config.baud_rate,
                        "device online"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    debug!(port = %port.name, error = %e, "port probe failed");
                    self.emit(SupervisorEvent::PortError {
                        port: port.name.clone(),
                        message: e.to_string(),
                    })
                    .await;
                }
            }
        }
        Err(CoreError::ConnectFailed {
            attempts: ports.len(),
        })
    }

    async fn try_port(
        &mut self,
        port: &DiscoveredPort,
        base: DeviceConfig,
    ) -> Result<Session, CoreError> {
        let channel = self.ctx.opener.open(&port.name, base.baud_rate).await?;
        let engine = AtEngine::open(
            channel,
            EngineOptions {
                command_timeout: base.command_timeout(),
            },
        )
        .await?;
        let ops = ModemOps::new(engine);

        ops.run_connect_sequence().await?;
        let imsi = ops.imsi().await?;
        let identity = ops.identity().await?;

        // A SIM-less stick rejects every storage command but still answers
        // identity reads; it comes up in a degraded mode and message
        // handling waits for a SIM.
        let sim_present = imsi.is_some();
        if sim_present {
            normalize_memory(&ops).await;
        }

        // User overrides are keyed by IMEI, which is known only after the
        // identity is read. The merged config is persisted so baud changes
        // apply on the next connect; the timeout applies to this session's
        // USSD waits.
        let user = if identity.serial == "unknown" {
            None
        } else {
            self.ctx.store.user_config(&identity.serial).await?
        };
        let config = config::resolve(Some(base), user.as_ref());
        if config != base {
            if let Some((vendor, product)) = self.group.hardware_id() {
                if let Err(e) = self.ctx.store.save_device_config(vendor, product, config).await {
                    warn!(error = %e, "failed to persist device config");
                }
            }
        }

        let alias = match user.as_ref().and_then(|u| u.alias.clone()) {
            Some(alias) => Some(alias),
            None => self.ctx.store.port_alias(&self.group.location).await?,
        };

        self.snapshot = Some(DeviceSnapshot {
            location: self.group.location.clone(),
            port: port.name.clone(),
            alias,
            state: ConnectionState::Connecting,
            identity: identity.into(),
            sim: imsi.as_deref().and_then(resolve_sim),
            imsi,
            signal: None,
        });

        let session = Session { ops, config };
        if sim_present {
            // Messages that arrived while nobody was listening.
            self.drain_stored(&session).await?;
        }
        Ok(session)
    }

    // ── Session ─────────────────────────────────────────────────────

    async fn run_session(&mut self, session: &Session) -> SessionEnd {
        let mut events = session.ops.engine().events();
        let mut poll = tokio::time::interval(self.ctx.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await; // immediate first tick

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return SessionEnd::Stop,

                command = self.commands.recv() => {
                    let Some(command) = command else { return SessionEnd::Stop };
                    if let Some(end) = self.handle_command(session, command).await {
                        return end;
                    }
                }

                event = events.recv() => {
                    use tokio::sync::broadcast::error::RecvError;
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(session, event).await {
                                if e.is_connection_fatal() {
                                    return SessionEnd::Reconnect;
                                }
                                warn!(error = %e, "event handling failed");
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "event stream lagged");
                        }
                        Err(RecvError::Closed) => return SessionEnd::Reconnect,
                    }
                }

                _ = poll.tick() => {
                    self.emit(SupervisorEvent::PollStarted).await;
                    let result = self.poll_cycle(session).await;
                    self.emit(SupervisorEvent::PollFinished).await;
                    if let Err(e) = result {
                        warn!(location = %self.group.location, error = %e, "poll cycle failed");
                        return SessionEnd::Reconnect;
                    }
                }
            }
        }
    }

    /// Returns `Some(end)` when the command terminates the session.
    async fn handle_command(
        &mut self,
        session: &Session,
        command: SupervisorCommand,
    ) -> Option<SessionEnd> {
        match command {
            SupervisorCommand::Ussd { text, reply } => {
                let result = session
                    .ops
                    .send_ussd(&text, session.config.command_timeout())
                    .await;
                let fatal = matches!(&result, Err(e) if e.is_connection_fatal());
                let _ = reply.send(result.map_err(Into::into));
                fatal.then_some(SessionEnd::Reconnect)
            }
            SupervisorCommand::ReadStored { all, reply } => {
                let result = session.ops.list_messages(all).await;
                let fatal = matches!(&result, Err(e) if e.is_connection_fatal());
                let _ = reply.send(result.map_err(Into::into));
                fatal.then_some(SessionEnd::Reconnect)
            }
            SupervisorCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot.clone());
                None
            }
            SupervisorCommand::SaveConfig { config, reply } => {
                let result = self.persist_config(config).await;
                let saved = result.is_ok();
                let _ = reply.send(result);
                saved.then_some(SessionEnd::Reconnect)
            }
            SupervisorCommand::Disconnect => Some(SessionEnd::Suspend),
            SupervisorCommand::Reconnect => Some(SessionEnd::Reconnect),
        }
    }

    async fn handle_event(
        &mut self,
        session: &Session,
        event: UnsolicitedEvent,
    ) -> Result<(), CoreError> {
        match event {
            UnsolicitedEvent::NewMessageIndex(tail) => {
                let Some(index) = parse_message_index(&tail) else {
                    warn!(tail, "unparseable +CMTI tail");
                    return Ok(());
                };
                let stored = session.ops.read_message(index).await?;
                self.ingest(session, stored).await
            }
            UnsolicitedEvent::SignalLevel(level) => {
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.signal = Some(level.clone());
                }
                self.emit(SupervisorEvent::Signal(level)).await;
                Ok(())
            }
            UnsolicitedEvent::VoltageWarning => {
                self.emit(SupervisorEvent::VoltageWarning).await;
                Ok(())
            }
            UnsolicitedEvent::SimError(detail) => {
                self.emit(SupervisorEvent::SimFault(detail)).await;
                Ok(())
            }
            // RING, +ZOPERTER and USSD results are not the session loop's
            // business; USSD is consumed by the in-flight command.
            _ => Ok(()),
        }
    }

    /// Periodic maintenance sweep: notice a SIM swapped (or inserted)
    /// without a replug, verify the memory banks are still aligned, and
    /// pick up any messages that arrived without a `+CMTI` notification.
    async fn poll_cycle(&mut self, session: &Session) -> Result<(), CoreError> {
        let imsi = session.ops.imsi().await?;
        let sim_present = imsi.is_some();
        let changed = match self.snapshot.as_mut() {
            Some(snapshot) if snapshot.imsi != imsi => {
                snapshot.sim = imsi.as_deref().and_then(resolve_sim);
                snapshot.imsi = imsi;
                Some(snapshot.clone())
            }
            _ => None,
        };
        if let Some(snapshot) = changed {
            info!(location = %self.group.location, "sim changed mid-session");
            self.emit(SupervisorEvent::Ready(Box::new(snapshot))).await;
        }

        // Without a SIM the storage commands all answer ERROR; the IMSI
        // read above already exercised the wire, which is all the
        // liveness check needs.
        if !sim_present {
            return Ok(());
        }

        let status = session.ops.memory_status().await?;
        if status.read.memory != status.receive.memory {
            normalize_memory(&session.ops).await;
        }
        self.drain_stored(session).await
    }

    async fn persist_config(&self, config: DeviceConfig) -> Result<(), CoreError> {
        let Some((vendor, product)) = self.group.hardware_id() else {
            return Err(CoreError::store("device has no hardware id"));
        };
        self.ctx
            .store
            .save_device_config(vendor, product, config)
            .await
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Read and ingest everything currently in device storage.
    async fn drain_stored(&mut self, session: &Session) -> Result<(), CoreError> {
        for stored in session.ops.list_messages(true).await? {
            self.ingest(session, stored).await?;
        }
        Ok(())
    }

    /// Feed one stored message through reassembly, persist and publish the
    /// result, then free the storage slot.
    async fn ingest(&mut self, session: &Session, stored: StoredSms) -> Result<(), CoreError> {
        if let Some(assembled) = self.reassembly.push(&stored.sms) {
            let message = IncomingMessage {
                location: self.group.location.clone(),
                sender: stored.sms.sender.clone(),
                text: assembled.text,
                timestamp: stored.sms.timestamp,
                received_at: chrono::Utc::now(),
                parts: assembled.parts,
            };
            if let Err(e) = self.ctx.store.save_message(&message).await {
                warn!(error = %e, "failed to persist message");
            }
            self.emit(SupervisorEvent::Message(message)).await;
        }

        if !session.ops.delete_message(stored.index).await? {
            debug!(index = stored.index, "delete refused, stale index");
        }
        Ok(())
    }

    // ── Suspension / events ─────────────────────────────────────────

    /// Park until the operator reconnects the device. Returns `false` on
    /// shutdown.
    async fn wait_while_suspended(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return false,

                command = self.commands.recv() => match command {
                    None => return false,
                    Some(SupervisorCommand::Reconnect) => {
                        self.suspended = false;
                        return true;
                    }
                    Some(SupervisorCommand::Snapshot { reply }) => {
                        let _ = reply.send(self.snapshot.clone());
                    }
                    // Config can be edited while offline; it is picked up by
                    // the next connect.
                    Some(SupervisorCommand::SaveConfig { config, reply }) => {
                        let _ = reply.send(self.persist_config(config).await);
                    }
                    Some(SupervisorCommand::Disconnect) => {}
                    Some(SupervisorCommand::Ussd { reply, .. }) => {
                        let _ = reply.send(Err(CoreError::DeviceUnavailable {
                            location: self.group.location.clone(),
                        }));
                    }
                    Some(SupervisorCommand::ReadStored { reply, .. }) => {
                        let _ = reply.send(Err(CoreError::DeviceUnavailable {
                            location: self.group.location.clone(),
                        }));
                    }
                },
            }
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.state = state;
        }
        self.emit(SupervisorEvent::State(state)).await;
    }

    async fn emit(&self, event: SupervisorEvent) {
        let _ = self
            .ctx
            .events
            .send((self.group.location.clone(), event))
            .await;
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Put read/receive storage on the same memory. Preferring modem flash;
/// SIM storage only when flash is not offered. Any failure along the way
/// falls back to forcing flash across the board, matching what the widest
/// range of sticks tolerates.
async fn normalize_memory(ops: &ModemOps) {
    let attempt = async {
        let status = ops.memory_status().await?;
        if status.read.memory != status.receive.memory {
            let supported = ops.supported_read_memory_types().await?;
            let target = if supported.contains(&MemoryType::Me) {
                MemoryType::Me
            } else {
                MemoryType::Sm
            };
            ops.set_memory(target, target, target).await?;
        }
        Ok::<_, gsmfleet_at::AtError>(())
    };

    if let Err(e) = attempt.await {
        debug!(error = %e, "memory normalization failed, forcing flash");
        if let Err(e) = ops
            .set_memory(MemoryType::Me, MemoryType::Me, MemoryType::Me)
            .await
        {
            debug!(error = %e, "fallback memory selection failed");
        }
    }
}

/// `+CMTI: "<mem>",<index>` tail without the prefix.
fn parse_message_index(tail: &str) -> Option<u32> {
    tail.rsplit(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cmti_tail_yields_storage_index() {
        assert_eq!(parse_message_index("\"ME\",3"), Some(3));
        assert_eq!(parse_message_index("\"SM\", 17"), Some(17));
        assert_eq!(parse_message_index("garbage"), None);
    }
}
