// ── Fleet manager ──
//
// Single task that owns the fleet table. It periodically diffs the USB
// serial tree against the set of supervised devices, starts and stops
// supervisors accordingly, relays their events on one broadcast stream,
// and routes operator commands to the right device. All mutation of the
// table happens inside the actor loop; handles only pass messages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gsmfleet_at::{StoredSms, TransportOpener, UssdReply};

use crate::config::DeviceConfig;
use crate::discovery::{self, PortScanner};
use crate::error::CoreError;
use crate::model::{
    ConnectionState, DeviceGroup, DeviceSnapshot, FleetEvent, SupervisorEvent, UsbLocationId,
};
use crate::store::FleetStore;
use crate::supervisor::{
    DeviceSupervisor, SupervisorCommand, SupervisorContext, SupervisorHandle,
};

const COMMAND_QUEUE: usize = 32;
const DEVICE_EVENT_QUEUE: usize = 256;
const FLEET_EVENT_QUEUE: usize = 256;

// ── Options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Period between discovery passes.
    pub discovery_interval: Duration,
    /// How long a freshly discovered device may take to come online.
    pub connect_budget: Duration,
    /// How long a stopping supervisor may take to wind down.
    pub stop_grace: Duration,
    /// Per-device liveness poll period.
    pub poll_interval: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(5),
            connect_budget: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
        }
    }
}

// ── Reconciliation ───────────────────────────────────────────────────

/// Difference between what is tracked and what discovery found.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FleetDiff {
    pub to_start: Vec<DeviceGroup>,
    pub to_stop: Vec<UsbLocationId>,
}

/// Pure diff: groups not yet tracked are started, tracked locations no
/// longer present are stopped.
pub fn reconcile(tracked: &HashSet<UsbLocationId>, discovered: &[DeviceGroup]) -> FleetDiff {
    let present: HashSet<&UsbLocationId> = discovered.iter().map(|g| &g.location).collect();
    FleetDiff {
        to_start: discovered
            .iter()
            .filter(|g| !tracked.contains(&g.location))
            .cloned()
            .collect(),
        to_stop: tracked
            .iter()
            .filter(|loc| !present.contains(loc))
            .cloned()
            .collect(),
    }
}

// ── Handle ───────────────────────────────────────────────────────────

enum FleetCommand {
    Devices {
        reply: oneshot::Sender<Vec<DeviceSnapshot>>,
    },
    Ussd {
        location: UsbLocationId,
        text: String,
        reply: oneshot::Sender<Result<UssdReply, CoreError>>,
    },
    ReadStored {
        location: UsbLocationId,
        all: bool,
        reply: oneshot::Sender<Result<Vec<StoredSms>, CoreError>>,
    },
    SaveConfig {
        location: UsbLocationId,
        config: DeviceConfig,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Disconnect {
        location: UsbLocationId,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Reconnect {
        location: UsbLocationId,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

/// Handle onto the running fleet. Cheap to clone.
#[derive(Clone)]
pub struct FleetManager {
    commands: mpsc::Sender<FleetCommand>,
    events: broadcast::Sender<FleetEvent>,
    cancel: CancellationToken,
}

impl FleetManager {
    /// Start the fleet task over the given scanner, transport, and store.
    pub fn start(
        scanner: Arc<dyn PortScanner>,
        opener: Arc<dyn TransportOpener>,
        store: Arc<dyn FleetStore>,
        options: FleetOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, _) = broadcast::channel(FLEET_EVENT_QUEUE);
        let (device_tx, device_rx) = mpsc::channel(DEVICE_EVENT_QUEUE);
        let cancel = CancellationToken::new();

        let context = SupervisorContext {
            opener,
            store,
            events: device_tx,
            poll_interval: options.poll_interval,
        };
        let task = FleetTask {
            scanner,
            options,
            commands: cmd_rx,
            fleet_events: event_tx.clone(),
            device_events: device_rx,
            context,
            devices: HashMap::new(),
            loading: false,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self {
            commands: cmd_tx,
            events: event_tx,
            cancel,
        }
    }

    /// Subscribe to the fleet event stream.
    pub fn events(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Snapshots of every device that has completed a connect.
    pub async fn devices(&self) -> Result<Vec<DeviceSnapshot>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Devices { reply }).await?;
        rx.await.map_err(|_| CoreError::Closed)
    }

    /// Run a USSD session on one device.
    pub async fn send_ussd(
        &self,
        location: UsbLocationId,
        text: impl Into<String>,
    ) -> Result<UssdReply, CoreError> {
        let (reply, rx) = oneshot::channel();
        let unavailable = location.clone();
        self.send(FleetCommand::Ussd {
            location,
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| CoreError::DeviceUnavailable {
            location: unavailable,
        })?
    }

    /// List messages stored on one device without consuming them.
    pub async fn read_stored(
        &self,
        location: UsbLocationId,
        all: bool,
    ) -> Result<Vec<StoredSms>, CoreError> {
        let (reply, rx) = oneshot::channel();
        let unavailable = location.clone();
        self.send(FleetCommand::ReadStored {
            location,
            all,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CoreError::DeviceUnavailable {
            location: unavailable,
        })?
    }

    /// Persist new connection parameters for one device and restart its
    /// session so they take effect.
    pub async fn save_device_config(
        &self,
        location: UsbLocationId,
        config: DeviceConfig,
    ) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        let unavailable = location.clone();
        self.send(FleetCommand::SaveConfig {
            location,
            config,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CoreError::DeviceUnavailable {
            location: unavailable,
        })?
    }

    /// Take one device offline until `reconnect`.
    pub async fn disconnect(&self, location: UsbLocationId) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Disconnect { location, reply }).await?;
        rx.await.map_err(|_| CoreError::Closed)?
    }

    /// Bring a disconnected device back, or force a fresh session.
    pub async fn reconnect(&self, location: UsbLocationId) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Reconnect { location, reply }).await?;
        rx.await.map_err(|_| CoreError::Closed)?
    }

    /// Stop the fleet and every supervisor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, command: FleetCommand) -> Result<(), CoreError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CoreError::Closed)
    }
}

// ── Fleet task ───────────────────────────────────────────────────────

struct TrackedDevice {
    handle: SupervisorHandle,
    snapshot: Option<DeviceSnapshot>,
    state: ConnectionState,
    /// Set while the initial connect is running; cleared on `Ready`.
    connect_deadline: Option<Instant>,
}

struct FleetTask {
    scanner: Arc<dyn PortScanner>,
    options: FleetOptions,
    commands: mpsc::Receiver<FleetCommand>,
    fleet_events: broadcast::Sender<FleetEvent>,
    device_events: mpsc::Receiver<(UsbLocationId, SupervisorEvent)>,
    context: SupervisorContext,
    devices: HashMap<UsbLocationId, TrackedDevice>,
    /// True while a connect batch holds the bus; mirrored to subscribers
    /// as [`FleetEvent::Loading`].
    loading: bool,
    cancel: CancellationToken,
}

impl FleetTask {
    async fn run(mut self) {
        let mut discovery = tokio::time::interval(self.options.discovery_interval);
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let budget_deadline = self
                .devices
                .values()
                .filter_map(|d| d.connect_deadline)
                .min()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            let connecting = self.devices.values().any(|d| d.connect_deadline.is_some());

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }

                event = self.device_events.recv() => {
                    // Sender side is held by this task's context; never None
                    // before cancellation.
                    if let Some((location, event)) = event {
                        self.handle_device_event(location, event);
                        self.update_loading();
                    }
                }

                _ = tokio::time::sleep_until(budget_deadline), if connecting => {
                    self.expire_overdue_connects();
                    self.update_loading();
                }

                _ = discovery.tick() => {
                    // Connect batches get the bus to themselves; discovery
                    // resumes once every pending connect settled.
                    if !connecting {
                        self.discover().await;
                        self.update_loading();
                    }
                }
            }
        }

        // Wind the fleet down.
        let grace = self.options.stop_grace;
        for (_, device) in self.devices.drain() {
            device.handle.stop(grace).await;
        }
    }

    // ── Discovery / reconciliation ──────────────────────────────────

    async fn discover(&mut self) {
        let ports = match self.scanner.scan().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "discovery pass failed");
                return;
            }
        };

        // Supervisors that failed on their own leave the table first so a
        // still-present device gets a fresh start.
        self.devices.retain(|_, d| !d.handle.is_finished());

        let tracked: HashSet<UsbLocationId> = self.devices.keys().cloned().collect();
        let diff = reconcile(&tracked, &discovery::group_by_location(ports));

        for location in diff.to_stop {
            if let Some(device) = self.devices.remove(&location) {
                info!(%location, "device unplugged");
                self.publish(FleetEvent::DeviceRemoved {
                    location: location.clone(),
                });
                let grace = self.options.stop_grace;
                tokio::spawn(device.handle.stop(grace));
            }
        }

        for group in diff.to_start {
            info!(location = %group.location, ports = group.ports.len(), "device discovered");
            self.publish(FleetEvent::DeviceDiscovered {
                location: group.location.clone(),
                ports: group.ports.iter().map(|p| p.name.clone()).collect(),
            });

            let location = group.location.clone();
            let handle = DeviceSupervisor::spawn(group, self.context.clone());
            self.devices.insert(
                location,
                TrackedDevice {
                    handle,
                    snapshot: None,
                    state: ConnectionState::Connecting,
                    connect_deadline: Some(Instant::now() + self.options.connect_budget),
                },
            );
        }
    }

    fn expire_overdue_connects(&mut self) {
        let now = Instant::now();
        let overdue: Vec<UsbLocationId> = self
            .devices
            .iter()
            .filter(|(_, d)| d.connect_deadline.is_some_and(|t| t <= now))
            .map(|(loc, _)| loc.clone())
            .collect();

        for location in overdue {
            if let Some(device) = self.devices.remove(&location) {
                warn!(%location, "connect budget exceeded");
                device.handle.abort();
                self.publish(FleetEvent::Device {
                    location: location.clone(),
                    event: SupervisorEvent::Failed {
                        message: "connect budget exceeded".into(),
                    },
                });
                self.publish(FleetEvent::DeviceRemoved { location });
            }
        }
    }

    // ── Device events ───────────────────────────────────────────────

    fn handle_device_event(&mut self, location: UsbLocationId, event: SupervisorEvent) {
        let mut remove = false;

        if let Some(device) = self.devices.get_mut(&location) {
            match &event {
                SupervisorEvent::Ready(snapshot) => {
                    device.snapshot = Some((**snapshot).clone());
                    device.connect_deadline = None;
                }
                SupervisorEvent::State(state) => {
                    device.state = *state;
                    if let Some(snapshot) = device.snapshot.as_mut() {
                        snapshot.state = *state;
                    }
                }
                SupervisorEvent::Signal(level) => {
                    if let Some(snapshot) = device.snapshot.as_mut() {
                        snapshot.signal = Some(level.clone());
                    }
                }
                SupervisorEvent::Failed { .. } => remove = true,
                _ => {}
            }
        } else {
            debug!(%location, "event from untracked device");
            return;
        }

        self.publish(FleetEvent::Device {
            location: location.clone(),
            event,
        });

        if remove && self.devices.remove(&location).is_some() {
            self.publish(FleetEvent::DeviceRemoved { location });
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    fn handle_command(&mut self, command: FleetCommand) {
        match command {
            FleetCommand::Devices { reply } => {
                let mut snapshots: Vec<DeviceSnapshot> = self
                    .devices
                    .values()
                    .filter_map(|d| d.snapshot.clone())
                    .collect();
                snapshots.sort_by(|a, b| a.location.cmp(&b.location));
                let _ = reply.send(snapshots);
            }
            FleetCommand::Ussd {
                location,
                text,
                reply,
            } => self.forward(&location, SupervisorCommand::Ussd { text, reply }),
            FleetCommand::ReadStored {
                location,
                all,
                reply,
            } => self.forward(&location, SupervisorCommand::ReadStored { all, reply }),
            FleetCommand::SaveConfig {
                location,
                config,
                reply,
            } => self.forward(&location, SupervisorCommand::SaveConfig { config, reply }),
            FleetCommand::Disconnect { location, reply } => {
                let result = self.forward_simple(&location, SupervisorCommand::Disconnect);
                let _ = reply.send(result);
            }
            FleetCommand::Reconnect { location, reply } => {
                let result = self.forward_simple(&location, SupervisorCommand::Reconnect);
                let _ = reply.send(result);
            }
        }
    }

    /// Hand a command (carrying its own reply channel) to a supervisor.
    /// Unknown devices and full queues drop the command; the caller
    /// observes the dropped reply channel as the device being unavailable.
    fn forward(&self, location: &UsbLocationId, command: SupervisorCommand) {
        match self.devices.get(location) {
            Some(device) => {
                if device.handle.try_send(command).is_err() {
                    debug!(%location, "supervisor queue full or gone");
                }
            }
            None => debug!(%location, "command for untracked device"),
        }
    }

    fn forward_simple(
        &self,
        location: &UsbLocationId,
        command: SupervisorCommand,
    ) -> Result<(), CoreError> {
        let device = self
            .devices
            .get(location)
            .ok_or_else(|| CoreError::DeviceNotFound {
                location: location.clone(),
            })?;
        device
            .handle
            .try_send(command)
            .map_err(|_| CoreError::DeviceUnavailable {
                location: location.clone(),
            })
    }

    /// Reflect whether any initial connect is still pending.
    fn update_loading(&mut self) {
        let active = self.devices.values().any(|d| d.connect_deadline.is_some());
        if active != self.loading {
            self.loading = active;
            self.publish(FleetEvent::Loading { active });
        }
    }

    fn publish(&self, event: FleetEvent) {
        let _ = self.fleet_events.send(event);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
