//! Headless fleet daemon: plugs the serial transport and JSON store into
//! the fleet manager and streams events to stdout until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use gsmfleet_at::SerialOpener;
use gsmfleet_core::discovery::{self, PortScanner, SerialPortScanner};
use gsmfleet_core::model::{FleetEvent, SupervisorEvent};
use gsmfleet_core::{FleetManager, FleetOptions, JsonStore};

#[derive(Parser)]
#[command(name = "gsmfleet", version, about = "GSM modem fleet daemon")]
struct Cli {
    /// Path of the JSON state file.
    #[arg(long, default_value = "fleet.json", global = true)]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise every attached modem until interrupted.
    Run {
        /// Seconds between discovery passes.
        #[arg(long, default_value_t = 5)]
        discovery_interval: u64,

        /// Seconds a new device may take to come online.
        #[arg(long, default_value_t = 15)]
        connect_budget: u64,

        /// Seconds between per-device maintenance polls.
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,

        /// Emit events as JSON lines instead of log records.
        #[arg(long)]
        json: bool,
    },
    /// One discovery pass: list candidate modem ports and exit.
    Ports,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gsmfleet_at=info,gsmfleet_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            discovery_interval,
            connect_budget,
            poll_interval,
            json,
        } => {
            let options = FleetOptions {
                discovery_interval: Duration::from_secs(discovery_interval),
                connect_budget: Duration::from_secs(connect_budget),
                poll_interval: Duration::from_secs(poll_interval),
                ..FleetOptions::default()
            };
            run(cli.store, options, json).await
        }
        Command::Ports => ports().await,
    }
}

async fn run(store_path: PathBuf, options: FleetOptions, json: bool) -> anyhow::Result<()> {
    let store = JsonStore::open(&store_path)
        .await
        .with_context(|| format!("opening store {}", store_path.display()))?;

    let manager = FleetManager::start(
        Arc::new(SerialPortScanner),
        Arc::new(SerialOpener),
        Arc::new(store),
        options,
    );
    let mut events = manager.events();
    info!(store = %store_path.display(), "fleet daemon started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event, json),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown();
    Ok(())
}

fn report(event: &FleetEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "event serialization failed"),
        }
        return;
    }

    match event {
        FleetEvent::Loading { active } => debug!(active, "connect batch"),
        FleetEvent::DeviceDiscovered { location, ports } => {
            info!(%location, ?ports, "device discovered");
        }
        FleetEvent::DeviceRemoved { location } => info!(%location, "device removed"),
        FleetEvent::Device { location, event } => match event {
            SupervisorEvent::State(state) => info!(%location, %state, "state"),
            SupervisorEvent::Ready(snapshot) => info!(
                %location,
                port = %snapshot.port,
                model = %snapshot.identity.model,
                imsi = snapshot.imsi.as_deref().unwrap_or("-"),
                operator = snapshot
                    .sim
                    .as_ref()
                    .and_then(|s| s.operator.as_deref())
                    .unwrap_or("-"),
                "device ready"
            ),
            SupervisorEvent::Message(message) => info!(
                %location,
                sender = %message.sender,
                parts = message.parts,
                text = %message.text,
                "message"
            ),
            SupervisorEvent::Signal(level) => info!(%location, level, "signal"),
            SupervisorEvent::PollStarted | SupervisorEvent::PollFinished => {
                debug!(%location, ?event, "poll");
            }
            SupervisorEvent::VoltageWarning => warn!(%location, "over-voltage warning"),
            SupervisorEvent::SimFault(detail) => warn!(%location, detail, "sim fault"),
            SupervisorEvent::PortError { port, message } => {
                warn!(%location, port, message, "port error");
            }
            SupervisorEvent::Failed { message } => warn!(%location, message, "device failed"),
        },
    }
}

async fn ports() -> anyhow::Result<()> {
    let found = SerialPortScanner.scan().await.context("discovery pass")?;
    if found.is_empty() {
        println!("no USB serial ports found");
        return Ok(());
    }

    for group in discovery::group_by_location(found) {
        println!("{}", group.location);
        for port in &group.ports {
            println!(
                "  {}  {:04x}:{:04x}  {}",
                port.name,
                port.vendor_id,
                port.product_id,
                port.product.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(())
}
