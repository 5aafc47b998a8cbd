// ── Port discovery ──
//
// Periodically enumerates USB serial ports and groups them into physical
// devices. The fleet manager diffs successive passes to decide which
// supervisors to start and stop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::trace;

use crate::error::CoreError;
use crate::model::{DeviceGroup, DiscoveredPort, UsbLocationId};

/// Enumerates candidate modem ports.
#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<DiscoveredPort>, CoreError>;
}

/// Scanner over the operating system's USB serial devices.
#[derive(Debug, Default)]
pub struct SerialPortScanner;

#[async_trait]
impl PortScanner for SerialPortScanner {
    async fn scan(&self) -> Result<Vec<DiscoveredPort>, CoreError> {
        // Port enumeration does blocking ioctls.
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| CoreError::Discovery {
                message: e.to_string(),
            })?
            .map_err(|e| CoreError::Discovery {
                message: e.to_string(),
            })?;

        let discovered = ports
            .into_iter()
            .filter_map(|info| match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(DiscoveredPort {
                    name: info.port_name,
                    location: location_of(&usb),
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                }),
                _ => None,
            })
            .collect::<Vec<_>>();

        trace!(ports = discovered.len(), "discovery pass");
        Ok(discovered)
    }
}

/// Identity of the physical device a port belongs to. The enumeration API
/// gives no bus position, so vendor/product/serial stands in for it; sticks
/// without a serial string and identical hardware ids will collide.
fn location_of(usb: &serialport::UsbPortInfo) -> UsbLocationId {
    let serial = usb.serial_number.as_deref().unwrap_or("-");
    UsbLocationId::new(format!("{:04x}:{:04x}:{serial}", usb.vid, usb.pid))
}

/// Group a discovery pass into physical devices, ports in name order so
/// probing is deterministic.
pub fn group_by_location(ports: Vec<DiscoveredPort>) -> Vec<DeviceGroup> {
    let mut groups: BTreeMap<UsbLocationId, Vec<DiscoveredPort>> = BTreeMap::new();
    for port in ports {
        groups.entry(port.location.clone()).or_default().push(port);
    }
    groups
        .into_iter()
        .map(|(location, mut ports)| {
            ports.sort_by(|a, b| a.name.cmp(&b.name));
            DeviceGroup { location, ports }
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────
