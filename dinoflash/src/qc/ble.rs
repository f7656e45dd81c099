//! BLE transport seam and its btleplug implementation.

use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, warn};

use super::{CONTROL_UUID, EVENTS_UUID, QcConfig, QcOutcome, QcSession, SERVICE_UUID};
use crate::error::{Error, Result};
use crate::event::EventSink;

/// Finds and connects to peripherals.
#[allow(async_fn_in_trait)]
pub trait BleCentral {
    /// Connected peripheral type.
    type Link: BleLink;

    /// Scan for `window` and return the addresses seen.
    async fn scan(&mut self, window: Duration) -> Result<Vec<String>>;

    /// Connect to `address` and resolve the QC characteristics.
    async fn connect(&mut self, address: &str) -> Result<Self::Link>;
}

/// A connected QC peripheral.
#[allow(async_fn_in_trait)]
pub trait BleLink {
    /// Enable notifications on the event characteristic.
    async fn subscribe_events(&mut self) -> Result<()>;

    /// Write to the control characteristic, with response.
    async fn write_command(&mut self, data: &[u8]) -> Result<()>;

    /// Next event notification, `None` once the stream ends.
    async fn next_notification(&mut self) -> Option<Vec<u8>>;

    /// Drop the connection.
    async fn disconnect(&mut self) -> Result<()>;
}

/// [`BleCentral`] on the first system Bluetooth adapter.
pub struct BtleplugCentral {
    adapter: Adapter,
}

impl BtleplugCentral {
    /// Open the first adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("No Bluetooth adapter found".to_string()))?;
        Ok(Self { adapter })
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if address_of(&peripheral).await.eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
        Err(Error::Protocol(format!("{address} is no longer visible")))
    }
}

async fn address_of(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address != BDAddr::default() {
        return address.to_string();
    }
    // Some platforms hide the address on the peripheral but keep it in the properties.
    match peripheral.properties().await {
        Ok(Some(props)) => props.address.to_string(),
        _ => address.to_string(),
    }
}

impl BleCentral for BtleplugCentral {
    type Link = BtleplugLink;

    async fn scan(&mut self, window: Duration) -> Result<Vec<String>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(window).await;

        let mut addresses = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            addresses.push(address_of(&peripheral).await);
        }

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan failed: {e}");
        }
        Ok(addresses)
    }

    async fn connect(&mut self, address: &str) -> Result<BtleplugLink> {
        let peripheral = self.peripheral(address).await?;
        peripheral.connect().await?;

        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(e.into());
        }

        if !peripheral.services().iter().any(|s| s.uuid == SERVICE_UUID) {
            let _ = peripheral.disconnect().await;
            return Err(Error::Protocol(
                "Device does not expose the QC service".to_string(),
            ));
        }

        let characteristics = peripheral.characteristics();
        let find = |uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let (Some(control), Some(events)) = (find(CONTROL_UUID), find(EVENTS_UUID)) else {
            let _ = peripheral.disconnect().await;
            return Err(Error::Protocol(
                "QC characteristics not found".to_string(),
            ));
        };

        Ok(BtleplugLink {
            peripheral,
            control,
            events,
            notifications: None,
        })
    }
}

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Connected btleplug peripheral.
pub struct BtleplugLink {
    peripheral: Peripheral,
    control: Characteristic,
    events: Characteristic,
    notifications: Option<NotificationStream>,
}

impl BleLink for BtleplugLink {
    async fn subscribe_events(&mut self) -> Result<()> {
        self.peripheral.subscribe(&self.events).await?;
        self.notifications = Some(self.peripheral.notifications().await?);
        Ok(())
    }

    async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.control, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn next_notification(&mut self) -> Option<Vec<u8>> {
        let stream = self.notifications.as_mut()?;
        while let Some(notification) = stream.next().await {
            if notification.uuid == EVENTS_UUID {
                return Some(notification.value);
            }
        }
        None
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.peripheral.unsubscribe(&self.events).await.is_err() {
            debug!("unsubscribe failed");
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Runs a QC session to completion from synchronous code.
pub trait QcRunner: Send + Sync {
    /// Test the toy advertising as `mac`.
    fn run_qc(&self, mac: &str, events: &EventSink) -> QcOutcome;
}

/// [`QcRunner`] on a dedicated current-thread tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct BtleplugQcRunner {
    config: QcConfig,
}

impl BtleplugQcRunner {
    /// Create a runner with `config`.
    pub fn new(config: QcConfig) -> Self {
        Self { config }
    }
}

impl QcRunner for BtleplugQcRunner {
    fn run_qc(&self, mac: &str, events: &EventSink) -> QcOutcome {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("Could not start BLE runtime: {e}");
                return QcOutcome::ConnectFailed(e.to_string());
            },
        };

        runtime.block_on(async {
            let central = match BtleplugCentral::new().await {
                Ok(central) => central,
                Err(e) => return QcOutcome::ConnectFailed(e.to_string()),
            };
            QcSession::new(central, self.config.clone(), events.clone())
                .run(mac)
                .await
        })
    }
}
