//! # dinoflash
//!
//! A library for provisioning ESP32-S3 toys on a factory station.
//!
//! One device at a time goes through:
//!
//! - detection of exactly one ESP32-S3 on USB ([`device`])
//! - hardware version provisioning in eFuse `BLOCK3` ([`efuse`])
//! - firmware download and flashing ([`firmware`])
//! - BLE identity capture from the boot log ([`monitor`])
//! - microphone QC over Bluetooth LE ([`qc`])
//! - inventory reporting ([`inventory`])
//!
//! [`lifecycle::DeviceController`] binds these phases together and enforces
//! the retry and verification policy. Every component reports progress
//! through an [`event::EventSink`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dinoflash::device::NativePortEnumerator;
//! use dinoflash::event::EventSink;
//! use dinoflash::firmware::{DEFAULT_CATALOG_URL, HttpCatalog};
//! use dinoflash::inventory::{DEFAULT_INVENTORY_URL, HttpInventoryReporter};
//! use dinoflash::lifecycle::{ControllerSettings, DeviceController, Station};
//! use dinoflash::monitor::SerialBootWatcher;
//! use dinoflash::qc::BtleplugQcRunner;
//! use dinoflash::tool::SystemToolRunner;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ports = Arc::new(NativePortEnumerator);
//!     let station = Station {
//!         ports: ports.clone(),
//!         tools: Arc::new(SystemToolRunner),
//!         catalog: Arc::new(HttpCatalog::new(DEFAULT_CATALOG_URL)?),
//!         watcher: Arc::new(SerialBootWatcher::new(ports)),
//!         qc: Arc::new(BtleplugQcRunner::default()),
//!         reporter: Arc::new(HttpInventoryReporter::new(DEFAULT_INVENTORY_URL)?),
//!     };
//!
//!     let (events, _rx) = EventSink::channel();
//!     let mut controller = DeviceController::new(station, ControllerSettings::default(), events);
//!     controller.accept_toy_id("https://bondu.com/toy/2drvff")?;
//!     println!("{}", controller.begin_device());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod efuse;
pub mod error;
pub mod event;
pub mod firmware;
pub mod inventory;
pub mod lifecycle;
pub mod monitor;
pub mod qc;
pub mod session;
pub mod tool;
pub mod version;

pub use device::{DetectedPort, PortEnumerator, ScanResult, ScanStatus, UsbId};
pub use error::{Error, Result};
pub use event::{Event, EventSink, Tone};
pub use firmware::Mode;
pub use lifecycle::{ControllerSettings, DeviceController, DeviceOutcome, Station, WorkflowState};
pub use session::ToyId;
pub use version::HardwareVersion;
