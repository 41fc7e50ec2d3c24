//! Monitor battery powered BLE mouse traps.
//!
//! The trap broadcasts its state in manufacturer specific advertisement data
//! (trigger flag plus a raw battery code) and exposes two GATT characteristics:
//! one to read and reset the trigger state, one holding its name.
//!
//! - [`advertisement`] decodes the advertisement payload
//! - [`battery`] turns the raw battery code into volts and a percentage
//! - [`command`] encodes the reset command and the name characteristic
//! - [`tracker`] keeps the last known state of one trap and runs GATT operations
//! - [`registry`] owns one tracker per configured trap
//!
//! The remaining modules wire this up to btleplug and MQTT for the
//! `trap-monitor` daemon.
//!
//! # Example
//!
//! ```rust
//! let ad = hex::decode("0201060303D6FC0DFFBB0B001AAC12030001B80100").unwrap();
//! let (company_id, data) = trap_monitor::advertisement::manufacturer_data_from_ad(&ad).unwrap();
//! let status = trap_monitor::advertisement::decode(data, company_id).unwrap();
//! let battery = trap_monitor::battery::compute(status.battery_raw);
//! assert!(!status.triggered);
//! assert_eq!(battery.percentage, 50);
//! ```

pub mod advertisement;
pub mod battery;
pub mod command;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod mqtt;
pub mod registry;
pub mod tracker;
pub mod transport;

pub use advertisement::DeviceStatus;
pub use battery::{BatteryModel, BatteryReading};
pub use error::{DecodeError, GattError, ResetError, TransportError};
pub use registry::TrapRegistry;
pub use tracker::{DeviceIdentity, DeviceStateTracker, TrackerState, TrapSnapshot};
pub use transport::{BtleplugTransport, GattTransport};
