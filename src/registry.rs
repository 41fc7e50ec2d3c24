//! Ownership of the per-trap trackers, keyed by BLE address.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, warn};
use mac_address::MacAddress;

use crate::advertisement::TRAP_COMPANY_IDS;
use crate::config::AppConfig;
use crate::error::DecodeError;
use crate::tracker::{AdvertisementOutcome, DeviceStateTracker};
use crate::transport::GattTransport;

pub struct TrapRegistry<T> {
    trackers: HashMap<MacAddress, Arc<DeviceStateTracker<T>>>,
}

impl<T: GattTransport> TrapRegistry<T> {
    pub fn new() -> Self {
        TrapRegistry {
            trackers: HashMap::new(),
        }
    }

    /// One tracker per configured device, all sharing `transport`.
    pub fn from_config(config: &AppConfig, transport: Arc<T>) -> Self {
        let options = config.tracker().options();
        let mut registry = Self::new();
        for device in config.devices() {
            registry.insert(DeviceStateTracker::new(
                device.identity(),
                device.battery_model(),
                options.clone(),
                transport.clone(),
            ));
        }
        registry
    }

    pub fn insert(&mut self, tracker: DeviceStateTracker<T>) -> Arc<DeviceStateTracker<T>> {
        let address = tracker.identity().address;
        let tracker = Arc::new(tracker);
        if let Some(previous) = self.trackers.insert(address, tracker.clone()) {
            warn!(
                "{} is configured more than once, replacing {:?} with {:?}",
                address,
                previous.identity().name,
                tracker.identity().name
            );
        }
        tracker
    }

    pub fn get(&self, address: &MacAddress) -> Option<&Arc<DeviceStateTracker<T>>> {
        self.trackers.get(address)
    }

    pub fn find(
        &self,
        mut predicate: impl FnMut(&DeviceStateTracker<T>) -> bool,
    ) -> Option<&Arc<DeviceStateTracker<T>>> {
        self.trackers.values().find(|&t| predicate(t))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceStateTracker<T>>> {
        self.trackers.values()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Route one scan event to the tracker for `address`.
    ///
    /// Returns `None` when the address is not a configured trap or the event
    /// carries nothing usable. Malformed payloads are logged and dropped; an
    /// unknown trigger byte is treated as "state unchanged" so a firmware
    /// update cannot blank out the last known state.
    pub fn handle_advertisement(
        &self,
        address: &MacAddress,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
        at: SystemTime,
    ) -> Option<AdvertisementOutcome> {
        let tracker = self.trackers.get(address)?;

        let Some((company_id, data)) = TRAP_COMPANY_IDS
            .iter()
            .find_map(|id| manufacturer_data.get(id).map(|data| (*id, data)))
        else {
            debug!(
                "Advertisement from {} ignored: no trap manufacturer data (ids: {:04X?})",
                address,
                manufacturer_data.keys().collect::<Vec<_>>()
            );
            return None;
        };

        match tracker.ingest(data, company_id, at) {
            Ok(outcome) => Some(outcome),
            Err(DecodeError::UnknownTriggerByte(byte)) => {
                debug!(
                    "Unknown trigger byte 0x{:02X} from {}, keeping previous state: {}",
                    byte,
                    address,
                    hex::encode_upper(data)
                );
                None
            }
            Err(err) => {
                debug!(
                    "Dropping advertisement from {}: {}: {}",
                    address,
                    err,
                    hex::encode_upper(data)
                );
                None
            }
        }
    }
}

impl<T: GattTransport> Default for TrapRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
