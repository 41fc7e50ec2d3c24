//! Per-trap state tracking.
//!
//! A [`DeviceStateTracker`] owns the last known state of one physical trap.
//! Advertisements are applied synchronously under a short lock and never wait
//! on GATT. Connected operations (reset, name, trigger read) are serialized by
//! a separate async lock and only take the state lock once the transport has
//! answered.
//!
//! Out-of-order advertisements: the advertisement with the latest timestamp
//! is authoritative. One older than `last_seen` is dropped unless
//! `accept_out_of_order` is set, in which case its status and battery are
//! applied but `last_seen` still never moves backwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use log::{debug, error, info};
use mac_address::MacAddress;
use tokio::sync::watch;

use crate::advertisement::{self, DeviceStatus};
use crate::battery::{BatteryModel, BatteryReading};
use crate::command::{self, NAME_CHAR_UUID, TRIGGER_CHAR_UUID};
use crate::error::{DecodeError, GattError, ResetError};
use crate::transport::GattTransport;

/// Name and address of a configured trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub address: MacAddress,
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub accept_out_of_order: bool,
    /// Size of the name characteristic in bytes
    pub name_max_len: usize,
    /// Pause after a successful reset before the next GATT operation may run
    pub reset_settle: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        TrackerOptions {
            accept_out_of_order: false,
            name_max_len: 20,
            reset_settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrapState {
    pub last_status: Option<DeviceStatus>,
    /// Set by advertisements, resets and connected trigger reads
    pub triggered: Option<bool>,
    pub last_battery: Option<BatteryReading>,
    pub last_seen: Option<SystemTime>,
    pub device_name: Option<String>,
    /// Last accepted manufacturer payload, uppercase hex
    pub raw: Option<String>,
}

/// Read-only view handed to the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrapSnapshot {
    pub triggered: Option<bool>,
    pub battery_voltage: Option<f64>,
    pub battery_percentage: Option<u8>,
    pub last_update: Option<SystemTime>,
    pub device_name: Option<String>,
    pub raw: Option<String>,
}

impl From<&TrapState> for TrapSnapshot {
    fn from(state: &TrapState) -> Self {
        TrapSnapshot {
            triggered: state.triggered,
            battery_voltage: state.last_battery.map(|b| b.voltage),
            battery_percentage: state.last_battery.map(|b| b.percentage),
            last_update: state.last_seen,
            device_name: state.device_name.clone(),
            raw: state.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Unknown,
    Known,
    Stale,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Unknown => "unknown",
            TrackerState::Known => "known",
            TrackerState::Stale => "stale",
        }
    }
}

/// What [`DeviceStateTracker::on_advertisement`] did with an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementOutcome {
    Applied,
    /// Older than `last_seen`, status applied because the policy allows it
    AppliedOutOfOrder,
    /// Older than `last_seen` and dropped
    Discarded,
}

pub struct DeviceStateTracker<T> {
    identity: DeviceIdentity,
    battery: BatteryModel,
    options: TrackerOptions,
    transport: Arc<T>,
    state: Mutex<TrapState>,
    gatt: tokio::sync::Mutex<()>,
    updates: watch::Sender<TrapSnapshot>,
}

impl<T: GattTransport> DeviceStateTracker<T> {
    pub fn new(
        identity: DeviceIdentity,
        battery: BatteryModel,
        options: TrackerOptions,
        transport: Arc<T>,
    ) -> Self {
        let (updates, _) = watch::channel(TrapSnapshot::default());
        DeviceStateTracker {
            identity,
            battery,
            options,
            transport,
            state: Mutex::new(TrapState::default()),
            gatt: tokio::sync::Mutex::new(()),
            updates,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn snapshot(&self) -> TrapSnapshot {
        TrapSnapshot::from(&*self.lock())
    }

    /// Receiver that sees a new snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<TrapSnapshot> {
        self.updates.subscribe()
    }

    /// True when nothing has been seen yet or the last advertisement is older
    /// than `window`.
    pub fn is_stale(&self, now: SystemTime, window: Duration) -> bool {
        is_stale(self.lock().last_seen, now, window)
    }

    pub fn state(&self, now: SystemTime, window: Duration) -> TrackerState {
        let last_seen = self.lock().last_seen;
        match last_seen {
            None => TrackerState::Unknown,
            Some(_) if is_stale(last_seen, now, window) => TrackerState::Stale,
            Some(_) => TrackerState::Known,
        }
    }

    pub fn on_advertisement(&self, status: DeviceStatus, at: SystemTime) -> AdvertisementOutcome {
        self.apply(status, at, None)
    }

    /// Decode a manufacturer payload and apply it. On error nothing changes.
    pub fn ingest(
        &self,
        manufacturer_data: &[u8],
        company_id: u16,
        at: SystemTime,
    ) -> Result<AdvertisementOutcome, DecodeError> {
        let status = advertisement::decode(manufacturer_data, company_id)?;
        let raw = hex::encode_upper(manufacturer_data);
        Ok(self.apply(status, at, Some(raw)))
    }

    fn apply(&self, status: DeviceStatus, at: SystemTime, raw: Option<String>) -> AdvertisementOutcome {
        let battery = self.battery.compute(status.battery_raw);
        let accept_out_of_order = self.options.accept_out_of_order;

        let outcome = self.update(|state| {
            let outcome = match state.last_seen {
                Some(seen) if at < seen && !accept_out_of_order => {
                    return AdvertisementOutcome::Discarded;
                }
                Some(seen) if at < seen => AdvertisementOutcome::AppliedOutOfOrder,
                _ => {
                    state.last_seen = Some(at);
                    AdvertisementOutcome::Applied
                }
            };
            state.last_status = Some(status);
            state.triggered = Some(status.triggered);
            state.last_battery = Some(battery);
            if raw.is_some() {
                state.raw = raw;
            }
            outcome
        });

        debug!(
            "{} ({}): triggered={} voltage={:.2} battery={}% -> {:?}",
            self.identity.name,
            self.identity.address,
            status.triggered,
            battery.voltage,
            battery.percentage,
            outcome
        );
        outcome
    }

    /// Re-arm the trap.
    ///
    /// On success `triggered` is cleared right away without waiting for the
    /// next advertisement; the trap's own broadcasts correct it if the write
    /// did not take. On failure the state is left untouched.
    pub async fn reset(&self) -> Result<(), ResetError> {
        let _gatt = self.gatt.lock().await;

        let command = command::encode_reset();
        if let Err(err) = self
            .transport
            .write(self.identity.address, TRIGGER_CHAR_UUID, &command)
            .await
        {
            error!("Failed to reset trap {}: {}", self.identity.name, err);
            return Err(err.into());
        }

        self.update(|state| state.triggered = Some(false));
        info!("Reset command sent to {}", self.identity.name);

        if !self.options.reset_settle.is_zero() {
            tokio::time::sleep(self.options.reset_settle).await;
        }
        Ok(())
    }

    /// Read the trigger characteristic directly instead of waiting for an
    /// advertisement.
    pub async fn refresh_trigger(&self) -> Result<bool, GattError> {
        let _gatt = self.gatt.lock().await;

        let data = self
            .transport
            .read(self.identity.address, TRIGGER_CHAR_UUID)
            .await?;
        let triggered = command::decode_trigger_characteristic(&data)?;

        self.update(|state| state.triggered = Some(triggered));
        Ok(triggered)
    }

    pub async fn read_name(&self) -> Result<String, GattError> {
        let _gatt = self.gatt.lock().await;

        let data = self
            .transport
            .read(self.identity.address, NAME_CHAR_UUID)
            .await?;
        let name = command::decode_name(&data);

        self.update(|state| state.device_name = Some(name.clone()));
        Ok(name)
    }

    pub async fn write_name(&self, new_name: &str) -> Result<(), GattError> {
        let payload = command::encode_name(new_name, self.options.name_max_len)?;

        let _gatt = self.gatt.lock().await;
        if let Err(err) = self
            .transport
            .write(self.identity.address, NAME_CHAR_UUID, &payload)
            .await
        {
            error!("Failed to rename trap {}: {}", self.identity.name, err);
            return Err(err.into());
        }

        self.update(|state| state.device_name = Some(new_name.to_string()));
        info!("Renamed {} to {:?}", self.identity.name, new_name);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TrapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the state and notify subscribers while still holding the lock,
    /// so snapshots are published in mutation order.
    fn update<R>(&self, f: impl FnOnce(&mut TrapState) -> R) -> R {
        let mut state = self.lock();
        let before = state.clone();
        let result = f(&mut state);
        if *state != before {
            self.updates.send_replace(TrapSnapshot::from(&*state));
        }
        result
    }
}

fn is_stale(last_seen: Option<SystemTime>, now: SystemTime, window: Duration) -> bool {
    match last_seen {
        None => true,
        // A last_seen in the future (clock adjustment) counts as fresh.
        Some(seen) => now.duration_since(seen).is_ok_and(|age| age > window),
    }
}
