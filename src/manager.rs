use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use btleplug::api::{Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use mac_address::MacAddress;
use tokio::sync::broadcast;

use crate::config::TrackerConfig;
use crate::messages::{TrapAnnouncement, TrapCommand};
use crate::mqtt::{MqttClient, sanitize_name};
use crate::registry::TrapRegistry;
use crate::tracker::{DeviceStateTracker, TrackerState, TrapSnapshot};
use crate::transport::BtleplugTransport;

type Tracker = DeviceStateTracker<BtleplugTransport>;

pub struct Manager {
    adapter: Adapter,
    registry: Arc<TrapRegistry<BtleplugTransport>>,
    mqtt: Option<(MqttClient, rumqttc::EventLoop)>,
    tracker_config: TrackerConfig,
}

fn announcement(tracker: &Tracker, state: TrackerState, snapshot: TrapSnapshot) -> TrapAnnouncement {
    let identity = tracker.identity();
    TrapAnnouncement {
        name: identity.name.clone(),
        mac_address: identity.address.to_string(),
        state,
        snapshot,
    }
}

/// Only the readings, so a fresh timestamp alone does not trigger a publish.
fn readings_changed(previous: &TrapSnapshot, current: &TrapSnapshot) -> bool {
    previous.triggered != current.triggered
        || previous.battery_percentage != current.battery_percentage
        || previous.device_name != current.device_name
}

async fn publish(mqtt: Option<&MqttClient>, announcement: &TrapAnnouncement) {
    match mqtt {
        Some(client) => {
            if let Err(err) = client.announce_trap(announcement).await {
                error!("Error announcing trap {}: {:?}", announcement.name, err);
            }
        }
        None => info!(
            "{} ({}): {} triggered={:?} battery={:?}%",
            announcement.name,
            announcement.mac_address,
            announcement.state.as_str(),
            announcement.snapshot.triggered,
            announcement.snapshot.battery_percentage
        ),
    }
}

/// Forward every reading change of one tracker to the host.
fn spawn_publisher(tracker: Arc<Tracker>, mqtt: Option<MqttClient>, tracker_config: TrackerConfig) {
    let mut rx = tracker.subscribe();
    tokio::task::spawn(async move {
        let mut last = TrapSnapshot::default();
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            if !readings_changed(&last, &snapshot) {
                continue;
            }
            last = snapshot.clone();
            let state = tracker.state(SystemTime::now(), tracker_config.stale_after());
            publish(mqtt.as_ref(), &announcement(&tracker, state, snapshot)).await;
        }
    });
}

/// Run a host command on its own task so GATT never stalls the scan loop.
fn spawn_command(tracker: Arc<Tracker>, command: TrapCommand) {
    tokio::task::spawn(async move {
        let name = tracker.identity().name.clone();
        match command {
            TrapCommand::Reset(_) => {
                if let Err(err) = tracker.reset().await {
                    error!("Failed to reset mouse trap {}: {}", name, err);
                }
            }
            TrapCommand::Refresh(_) => {
                match tracker.refresh_trigger().await {
                    Ok(triggered) => debug!("{} trigger read: {}", name, triggered),
                    Err(err) => error!("Failed to read trigger state of {}: {}", name, err),
                }
                if let Err(err) = tracker.read_name().await {
                    error!("Failed to read name of {}: {}", name, err);
                }
            }
            TrapCommand::Rename { name: new_name, .. } => {
                if let Err(err) = tracker.write_name(&new_name).await {
                    error!("Failed to rename {}: {}", name, err);
                }
            }
        }
    });
}

impl Manager {
    pub fn new(
        adapter: Adapter,
        registry: Arc<TrapRegistry<BtleplugTransport>>,
        mqtt: Option<(MqttClient, rumqttc::EventLoop)>,
        tracker_config: TrackerConfig,
    ) -> Self {
        Manager {
            adapter,
            registry,
            mqtt,
            tracker_config,
        }
    }

    async fn handle_btle_event(&self, event: CentralEvent) -> Result<(), btleplug::Error> {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                let peripheral = self.adapter.peripheral(&id).await?;
                let address = MacAddress::new(peripheral.address().into_inner());
                self.registry
                    .handle_advertisement(&address, &manufacturer_data, SystemTime::now());
            }
            CentralEvent::DeviceDiscovered(id) => {
                debug!("DeviceDiscovered: {:?}", id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Republish everything, log state transitions and restart the scan when a
    /// reporting trap has gone quiet.
    async fn sweep(
        &self,
        mqtt: Option<&MqttClient>,
        previous: &mut HashMap<MacAddress, TrackerState>,
    ) -> Result<(), btleplug::Error> {
        let now = SystemTime::now();
        let window = self.tracker_config.stale_after();
        let mut restart_scan = false;

        for tracker in self.registry.iter() {
            let identity = tracker.identity();
            let state = tracker.state(now, window);
            let last = previous.insert(identity.address, state);
            restart_scan |= went_quiet(last, state);
            if last != Some(state) {
                match state {
                    TrackerState::Stale => warn!(
                        "No advertisement from {} ({}) within {:?}",
                        identity.name, identity.address, window
                    ),
                    TrackerState::Known => info!("{} is reporting", identity.name),
                    TrackerState::Unknown => {}
                }
            }
            publish(mqtt, &announcement(tracker, state, tracker.snapshot())).await;
        }

        if restart_scan {
            debug!("Restarting scan for quiet traps");
            self.adapter.start_scan(ScanFilter::default()).await?;
        }
        Ok(())
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for {} trap(s)", self.registry.len());

        let (tx, mut rx) = broadcast::channel(16);

        let mqtt_client = match self.mqtt.take() {
            Some((client, mut event_loop)) => {
                client.subscribe().await?;
                let loop_client = client.clone();
                let tx = tx.clone();
                // Handle incoming MQTT messages (reset / rename requests)
                tokio::task::spawn(async move {
                    loop_client.event_loop(&mut event_loop, tx).await;
                });
                Some(client)
            }
            None => None,
        };

        for tracker in self.registry.iter() {
            spawn_publisher(tracker.clone(), mqtt_client.clone(), self.tracker_config.clone());
        }

        let mut events = self.adapter.events().await?;
        let mut sweep = tokio::time::interval(self.tracker_config.publish_interval());
        let mut states = HashMap::new();

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(event) => {
                            if let Err(err) = self.handle_btle_event(event).await {
                                debug!("Error handling BTLE event: {:?}", err);
                            }
                        }
                        None => {
                            info!("No more BTLE events");
                            break;
                        }
                    }
                }
                command = rx.recv() => {
                    match command {
                        Ok(command) => {
                            let device = command.device();
                            match self.registry.find(|t| sanitize_name(&t.identity().name) == device) {
                                Some(tracker) => spawn_command(tracker.clone(), command),
                                None => warn!("Command for unknown trap {}", device),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Dropped {} trap commands", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Command channel closed");
                        }
                    }
                }
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep(mqtt_client.as_ref(), &mut states).await {
                        error!("Error during staleness sweep: {:?}", err);
                    }
                }
            }
        }

        info!("Exiting manager event loop");
        if let Some(client) = mqtt_client {
            client.disconnect().await?;
        }
        drop(tx);

        Ok(())
    }
}

/// Only a Known to Stale transition restarts the scan. Traps never heard
/// from, or already stale, do not.
fn went_quiet(previous: Option<TrackerState>, current: TrackerState) -> bool {
    previous == Some(TrackerState::Known) && current == TrackerState::Stale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings_changed_ignores_timestamp() {
        let previous = TrapSnapshot {
            triggered: Some(false),
            battery_percentage: Some(50),
            last_update: Some(SystemTime::UNIX_EPOCH),
            ..TrapSnapshot::default()
        };
        let mut current = TrapSnapshot {
            last_update: Some(SystemTime::now()),
            ..previous.clone()
        };
        assert!(!readings_changed(&previous, &current));

        current.triggered = Some(true);
        assert!(readings_changed(&previous, &current));
    }

    #[test]
    fn test_scan_restarts_only_when_a_trap_goes_quiet() {
        assert!(went_quiet(Some(TrackerState::Known), TrackerState::Stale));

        assert!(!went_quiet(None, TrackerState::Unknown));
        assert!(!went_quiet(Some(TrackerState::Unknown), TrackerState::Unknown));
        assert!(!went_quiet(Some(TrackerState::Stale), TrackerState::Stale));
        assert!(!went_quiet(Some(TrackerState::Known), TrackerState::Known));
        assert!(!went_quiet(Some(TrackerState::Stale), TrackerState::Known));
    }
}
