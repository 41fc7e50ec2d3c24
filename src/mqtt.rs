use std::time::{Duration, UNIX_EPOCH};

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::{
    config,
    messages::{TrapAnnouncement, TrapCommand},
    tracker::TrackerState,
};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct TrapMqttMessage {
    name: String,
    #[serde(rename = "id")]
    mac_address: String,
    state: &'static str,
    available: bool,
    triggered: Option<bool>,
    battery_voltage: Option<f64>,
    battery: Option<u8>,
    /// Unix timestamp of the last advertisement
    last_update: Option<u64>,
    device_name: Option<String>,
    raw: Option<String>,
    retained: bool,
}

impl From<&TrapAnnouncement> for TrapMqttMessage {
    fn from(announcement: &TrapAnnouncement) -> Self {
        let snapshot = &announcement.snapshot;
        TrapMqttMessage {
            name: announcement.name.clone(),
            mac_address: announcement.mac_address.clone(),
            state: announcement.state.as_str(),
            available: announcement.state == TrackerState::Known,
            triggered: snapshot.triggered,
            battery_voltage: snapshot.battery_voltage.map(|v| (v * 100.0).round() / 100.0),
            battery: snapshot.battery_percentage,
            last_update: snapshot
                .last_update
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            device_name: snapshot.device_name.clone(),
            raw: snapshot.raw.clone(),
            retained: true,
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"trap-monitor".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("mousetrap".to_string()),
            },
            eventloop,
        )
    }

    fn device_prefix(&self) -> String {
        format!("{}/{}", self.topic_path, self.publisher_id)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        let prefix = self.device_prefix();
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{prefix}/+/reset"), QoS::AtLeastOnce),
                SubscribeFilter::new(format!("{prefix}/+/refresh"), QoS::AtLeastOnce),
                SubscribeFilter::new(format!("{prefix}/+/name/set"), QoS::AtLeastOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<TrapCommand>,
    ) {
        let prefix = self.device_prefix();
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(command) = parse_command(&prefix, &p.topic, &p.payload) else {
                            debug!("Ignoring MQTT message on topic {}", p.topic);
                            continue;
                        };

                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding trap command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn announce_trap(
        &self,
        announcement: &TrapAnnouncement,
    ) -> Result<(), rumqttc::ClientError> {
        info!(
            "Announcing trap {} ({}, triggered: {:?}, battery: {:?}%) on MQTT",
            announcement.name,
            announcement.state.as_str(),
            announcement.snapshot.triggered,
            announcement.snapshot.battery_percentage
        );
        let message = TrapMqttMessage::from(announcement);
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error serializing announcement for {}: {}", announcement.name, err);
                return Ok(());
            }
        };
        self.client
            .publish(
                format!("{}/{}", self.device_prefix(), sanitize_name(&announcement.name)),
                QoS::AtMostOnce,
                true,
                payload,
            )
            .await
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

/// Map `<prefix>/<device>/<action>` topics to commands.
fn parse_command(prefix: &str, topic: &str, payload: &[u8]) -> Option<TrapCommand> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (device, action) = rest.split_once('/')?;
    if device.is_empty() {
        return None;
    }
    let device = device.to_string();

    match action {
        "reset" => Some(TrapCommand::Reset(device)),
        "refresh" => Some(TrapCommand::Refresh(device)),
        "name/set" => {
            let name = std::str::from_utf8(payload).ok()?.trim().to_string();
            Some(TrapCommand::Rename { device, name })
        }
        _ => None,
    }
}

pub fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::tracker::TrapSnapshot;

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Trap 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_trap_123");
    }

    #[test]
    fn test_parse_command() {
        let prefix = "mousetrap/trap-monitor";
        assert_eq!(
            parse_command(prefix, "mousetrap/trap-monitor/garage/reset", b""),
            Some(TrapCommand::Reset("garage".to_string()))
        );
        assert_eq!(
            parse_command(prefix, "mousetrap/trap-monitor/garage/refresh", b""),
            Some(TrapCommand::Refresh("garage".to_string()))
        );
        assert_eq!(
            parse_command(prefix, "mousetrap/trap-monitor/garage/name/set", b" Attic \n"),
            Some(TrapCommand::Rename {
                device: "garage".to_string(),
                name: "Attic".to_string()
            })
        );
        assert_eq!(parse_command(prefix, "mousetrap/trap-monitor/garage", b""), None);
        assert_eq!(parse_command(prefix, "other/trap-monitor/garage/reset", b""), None);
        assert_eq!(parse_command(prefix, "mousetrap/trap-monitor//reset", b""), None);
    }

    #[test]
    fn test_message_from_announcement() {
        let announcement = TrapAnnouncement {
            name: "Garage".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            state: TrackerState::Known,
            snapshot: TrapSnapshot {
                triggered: Some(true),
                battery_voltage: Some(2.597_222),
                battery_percentage: Some(50),
                last_update: Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
                device_name: None,
                raw: Some("011AAC12030001B80100".to_string()),
            },
        };
        let message = TrapMqttMessage::from(&announcement);
        assert!(message.available);
        assert_eq!(message.battery_voltage, Some(2.6));
        assert_eq!(message.last_update, Some(1_700_000_000));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["state"], "known");
        assert_eq!(json["triggered"], true);
    }

    #[test]
    fn test_stale_trap_is_unavailable() {
        let announcement = TrapAnnouncement {
            name: "Garage".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            state: TrackerState::Stale,
            snapshot: TrapSnapshot {
                last_update: Some(SystemTime::UNIX_EPOCH),
                ..TrapSnapshot::default()
            },
        };
        let message = TrapMqttMessage::from(&announcement);
        assert!(!message.available);
        assert_eq!(message.state, "stale");
    }
}
