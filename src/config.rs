use std::time::Duration;

use log::warn;
use mac_address::MacAddress;
use serde::{Deserialize as _, Deserializer};
use serde_derive::Deserialize;

use crate::battery::{BatteryModel, DEFAULT_EMPTY_VOLTS, DEFAULT_FULL_VOLTS};
use crate::tracker::{DeviceIdentity, TrackerOptions};

const MIN_PUBLISH_INTERVAL_SECONDS: u64 = 30;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub devices: Option<Vec<TrapDevice>>,
    pub tracker: Option<TrackerConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TrapDevice {
    #[serde(deserialize_with = "deserialize_address")]
    pub address: MacAddress,
    pub name: String,
    pub battery_empty_volts: Option<f64>,
    pub battery_full_volts: Option<f64>,
}

/// Addresses are written as `AA:BB:CC:DD:EE:FF`, any case.
fn deserialize_address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MacAddress, D::Error> {
    let address = String::deserialize(deserializer)?;
    address.parse().map_err(serde::de::Error::custom)
}

impl TrapDevice {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: self.name.clone(),
            address: self.address,
        }
    }

    pub fn battery_model(&self) -> BatteryModel {
        BatteryModel::new(
            self.battery_empty_volts.unwrap_or(DEFAULT_EMPTY_VOLTS),
            self.battery_full_volts.unwrap_or(DEFAULT_FULL_VOLTS),
        )
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TrackerConfig {
    pub stale_after_seconds: Option<u64>,
    pub publish_interval_seconds: Option<u64>,
    pub accept_out_of_order: Option<bool>,
    pub name_max_len: Option<usize>,
    pub gatt_timeout_seconds: Option<u64>,
    pub reset_settle_millis: Option<u64>,
}

impl TrackerConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds.unwrap_or(600))
    }

    pub fn publish_interval(&self) -> Duration {
        let seconds = self.publish_interval_seconds.unwrap_or(60);
        if seconds < MIN_PUBLISH_INTERVAL_SECONDS {
            warn!(
                "publish_interval_seconds = {} is below the minimum, using {}",
                seconds, MIN_PUBLISH_INTERVAL_SECONDS
            );
            return Duration::from_secs(MIN_PUBLISH_INTERVAL_SECONDS);
        }
        Duration::from_secs(seconds)
    }

    pub fn gatt_timeout(&self) -> Duration {
        Duration::from_secs(self.gatt_timeout_seconds.unwrap_or(10))
    }

    pub fn options(&self) -> TrackerOptions {
        let defaults = TrackerOptions::default();
        TrackerOptions {
            accept_out_of_order: self
                .accept_out_of_order
                .unwrap_or(defaults.accept_out_of_order),
            name_max_len: self.name_max_len.unwrap_or(defaults.name_max_len),
            reset_settle: self
                .reset_settle_millis
                .map(Duration::from_millis)
                .unwrap_or(defaults.reset_settle),
        }
    }
}

impl AppConfig {
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(contents)
    }

    pub fn tracker(&self) -> TrackerConfig {
        self.tracker.clone().unwrap_or_default()
    }

    pub fn devices(&self) -> &[TrapDevice] {
        self.devices.as_deref().unwrap_or_default()
    }

    /// Look a device up by configured name (case-insensitive) or address.
    pub fn find_device(&self, name_or_address: &str) -> Option<&TrapDevice> {
        let address = name_or_address.parse::<MacAddress>().ok();
        self.devices().iter().find(|d| {
            d.name.eq_ignore_ascii_case(name_or_address) || Some(d.address) == address
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [tracker]
            stale_after_seconds = 300
            accept_out_of_order = true
            reset_settle_millis = 0

            [[devices]]
            name = "Garage"
            address = "aa:bb:cc:dd:ee:ff"

            [[devices]]
            name = "Cellar"
            address = "11:22:33:44:55:66"
            battery_empty_volts = 2.2
        "#;
        let config = AppConfig::from_toml(config_str).unwrap();
        assert!(config.mqtt.as_ref().map(|m| m.host.as_str()) == Some("localhost"));

        let tracker = config.tracker();
        assert_eq!(tracker.stale_after(), Duration::from_secs(300));
        assert_eq!(tracker.publish_interval(), Duration::from_secs(60));
        let options = tracker.options();
        assert!(options.accept_out_of_order);
        assert_eq!(options.name_max_len, 20);
        assert!(options.reset_settle.is_zero());

        assert_eq!(config.devices().len(), 2);
        let garage = config.find_device("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(garage.name, "Garage");
        assert_eq!(garage.battery_model(), BatteryModel::default());
        let cellar = config.find_device("cellar").unwrap();
        assert_eq!(cellar.battery_model(), BatteryModel::new(2.2, 3.2));
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert!(config.mqtt.is_none());
        assert!(config.devices().is_empty());

        let tracker = config.tracker();
        assert_eq!(tracker.stale_after(), Duration::from_secs(600));
        assert_eq!(tracker.gatt_timeout(), Duration::from_secs(10));
        assert_eq!(tracker.options().reset_settle, Duration::from_secs(1));
    }

    #[test]
    fn test_publish_interval_minimum() {
        let tracker = TrackerConfig {
            publish_interval_seconds: Some(5),
            ..TrackerConfig::default()
        };
        assert_eq!(tracker.publish_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let config_str = r#"
            [[devices]]
            name = "Garage"
            address = "not-a-mac"
        "#;
        assert!(AppConfig::from_toml(config_str).is_err());
    }
}
