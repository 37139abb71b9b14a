use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

use crate::messages::DeviceAddress;

/// Extra body fields posted along with a device's presence.
pub type DeviceParams = serde_json::Map<String, serde_json::Value>;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub debug: bool,
    pub hass: HassConfig,
    #[serde(default)]
    pub ap: ApConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Keyed by device address, normalized to lower case on load.
    #[serde(default)]
    pub params: HashMap<DeviceAddress, DeviceParams>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HassConfig {
    #[serde(default = "default_hass_url")]
    pub url: String,
    pub token: String,
    pub location: Option<String>,
    pub away: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApConfig {
    /// Prefix for tracker ids when several access points report to one server.
    pub name: Option<String>,
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub leave_events: LeaveEvents,
    pub leave_debounce_seconds: Option<u64>,
}

impl Default for ApConfig {
    fn default() -> Self {
        ApConfig {
            name: None,
            interfaces: default_interfaces(),
            leave_events: LeaveEvents::default(),
            leave_debounce_seconds: None,
        }
    }
}

/// What a watcher does with a disassociation event.
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LeaveEvents {
    /// Mark the device away right away.
    #[default]
    Immediate,
    /// Mark the device away only if it is not seen again within the debounce window.
    Debounce,
    /// Drop leave events and rely on full syncs for departures.
    Ignore,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub is_denylist: bool,
    #[serde(default)]
    pub devices: Vec<DeviceAddress>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            is_denylist: true,
            devices: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SyncConfig {
    pub fallback_interval_seconds: Option<u64>,
    pub offline_cooldown_seconds: Option<u64>,
    pub watcher_retry_seconds: Option<u64>,
    #[serde(default)]
    pub recovery_away_only: bool,
}

fn default_hass_url() -> String {
    "http://homeassistant.local:8123".to_string()
}

fn default_interfaces() -> Vec<String> {
    vec!["hostapd.wlan0".to_string()]
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::de::from_str(contents)?;
        if config.ap.interfaces.is_empty() {
            anyhow::bail!("at least one interface must be configured");
        }
        Ok(config)
    }

    pub fn home_label(&self) -> &str {
        self.hass.location.as_deref().unwrap_or("home")
    }

    pub fn away_label(&self) -> &str {
        self.hass.away.as_deref().unwrap_or("not_home")
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.hass.timeout_seconds.unwrap_or(5))
    }

    /// `None` when periodic full syncs are disabled.
    pub fn fallback_sync_interval(&self) -> Option<Duration> {
        match self.sync.fallback_interval_seconds.unwrap_or(0) {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    pub fn offline_cooldown(&self) -> Duration {
        Duration::from_secs(self.sync.offline_cooldown_seconds.unwrap_or(5))
    }

    pub fn watcher_retry(&self) -> Duration {
        Duration::from_secs(self.sync.watcher_retry_seconds.unwrap_or(1))
    }

    pub fn leave_debounce(&self) -> Duration {
        Duration::from_secs(self.ap.leave_debounce_seconds.unwrap_or(30))
    }

    /// Identifier the remote service tracks the device under.
    pub fn tracker_id(&self, device: &DeviceAddress) -> String {
        match &self.ap.name {
            Some(ap_name) => format!("{}_{}", ap_name, device),
            None => device.to_string(),
        }
    }

    pub fn version_entity_id(&self) -> String {
        let ap_name = self
            .ap
            .name
            .as_ref()
            .map(|name| name.replace('-', "_").to_lowercase())
            .unwrap_or_else(|| "openwrt_router".to_string());
        format!("sensor.{}_presence_detector_version", ap_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            debug = true

            [hass]
            url = "http://hass.lan:8123"
            token = "secret"
            away = "away"

            [ap]
            name = "Office-AP"
            interfaces = ["hostapd.wlan0", "hostapd.wlan1"]
            leave_events = "debounce"
            leave_debounce_seconds = 60

            [filter]
            is_denylist = false
            devices = ["AA:BB:CC:DD:EE:FF"]

            [sync]
            fallback_interval_seconds = 300

            [params."AA:BB:CC:DD:EE:FF"]
            dev_id = "phone"
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        assert!(config.debug);
        assert_eq!(config.hass.url, "http://hass.lan:8123");
        assert_eq!(config.home_label(), "home");
        assert_eq!(config.away_label(), "away");
        assert_eq!(config.ap.interfaces.len(), 2);
        assert_eq!(config.ap.leave_events, LeaveEvents::Debounce);
        assert_eq!(config.leave_debounce(), Duration::from_secs(60));
        assert!(!config.filter.is_denylist);
        assert_eq!(
            config.filter.devices,
            vec![DeviceAddress::from("aa:bb:cc:dd:ee:ff")]
        );
        assert_eq!(
            config.fallback_sync_interval(),
            Some(Duration::from_secs(300))
        );

        let params = config
            .params
            .get(&DeviceAddress::from("aa:bb:cc:dd:ee:ff"))
            .unwrap();
        assert_eq!(params["dev_id"], "phone");
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::parse("[hass]\ntoken = \"secret\"\n").unwrap();
        assert_eq!(config.hass.url, "http://homeassistant.local:8123");
        assert_eq!(config.ap.interfaces, vec!["hostapd.wlan0".to_string()]);
        assert_eq!(config.ap.leave_events, LeaveEvents::Immediate);
        assert!(config.filter.is_denylist);
        assert!(config.filter.devices.is_empty());
        assert_eq!(config.fallback_sync_interval(), None);
        assert_eq!(config.notify_timeout(), Duration::from_secs(5));
        assert_eq!(config.offline_cooldown(), Duration::from_secs(5));
        assert_eq!(config.watcher_retry(), Duration::from_secs(1));
        assert!(!config.sync.recovery_away_only);
    }

    #[test]
    fn test_missing_token_is_rejected() {
        assert!(AppConfig::parse("[hass]\nurl = \"http://hass\"\n").is_err());
    }

    #[test]
    fn test_empty_interfaces_are_rejected() {
        let config_str = "[hass]\ntoken = \"t\"\n[ap]\ninterfaces = []\n";
        assert!(AppConfig::parse(config_str).is_err());
    }

    #[test]
    fn test_tracker_ids() {
        let mut config = AppConfig::parse("[hass]\ntoken = \"t\"\n").unwrap();
        let device = DeviceAddress::from("aa:bb");
        assert_eq!(config.tracker_id(&device), "aa:bb");
        assert_eq!(
            config.version_entity_id(),
            "sensor.openwrt_router_presence_detector_version"
        );

        config.ap.name = Some("Office-AP".to_string());
        assert_eq!(config.tracker_id(&device), "Office-AP_aa:bb");
        assert_eq!(
            config.version_entity_id(),
            "sensor.office_ap_presence_detector_version"
        );
    }
}
