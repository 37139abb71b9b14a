use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::messages::{DeviceAddress, Presence};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Remote service that records home/away state for devices.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    /// Report a device's presence. `Ok` only when the service accepted it.
    async fn see(&self, device: &DeviceAddress, presence: Presence) -> anyhow::Result<()>;

    /// Publish the running detector's version as an entity.
    async fn announce_version(&self) -> anyhow::Result<()>;
}

/// Home Assistant REST API client.
pub struct HassClient {
    http: reqwest::Client,
    config: Arc<AppConfig>,
}

impl HassClient {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.notify_timeout())
            .user_agent(concat!("wifi-presence/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(HassClient { http, config })
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<()> {
        let url = format!("{}{}", self.config.hass.url.trim_end_matches('/'), path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.hass.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!("API response from {}: {} {}", url, status, text);

        if status.is_client_error() || status.is_server_error() {
            anyhow::bail!("POST {} returned {}", url, status);
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceSink for HassClient {
    async fn see(&self, device: &DeviceAddress, presence: Presence) -> anyhow::Result<()> {
        let body = see_body(&self.config, device, presence);
        debug!("Posting to Home Assistant: {}", body);
        self.post("/api/services/device_tracker/see", &body).await
    }

    async fn announce_version(&self) -> anyhow::Result<()> {
        let path = format!("/api/states/{}", self.config.version_entity_id());
        self.post(&path, &serde_json::json!({ "state": VERSION }))
            .await
    }
}

/// Body for the `device_tracker.see` service. Per-device params may override the
/// defaults, the access point prefix always wins.
fn see_body(config: &AppConfig, device: &DeviceAddress, presence: Presence) -> Value {
    let location = match presence {
        Presence::Home => config.home_label(),
        Presence::Away => config.away_label(),
    };

    let mut body = Map::new();
    body.insert("mac".to_string(), Value::from(device.as_str()));
    body.insert("location_name".to_string(), Value::from(location));
    body.insert("source_type".to_string(), Value::from("router"));

    if let Some(params) = config.params.get(device) {
        body.extend(params.clone());
    }
    if config.ap.name.is_some() {
        body.insert("mac".to_string(), Value::from(config.tracker_id(device)));
    }

    Value::Object(body)
}
