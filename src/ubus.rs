use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::Stream;
use log::debug;
use serde_derive::Deserialize;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Command;

use crate::messages::{DeviceAddress, StationEvent};

/// Raw lines of a live event subscription. Dropping it ends the subscription.
pub type EventLines = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Access point client state, as exposed over the ubus bus.
#[async_trait]
pub trait Ubus: Send + Sync {
    /// Every device currently associated with `interface`.
    async fn get_clients(&self, interface: &str) -> anyhow::Result<Vec<DeviceAddress>>;

    /// Subscribe to association events of `interface`.
    async fn subscribe(&self, interface: &str) -> anyhow::Result<EventLines>;
}

/// Talks to ubus through the `ubus` command line tool.
pub struct UbusCli {
    program: String,
    startup_grace: Duration,
}

impl UbusCli {
    pub fn new() -> Self {
        UbusCli {
            program: "ubus".to_string(),
            startup_grace: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl Ubus for UbusCli {
    async fn get_clients(&self, interface: &str) -> anyhow::Result<Vec<DeviceAddress>> {
        let output = Command::new(&self.program)
            .args(["call", interface, "get_clients"])
            .output()
            .await
            .with_context(|| format!("running {} call {}", self.program, interface))?;

        if !output.status.success() {
            anyhow::bail!(
                "ubus call {} get_clients failed ({}): {}",
                interface,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_clients(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("parsing clients of {}", interface))
    }

    async fn subscribe(&self, interface: &str) -> anyhow::Result<EventLines> {
        let mut child = Command::new(&self.program)
            .args(["subscribe", interface])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} subscribe {}", self.program, interface))?;

        // A missing interface makes ubus exit right away
        tokio::select! {
            status = child.wait() => {
                let status = status.context("waiting for ubus subscribe")?;
                anyhow::bail!("ubus subscribe {} exited with {}", interface, status);
            }
            _ = tokio::time::sleep(self.startup_grace) => {}
        }

        let stdout = child.stdout.take().context("ubus stdout was not captured")?;
        let lines = BufReader::new(stdout).lines();
        let interface = interface.to_string();

        let stream = futures::stream::unfold(
            (child, lines, interface),
            |(child, mut lines, interface)| async move {
                match lines.next_line().await {
                    Ok(Some(line)) => Some((line, (child, lines, interface))),
                    Ok(None) => None,
                    Err(err) => {
                        debug!("Error reading ubus events for {}: {:?}", interface, err);
                        None
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[derive(Deserialize)]
struct ClientList {
    clients: HashMap<String, serde_json::Value>,
}

/// Parse the output of `ubus call <interface> get_clients`. Only the keys are used.
pub fn parse_clients(json: &str) -> anyhow::Result<Vec<DeviceAddress>> {
    let list: ClientList = serde_json::from_str(json)?;
    Ok(list
        .clients
        .into_keys()
        .map(DeviceAddress::from)
        .collect())
}

#[derive(Deserialize)]
struct Station {
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawEvent {
    Assoc(Station),
    Disassoc(Station),
}

/// Parse one line of `ubus subscribe` output. Anything that is not a join or leave is `None`.
pub fn parse_event(line: &str) -> Option<StationEvent> {
    let event = serde_json::from_str::<RawEvent>(line.trim()).ok()?;
    Some(match event {
        RawEvent::Assoc(station) => StationEvent::Join(DeviceAddress::from(station.address)),
        RawEvent::Disassoc(station) => StationEvent::Leave(DeviceAddress::from(station.address)),
    })
}
