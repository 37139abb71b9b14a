use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt as _;

use crate::config::AppConfig;
use crate::hass::PresenceSink;
use crate::messages::{DeviceAddress, Presence};
use crate::ubus::{EventLines, Ubus};

pub fn test_config(extra: &str) -> Arc<AppConfig> {
    let contents = format!("[hass]\ntoken = \"test-token\"\n{}", extra);
    Arc::new(AppConfig::parse(&contents).unwrap())
}

/// Records every notification attempt, failing the first `failures` of them.
#[derive(Default)]
pub struct RecordingSink {
    attempts: Mutex<Vec<(DeviceAddress, Presence, bool)>>,
    failures: AtomicUsize,
    announcements: AtomicUsize,
}

impl RecordingSink {
    pub fn failing(failures: usize) -> Self {
        RecordingSink {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> Vec<(DeviceAddress, Presence, bool)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn announcements(&self) -> usize {
        self.announcements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceSink for RecordingSink {
    async fn see(&self, device: &DeviceAddress, presence: Presence) -> anyhow::Result<()> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.attempts
            .lock()
            .unwrap()
            .push((device.clone(), presence, !fail));
        if fail {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn announce_version(&self) -> anyhow::Result<()> {
        self.announcements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted `subscribe` outcome.
pub enum Session {
    /// The subscription fails to start.
    Fail,
    /// The stream yields these lines, then ends.
    Lines(Vec<String>),
    /// The stream yields these lines, then stays open.
    Open(Vec<String>),
}

/// Scripted access point. Interfaces without clients report none, interfaces
/// without remaining sessions fail to subscribe.
#[derive(Default)]
pub struct FakeUbus {
    clients: Mutex<HashMap<String, Option<Vec<DeviceAddress>>>>,
    sessions: Mutex<HashMap<String, VecDeque<Session>>>,
    get_clients_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl FakeUbus {
    pub fn set_clients(&self, interface: &str, clients: &[&str]) {
        let clients = clients.iter().map(|c| DeviceAddress::from(*c)).collect();
        self.clients
            .lock()
            .unwrap()
            .insert(interface.to_string(), Some(clients));
    }

    pub fn fail_clients(&self, interface: &str) {
        self.clients
            .lock()
            .unwrap()
            .insert(interface.to_string(), None);
    }

    pub fn push_session(&self, interface: &str, session: Session) {
        self.sessions
            .lock()
            .unwrap()
            .entry(interface.to_string())
            .or_default()
            .push_back(session);
    }

    pub fn get_clients_calls(&self) -> usize {
        self.get_clients_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ubus for FakeUbus {
    async fn get_clients(&self, interface: &str) -> anyhow::Result<Vec<DeviceAddress>> {
        self.get_clients_calls.fetch_add(1, Ordering::SeqCst);
        match self.clients.lock().unwrap().get(interface) {
            Some(Some(clients)) => Ok(clients.clone()),
            Some(None) => anyhow::bail!("Command failed: Not found"),
            None => Ok(Vec::new()),
        }
    }

    async fn subscribe(&self, interface: &str) -> anyhow::Result<EventLines> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let session = self
            .sessions
            .lock()
            .unwrap()
            .get_mut(interface)
            .and_then(|sessions| sessions.pop_front());

        match session {
            Some(Session::Lines(lines)) => Ok(Box::pin(futures::stream::iter(lines))),
            Some(Session::Open(lines)) => Ok(Box::pin(
                futures::stream::iter(lines).chain(futures::stream::pending()),
            )),
            Some(Session::Fail) | None => anyhow::bail!("ubus subscribe {} failed", interface),
        }
    }
}
