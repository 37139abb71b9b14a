use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::filter::DeviceFilter;
use crate::hass::PresenceSink;
use crate::messages::{DeviceAddress, DeviceState, Presence, QueueItem, SyncMode};
use crate::ubus::Ubus;
use crate::watcher::Watcher;

/// Per-device bookkeeping. `state` is what the remote service last confirmed,
/// `intent` and `pending` describe what is still queued for the device.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub last_seen: Instant,
    pub state: DeviceState,
    intent: Option<Presence>,
    pending: usize,
}

impl PresenceRecord {
    fn new() -> Self {
        PresenceRecord {
            last_seen: Instant::now(),
            state: DeviceState::Unknown,
            intent: None,
            pending: 0,
        }
    }

    fn wants(&self, presence: Presence) -> bool {
        if self.pending > 0 {
            self.intent != Some(presence)
        } else {
            self.state.confirmed() != Some(presence)
        }
    }
}

/// Cooperative stop signal shared by the worker, watchers and debounce timers.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Shared {
    config: Arc<AppConfig>,
    filter: DeviceFilter,
    devices: DashMap<DeviceAddress, PresenceRecord>,
    queue: mpsc::UnboundedSender<QueueItem>,
    shutdown: watch::Sender<bool>,
}

/// Entry points into the engine. Cheap to clone and safe to use from any task.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Shared>,
}

impl EngineHandle {
    pub fn config(&self) -> &Arc<AppConfig> {
        &self.inner.config
    }

    pub fn shutdown(&self) -> Shutdown {
        Shutdown(self.inner.shutdown.subscribe())
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    #[cfg(test)]
    pub fn state(&self, device: &DeviceAddress) -> DeviceState {
        self.inner
            .devices
            .get(device)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    /// Mark a device as home. Returns whether a notification was queued.
    pub fn device_home(&self, device: &DeviceAddress) -> bool {
        self.request(device, Presence::Home)
    }

    /// Mark a device as away. Returns whether a notification was queued.
    pub fn device_away(&self, device: &DeviceAddress) -> bool {
        self.request(device, Presence::Away)
    }

    /// Mark a device away once `window` has passed, unless it shows up again before that.
    pub fn device_left(&self, device: DeviceAddress, window: Duration) {
        if !self.inner.filter.should_handle(&device) {
            return;
        }

        let left_at = Instant::now();
        let handle = self.clone();
        let mut shutdown = self.shutdown();
        debug!("Device {} left, waiting {:?} before marking it away", device, window);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = shutdown.stopped() => return,
            }

            let returned = handle
                .inner
                .devices
                .get(&device)
                .is_some_and(|record| record.last_seen > left_at);
            if returned {
                debug!("Device {} returned within the debounce window", device);
            } else {
                handle.device_away(&device);
            }
        });
    }

    /// Stop every watcher and let the worker exit. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("Stopping...");
        let _ = self.inner.queue.send(QueueItem::Quit);
    }

    fn request(&self, device: &DeviceAddress, presence: Presence) -> bool {
        if !self.inner.filter.should_handle(device) {
            debug!("Ignoring filtered device {}", device);
            return false;
        }

        // The entry lock keeps queue order equal to decision order per device
        let mut record = self
            .inner
            .devices
            .entry(device.clone())
            .or_insert_with(PresenceRecord::new);
        if presence == Presence::Home {
            record.last_seen = Instant::now();
        }
        if !record.wants(presence) {
            debug!("Device {} is already {:?}", device, presence);
            return false;
        }

        if self
            .inner
            .queue
            .send(QueueItem::for_presence(device.clone(), presence))
            .is_err()
        {
            warn!("Queue closed, dropping {:?} for {}", presence, device);
            return false;
        }
        record.intent = Some(presence);
        record.pending += 1;

        let config = &self.inner.config;
        let label = match presence {
            Presence::Home => config.home_label(),
            Presence::Away => config.away_label(),
        };
        info!("Device {} is now at {}", config.tracker_id(device), label);
        true
    }

    fn confirm(&self, device: &DeviceAddress, presence: Presence) {
        if let Some(mut record) = self.inner.devices.get_mut(device) {
            record.state = presence.into();
            record.pending = record.pending.saturating_sub(1);
        }
    }

    /// Put a failed notification back at the end of the queue, unless a later
    /// decision for the same device is already queued behind it.
    fn retry_later(&self, device: &DeviceAddress, presence: Presence) -> bool {
        let Some(mut record) = self.inner.devices.get_mut(device) else {
            return false;
        };
        record.state = DeviceState::PendingRetry(presence);

        if record.pending > 1 {
            debug!("Dropping failed {:?} for {}, superseded", presence, device);
            record.pending -= 1;
            return false;
        }

        self.inner
            .queue
            .send(QueueItem::for_presence(device.clone(), presence))
            .is_ok()
    }
}

/// Owns the notification queue and the last full sync snapshot, and runs the worker.
pub struct Engine {
    handle: EngineHandle,
    queue: mpsc::UnboundedReceiver<QueueItem>,
    shutdown: Shutdown,
    sink: Arc<dyn PresenceSink>,
    ubus: Arc<dyn Ubus>,
    last_seen_clients: HashSet<DeviceAddress>,
    sink_offline: bool,
}

impl Engine {
    pub fn new(config: Arc<AppConfig>, sink: Arc<dyn PresenceSink>, ubus: Arc<dyn Ubus>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = EngineHandle {
            inner: Arc::new(Shared {
                filter: DeviceFilter::from(&config.filter),
                config,
                devices: DashMap::new(),
                queue: tx,
                shutdown: shutdown_tx,
            }),
        };

        Engine {
            handle,
            queue: rx,
            shutdown: Shutdown(shutdown_rx),
            sink,
            ubus,
            last_seen_clients: HashSet::new(),
            sink_offline: false,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Initial sync, version announcement, one watcher per interface, then the worker
    /// until stopped.
    pub async fn run(mut self) {
        info!("Starting presence detector {}", crate::hass::VERSION);
        self.full_sync(SyncMode::Full).await;
        self.announce_version().await;
        if self.handle.is_stopped() {
            info!("Stopped during startup");
            return;
        }

        let watchers: Vec<_> = self
            .handle
            .config()
            .ap
            .interfaces
            .iter()
            .map(|interface| {
                let watcher = Watcher::new(interface.clone(), self.handle.clone(), self.ubus.clone());
                tokio::spawn(watcher.run())
            })
            .collect();

        self.run_worker().await;

        // The worker may also end because the queue closed
        self.handle.stop();
        for result in join_all(watchers).await {
            if let Err(err) = result {
                error!("Watcher task failed: {:?}", err);
            }
        }
        info!("Presence detector stopped");
    }

    /// Compare the devices associated right now with the previous snapshot and queue
    /// the differences.
    pub async fn full_sync(&mut self, mode: SyncMode) {
        let mut seen_now = HashSet::new();
        for interface in &self.handle.config().ap.interfaces {
            match self.ubus.get_clients(interface).await {
                Ok(clients) => seen_now.extend(clients),
                Err(err) => warn!("Error getting clients of {}: {:#}", interface, err),
            }
        }

        let departed: Vec<DeviceAddress> = self
            .last_seen_clients
            .difference(&seen_now)
            .cloned()
            .collect();
        self.last_seen_clients = seen_now;
        debug!(
            "Full sync ({:?}): {} online, {} departed",
            mode,
            self.last_seen_clients.len(),
            departed.len()
        );

        if mode == SyncMode::Full {
            for device in &self.last_seen_clients {
                self.handle.device_home(device);
            }
        }
        for device in &departed {
            self.handle.device_away(device);
        }
    }

    async fn announce_version(&self) {
        if let Err(err) = self.sink.announce_version().await {
            warn!("Unable to create/update version entity: {:#}", err);
        }
    }

    /// Deliver queued notifications one at a time until the quit sentinel arrives.
    async fn run_worker(&mut self) {
        let fallback_interval = self.handle.config().fallback_sync_interval();

        while !self.shutdown.is_stopped() {
            let item = match fallback_interval {
                Some(interval) => match tokio::time::timeout(interval, self.queue.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        debug!("Queue idle for {:?}, running fallback sync", interval);
                        self.full_sync(SyncMode::Full).await;
                        continue;
                    }
                },
                None => self.queue.recv().await,
            };

            let Some(item) = item else {
                debug!("Queue closed");
                break;
            };
            let Some((device, presence)) = item.target() else {
                debug!("Worker received quit");
                break;
            };

            let device = device.clone();
            self.deliver(&device, presence).await;
        }
    }

    async fn deliver(&mut self, device: &DeviceAddress, presence: Presence) {
        let timeout = self.handle.config().notify_timeout();
        let result = match tokio::time::timeout(timeout, self.sink.see(device, presence)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
        };

        match result {
            Ok(()) => {
                self.handle.confirm(device, presence);
                if self.sink_offline {
                    info!("Home Assistant is back online, processing backlog");
                    self.sink_offline = false;
                    let mode = if self.handle.config().sync.recovery_away_only {
                        SyncMode::AwayOnly
                    } else {
                        SyncMode::Full
                    };
                    self.full_sync(mode).await;
                    self.announce_version().await;
                }
            }
            Err(err) => {
                debug!("Notification for {} failed: {:#}", device, err);
                warn!("Home Assistant seems to be offline, sleeping...");
                self.handle.retry_later(device, presence);
                self.sink_offline = true;

                let cooldown = self.handle.config().offline_cooldown();
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = self.shutdown.stopped() => {}
                }
            }
        }
    }
}
