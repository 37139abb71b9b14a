use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use log::{debug, info};

use crate::config::LeaveEvents;
use crate::engine::{EngineHandle, Shutdown};
use crate::messages::StationEvent;
use crate::ubus::{EventLines, Ubus, parse_event};

/// Turns join/leave events into engine calls according to the leave policy.
struct EventPolicy {
    engine: EngineHandle,
    leave_events: LeaveEvents,
    leave_debounce: Duration,
}

impl EventPolicy {
    fn handle(&self, event: StationEvent) {
        match event {
            StationEvent::Join(device) => {
                self.engine.device_home(&device);
            }
            StationEvent::Leave(device) => match self.leave_events {
                LeaveEvents::Immediate => {
                    self.engine.device_away(&device);
                }
                LeaveEvents::Debounce => self.engine.device_left(device, self.leave_debounce),
                LeaveEvents::Ignore => debug!("Ignoring leave event for {}", device),
            },
        }
    }
}

/// Follows the live association events of one interface until stopped.
pub struct Watcher {
    interface: String,
    ubus: Arc<dyn Ubus>,
    shutdown: Shutdown,
    retry: Duration,
    policy: EventPolicy,
}

impl Watcher {
    pub fn new(interface: String, engine: EngineHandle, ubus: Arc<dyn Ubus>) -> Self {
        let config = engine.config().clone();
        Watcher {
            interface,
            ubus,
            shutdown: engine.shutdown(),
            retry: config.watcher_retry(),
            policy: EventPolicy {
                engine,
                leave_events: config.ap.leave_events,
                leave_debounce: config.leave_debounce(),
            },
        }
    }

    pub async fn run(mut self) {
        info!("Watching {} for client events", self.interface);

        while !self.shutdown.is_stopped() {
            match self.ubus.subscribe(&self.interface).await {
                Ok(events) => {
                    debug!("Subscribed to {}", self.interface);
                    self.read_events(events).await;
                    if self.shutdown.is_stopped() {
                        break;
                    }
                    debug!("Event stream of {} ended, resubscribing", self.interface);
                }
                // The interface may not exist yet
                Err(err) => debug!("Unable to subscribe to {}: {:#}", self.interface, err),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry) => {}
                _ = self.shutdown.stopped() => break,
            }
        }

        debug!("Watcher for {} stopped", self.interface);
    }

    /// Returns when the stream ends or a stop is requested. Dropping `events`
    /// terminates the subscription.
    async fn read_events(&mut self, mut events: EventLines) {
        loop {
            tokio::select! {
                _ = self.shutdown.stopped() => return,
                line = events.next() => match line {
                    Some(line) => {
                        if let Some(event) = parse_event(&line) {
                            self.policy.handle(event);
                        }
                    }
                    None => return,
                },
            }
        }
    }
}
