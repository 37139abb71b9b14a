use std::fmt;

use serde_derive::Deserialize;

/// Lower-cased hardware address of a wireless client. Identity key for all tracking.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(from = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: &str) -> Self {
        DeviceAddress(address.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceAddress {
    fn from(address: String) -> Self {
        DeviceAddress::new(&address)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        DeviceAddress::new(address)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Home,
    Away,
}

/// What the remote service last confirmed for a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Unknown,
    Home,
    Away,
    /// The last notification failed and is waiting to be retried.
    PendingRetry(Presence),
}

impl DeviceState {
    pub fn confirmed(&self) -> Option<Presence> {
        match self {
            DeviceState::Home => Some(Presence::Home),
            DeviceState::Away => Some(Presence::Away),
            DeviceState::Unknown | DeviceState::PendingRetry(_) => None,
        }
    }
}

impl From<Presence> for DeviceState {
    fn from(presence: Presence) -> Self {
        match presence {
            Presence::Home => DeviceState::Home,
            Presence::Away => DeviceState::Away,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueItem {
    Add(DeviceAddress),
    Delete(DeviceAddress),
    Quit,
}

impl QueueItem {
    pub fn for_presence(device: DeviceAddress, presence: Presence) -> Self {
        match presence {
            Presence::Home => QueueItem::Add(device),
            Presence::Away => QueueItem::Delete(device),
        }
    }

    /// Device and desired presence, `None` for the quit sentinel.
    pub fn target(&self) -> Option<(&DeviceAddress, Presence)> {
        match self {
            QueueItem::Add(device) => Some((device, Presence::Home)),
            QueueItem::Delete(device) => Some((device, Presence::Away)),
            QueueItem::Quit => None,
        }
    }
}

/// A join or leave notification from an interface's live event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StationEvent {
    Join(DeviceAddress),
    Leave(DeviceAddress),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Announce every present device and every departure.
    Full,
    /// Only process departures.
    AwayOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_normalized() {
        let address = DeviceAddress::new(" AA:BB:CC:DD:EE:FF ");
        assert_eq!(address.as_str(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(address, DeviceAddress::from("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_queue_item_target() {
        let device = DeviceAddress::from("aa:bb");
        let item = QueueItem::for_presence(device.clone(), Presence::Away);
        assert_eq!(item, QueueItem::Delete(device.clone()));
        assert_eq!(item.target(), Some((&device, Presence::Away)));
        assert_eq!(QueueItem::Quit.target(), None);
    }

    #[test]
    fn test_pending_retry_is_not_confirmed() {
        assert_eq!(DeviceState::Home.confirmed(), Some(Presence::Home));
        assert_eq!(DeviceState::PendingRetry(Presence::Home).confirmed(), None);
        assert_eq!(DeviceState::Unknown.confirmed(), None);
    }
}
