use std::collections::HashSet;

use crate::config::FilterConfig;
use crate::messages::DeviceAddress;

/// Decides whether a device is tracked at all.
///
/// With a deny list, listed devices are ignored and everything else is tracked.
/// With an allow list, only listed devices are tracked.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    devices: HashSet<DeviceAddress>,
    is_denylist: bool,
}

impl DeviceFilter {
    pub fn new(devices: impl IntoIterator<Item = DeviceAddress>, is_denylist: bool) -> Self {
        DeviceFilter {
            devices: devices.into_iter().collect(),
            is_denylist,
        }
    }

    pub fn should_handle(&self, device: &DeviceAddress) -> bool {
        self.devices.contains(device) != self.is_denylist
    }
}

impl From<&FilterConfig> for DeviceFilter {
    fn from(config: &FilterConfig) -> Self {
        DeviceFilter::new(config.devices.iter().cloned(), config.is_denylist)
    }
}
