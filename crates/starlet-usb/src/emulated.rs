//! Emulated single-device controller.
//!
//! Device models that are not backed by real hardware (and tests) attach
//! through this controller: enabling it publishes a one-entry device list
//! through the same mailbox protocol real controllers use, so hot-plug,
//! exclusive-open and completion behavior are identical either way.

use crate::device::UsbPortDriver;
use crate::host::{DeviceListPublisher, UsbController};
use crate::{ControllerId, DeviceDescriptor, OpenKey};

pub struct EmulatedController {
    id: ControllerId,
    publisher: DeviceListPublisher,
    descriptor: DeviceDescriptor,
    driver_factory: Box<dyn FnMut() -> Box<dyn UsbPortDriver>>,
    enabled: bool,
}

impl EmulatedController {
    /// `descriptor.open_key` is overwritten with this controller's identity.
    pub fn new(
        id: ControllerId,
        publisher: DeviceListPublisher,
        mut descriptor: DeviceDescriptor,
        driver_factory: Box<dyn FnMut() -> Box<dyn UsbPortDriver>>,
    ) -> Self {
        descriptor.open_key = OpenKey {
            controller: id,
            token: 0,
        };
        Self {
            id,
            publisher,
            descriptor,
            driver_factory,
            enabled: false,
        }
    }

    /// Plugs or unplugs the emulated device, publishing the new list.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        let list = if enabled {
            vec![self.descriptor.clone()]
        } else {
            Vec::new()
        };
        self.publisher.publish(list);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl UsbController for EmulatedController {
    fn id(&self) -> ControllerId {
        self.id
    }

    fn open(&mut self, key: &OpenKey) -> Option<Box<dyn UsbPortDriver>> {
        if self.enabled && *key == self.descriptor.open_key {
            Some((self.driver_factory)())
        } else {
            None
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
