//! Bus host: controller registry, device-list handoff, exclusive opens and
//! batched completion delivery.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

use starlet_timing::{EventId, RemoteScheduler, Scheduler};
use tracing::{debug, warn};

use crate::device::{DeviceCore, DrainNotifier, OpenDevice, UsbDeviceClient, UsbPortDriver};
use crate::{ControllerId, DeviceDescriptor, OpenKey};

/// Notified with the merged device list after every consumed publication.
/// Invoked only from the emulation thread; the descriptor slice is valid until
/// the callback returns.
pub trait DeviceChangeListener {
    fn devices_changed(&mut self, devices: &[DeviceDescriptor]);
}

/// One controller: enumerates physical devices (publishing lists through its
/// [`DeviceListPublisher`]) and opens them on request. Platform hotplug
/// backends implement this; the contract they must honor is the device-list
/// handoff, nothing more.
pub trait UsbController {
    fn id(&self) -> ControllerId;

    /// Scanning is enabled while at least one change listener is registered.
    /// Controllers without background enumeration may ignore this.
    fn set_scan_enabled(&mut self, _enabled: bool) {}

    /// Opens the physical device identified by `key.token`, or `None` if it
    /// is gone.
    fn open(&mut self, key: &OpenKey) -> Option<Box<dyn UsbPortDriver>>;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Single-slot exclusive handoff for one controller's device list.
///
/// `fresh` holds the at-most-one not-yet-consumed publication. When the
/// emulation thread consumes it, the previously `live` list moves to
/// `retired` and stays there until the explicit release after listeners have
/// been notified, reproducing the two-step swap/retire protocol.
#[derive(Debug, Default)]
struct ListSlot {
    fresh: Option<Vec<DeviceDescriptor>>,
    live: Vec<DeviceDescriptor>,
    retired: Vec<Vec<DeviceDescriptor>>,
}

#[derive(Debug, Default)]
struct ListSlots {
    slots: HashMap<u32, ListSlot>,
}

/// Cross-thread publication handle for one controller. Cloneable into the
/// controller's background enumeration thread.
#[derive(Clone)]
pub struct DeviceListPublisher {
    controller: ControllerId,
    slots: Arc<Mutex<ListSlots>>,
    remote: RemoteScheduler,
    change_event: EventId,
}

impl DeviceListPublisher {
    /// Publishes a new enumeration result. No-op publications (equal to what
    /// the emulation thread already sees, with nothing fresher queued) are
    /// skipped so steady-state polling stays quiet.
    pub fn publish(&self, list: Vec<DeviceDescriptor>) {
        {
            let mut slots = self.slots.lock().expect("device list slots poisoned");
            let slot = slots.slots.entry(self.controller.0).or_default();
            let unchanged = match &slot.fresh {
                Some(fresh) => *fresh == list,
                None => slot.live == list,
            };
            if unchanged {
                return;
            }
            debug!(controller = self.controller.0, devices = list.len(), "device list published");
            slot.fresh = Some(list);
        }
        self.remote
            .schedule_immediate(self.change_event, u64::from(self.controller.0));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    /// The global open-set already holds this physical device.
    #[error("device already open")]
    AlreadyOpen,
    /// No enumerated device matches, or the controller no longer sees it.
    #[error("no such device")]
    NoDevice,
}

struct OpenEntry {
    core: Arc<DeviceCore>,
    client: Rc<RefCell<dyn UsbDeviceClient>>,
}

/// The peripheral-bus context object. Constructed at machine power-on and
/// passed by reference into dispatcher operations; there is no global state.
pub struct UsbHost {
    controllers: Vec<Box<dyn UsbController>>,
    // Weak by design: listeners are usually device backends whose lifetime
    // the dispatcher owns; a dropped backend just stops being notified.
    listeners: Vec<Weak<RefCell<dyn DeviceChangeListener>>>,
    open_set: HashSet<OpenKey>,
    open_entries: HashMap<u64, OpenEntry>,
    /// Merged emulation-thread view of every controller's live list,
    /// `is_open`-stamped; what listeners and `open_vid_pid` see.
    merged: Vec<DeviceDescriptor>,
    slots: Arc<Mutex<ListSlots>>,
    pending_devices: Arc<Mutex<Vec<u64>>>,
    remote: RemoteScheduler,
    change_event: EventId,
    drain_event: EventId,
    next_core_id: u64,
    scanning: bool,
}

impl UsbHost {
    pub fn new(scheduler: &mut Scheduler) -> Self {
        let change_event = scheduler.register_event("usb-devices-changed");
        let drain_event = scheduler.register_event("usb-requests-completed");
        Self {
            controllers: Vec::new(),
            listeners: Vec::new(),
            open_set: HashSet::new(),
            open_entries: HashMap::new(),
            merged: Vec::new(),
            slots: Arc::new(Mutex::new(ListSlots::default())),
            pending_devices: Arc::new(Mutex::new(Vec::new())),
            remote: scheduler.remote(),
            change_event,
            drain_event,
            next_core_id: 1,
            scanning: false,
        }
    }

    /// Registers a controller. The builder receives the controller's id and
    /// its publication handle.
    pub fn add_controller<C, F>(&mut self, build: F) -> ControllerId
    where
        C: UsbController + 'static,
        F: FnOnce(ControllerId, DeviceListPublisher) -> C,
    {
        let id = ControllerId(self.controllers.len() as u32);
        let publisher = DeviceListPublisher {
            controller: id,
            slots: Arc::clone(&self.slots),
            remote: self.remote.clone(),
            change_event: self.change_event,
        };
        let mut controller = build(id, publisher);
        if self.scanning {
            controller.set_scan_enabled(true);
        }
        self.controllers.push(Box::new(controller));
        id
    }

    pub fn controller_mut(&mut self, id: ControllerId) -> Option<&mut dyn UsbController> {
        self.controllers
            .get_mut(id.0 as usize)
            .map(|c| c.as_mut() as &mut dyn UsbController)
    }

    pub fn register_change_listener(&mut self, listener: Rc<RefCell<dyn DeviceChangeListener>>) {
        self.listeners.push(Rc::downgrade(&listener));
        if !self.scanning {
            self.set_scanning(true);
        }
    }

    pub fn deregister_change_listener(&mut self, listener: &Rc<RefCell<dyn DeviceChangeListener>>) {
        self.listeners
            .retain(|l| l.upgrade().is_some_and(|rc| !Rc::ptr_eq(&rc, listener)));
        if self.scanning && self.listeners.is_empty() {
            self.set_scanning(false);
        }
    }

    fn set_scanning(&mut self, enabled: bool) {
        self.scanning = enabled;
        for controller in &mut self.controllers {
            controller.set_scan_enabled(enabled);
        }
    }

    /// The merged device list as of the last consumed publication.
    pub fn device_list(&self) -> &[DeviceDescriptor] {
        &self.merged
    }

    pub fn is_open(&self, key: &OpenKey) -> bool {
        self.open_set.contains(key)
    }

    /// Routes a fired scheduler event into the bus. Returns `false` for
    /// events the bus does not own.
    pub fn process_event(&mut self, id: EventId, _userdata: u64) -> bool {
        if id == self.change_event {
            self.process_devices_changed();
            true
        } else if id == self.drain_event {
            self.process_completions();
            true
        } else {
            false
        }
    }

    fn process_devices_changed(&mut self) {
        // Step 1: consume fresh publications; superseded lists are retired,
        // not dropped. Collapsed publications leave extra scheduled events
        // behind with nothing fresh to consume; those are no-ops.
        {
            let mut slots = self.slots.lock().expect("device list slots poisoned");
            let mut consumed_any = false;
            for slot in slots.slots.values_mut() {
                if let Some(fresh) = slot.fresh.take() {
                    let old = std::mem::replace(&mut slot.live, fresh);
                    slot.retired.push(old);
                    consumed_any = true;
                }
            }
            if !consumed_any {
                return;
            }

            self.merged.clear();
            for slot in slots.slots.values() {
                self.merged.extend(slot.live.iter().cloned());
            }
            self.merged
                .sort_by_key(|d| (d.open_key.controller, d.open_key.token));
        }
        for desc in &mut self.merged {
            desc.is_open = self.open_set.contains(&desc.open_key);
        }

        // Step 2: notify. A listener may register or deregister others from
        // inside the callback, so iterate over an upgraded snapshot.
        self.listeners.retain(|l| l.strong_count() > 0);
        if self.scanning && self.listeners.is_empty() {
            self.set_scanning(false);
        }
        if self.scanning {
            let listeners: Vec<_> = self.listeners.iter().filter_map(Weak::upgrade).collect();
            for listener in listeners {
                listener.borrow_mut().devices_changed(&self.merged);
            }
        }

        // Step 3: now that no callback can hold a descriptor, release the
        // superseded lists.
        let mut slots = self.slots.lock().expect("device list slots poisoned");
        for slot in slots.slots.values_mut() {
            slot.retired.clear();
        }
    }

    fn process_completions(&mut self) {
        let ids: Vec<u64> = {
            let mut pending = self
                .pending_devices
                .lock()
                .expect("pending device list poisoned");
            let mut ids: Vec<u64> = pending.drain(..).collect();
            ids.dedup();
            ids
        };

        for id in ids {
            let Some(entry) = self.open_entries.get(&id) else {
                // Device closed between completion and drain.
                continue;
            };
            let client = Rc::clone(&entry.client);
            for (tag, result) in entry.core.take_pending() {
                client.borrow_mut().request_complete(&tag, &result);
            }
        }
    }

    /// Opens the first enumerated device with the given vendor/product ids.
    pub fn open_vid_pid(
        &mut self,
        vid: u16,
        pid: u16,
        client: Rc<RefCell<dyn UsbDeviceClient>>,
    ) -> Result<OpenDevice, OpenError> {
        let key = self
            .merged
            .iter()
            .find(|d| d.vid == vid && d.pid == pid)
            .map(|d| d.open_key)
            .ok_or(OpenError::NoDevice)?;
        self.open_device(&key, client)
    }

    /// Opens the physical device identified by `key`, exclusively.
    pub fn open_device(
        &mut self,
        key: &OpenKey,
        client: Rc<RefCell<dyn UsbDeviceClient>>,
    ) -> Result<OpenDevice, OpenError> {
        if self.open_set.contains(key) {
            return Err(OpenError::AlreadyOpen);
        }
        let controller = self
            .controllers
            .get_mut(key.controller.0 as usize)
            .ok_or(OpenError::NoDevice)?;
        let driver = controller.open(key).ok_or(OpenError::NoDevice)?;

        let id = self.next_core_id;
        self.next_core_id += 1;
        let core = Arc::new(DeviceCore::new(
            id,
            DrainNotifier {
                pending_devices: Arc::clone(&self.pending_devices),
                remote: self.remote.clone(),
                drain_event: self.drain_event,
            },
        ));

        self.open_set.insert(*key);
        self.open_entries.insert(
            id,
            OpenEntry {
                core: Arc::clone(&core),
                client,
            },
        );
        Ok(OpenDevice {
            key: *key,
            core,
            driver,
            closed: false,
        })
    }

    /// Closes an open device, releasing its open-set entry. Undelivered
    /// completions are dropped; the client is gone.
    pub fn close_device(&mut self, mut device: OpenDevice) {
        device.driver.closed();
        device.drop_outstanding();
        if !self.open_set.remove(&device.key) {
            warn!(key = ?device.key, "close of a device that was not open");
        }
        self.open_entries.remove(&device.core.id);
        device.closed = true;
    }
}
