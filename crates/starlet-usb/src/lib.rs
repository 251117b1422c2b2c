//! Asynchronous peripheral bus for passthrough device backends.
//!
//! The bus sits between IPC device backends (which live on the single
//! emulation thread) and host-hardware controllers (which may poll real
//! devices from background threads). Background activity crosses into the
//! emulation domain through exactly two synchronized operations:
//!
//! - publishing a device list (a per-controller single-slot mailbox; the
//!   superseded list is retained until explicitly released after listeners
//!   have been notified);
//! - completing a transfer (a lock-guarded move from the device's
//!   `incomplete` list to its `pending` list).
//!
//! Both operations only record state and schedule a zero-delay event through
//! the cross-thread scheduler handle, so every guest-visible transition still
//! happens on the emulation thread. Pending completions are drained in one
//! batched pass per event, which matters for isochronous bursts.

mod device;
mod emulated;
mod host;

pub use device::{
    restore_outstanding_tags, OpenDevice, TransferResult, TransferTicket, UsbDeviceClient,
    UsbPortDriver,
};
pub use emulated::EmulatedController;
pub use host::{DeviceChangeListener, DeviceListPublisher, OpenError, UsbController, UsbHost};

/// Size of the opaque per-transfer tag backends attach to requests. The bus
/// never interprets it; it is also the only part of an outstanding transfer
/// that survives a save-state.
pub const TRANSFER_TAG_LEN: usize = 16;
pub type TransferTag = [u8; TRANSFER_TAG_LEN];

/// Transfer/request status values. Positive statuses are byte counts.
pub mod status {
    pub const SUCCESS: i32 = 0;
    /// Delivered for every outstanding tag restored from a save-state, and for
    /// requests against a device that went away: real-hardware I/O cannot be
    /// resumed, and the contract says so rather than faking it.
    pub const DISCONNECTED: i32 = -1;
    /// Request against a closed or missing device.
    pub const NO_DEVICE: i32 = -4;
    /// The historical catch-all for unserviceable transfers.
    pub const TRANSFER_FAILED: i32 = -7022;
    /// Force-completed by cancellation. Shares the historical wire value with
    /// [`TRANSFER_FAILED`].
    pub const CANCELLED: i32 = TRANSFER_FAILED;
}

/// Standard control-request setup packet, as read out of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(pub u32);

/// Identity of one physical device: the controller that enumerated it plus an
/// opaque per-controller token (for real hardware, typically bus/port). The
/// global open-set is keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenKey {
    pub controller: ControllerId,
    pub token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDescriptor {
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// One enumerated device as seen by change listeners and `open_vid_pid`.
///
/// `is_open` is stamped from the global open-set when lists are merged for
/// notification; publishers must leave it `false`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub vid: u16,
    pub pid: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub name: String,
    pub open_key: OpenKey,
    pub configs: Vec<ConfigDescriptor>,
    pub is_open: bool,
}

impl Default for OpenKey {
    fn default() -> Self {
        Self {
            controller: ControllerId(0),
            token: 0,
        }
    }
}

impl DeviceDescriptor {
    /// True if the device class, or any interface class of any configuration,
    /// matches. Insertion hooks match on interface classes too.
    pub fn matches_class(&self, class: u8) -> bool {
        if self.device_class == class {
            return true;
        }
        self.configs
            .iter()
            .flat_map(|c| c.interfaces.iter())
            .any(|i| i.interface_class == class)
    }
}
