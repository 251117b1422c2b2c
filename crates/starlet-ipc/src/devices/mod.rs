//! In-tree device backends.
//!
//! Everything here is consumed strictly through the [`crate::IpcDevice`]
//! contract; further device families (storage, network, wireless controllers)
//! plug in through the same registry without dispatcher changes.

mod keyboard;
mod stub;
mod usb_passthrough;
mod usb_root;

pub use keyboard::{KeyboardDevice, KEYBOARD_DEVICE_NAME};
pub use stub::StubDevice;
pub use usb_passthrough::UsbPassthroughDevice;
pub use usb_root::{UsbRootDevice, USB_ROOT_DEVICE_NAME};

/// Request numbers of the version-0 USB device interface. Historical ABI.
pub mod usb_v0 {
    pub const IOCTLV_CTRLMSG: u32 = 0;
    pub const IOCTLV_BLKMSG: u32 = 1;
    pub const IOCTLV_INTRMSG: u32 = 2;
    pub const IOCTL_SUSPENDDEV: u32 = 5;
    pub const IOCTL_RESUMEDEV: u32 = 6;
    pub const IOCTLV_ISOMSG: u32 = 9;
    pub const IOCTLV_LBLKMSG: u32 = 10;
    pub const IOCTLV_GETDEVLIST: u32 = 12;
    pub const IOCTL_GETRHDESCA: u32 = 15;
    pub const IOCTLV_GETRHPORTSTATUS: u32 = 20;
    pub const IOCTLV_SETRHPORTSTATUS: u32 = 25;
    pub const IOCTL_DEVREMOVALHOOK: u32 = 26;
    pub const IOCTLV_DEVINSERTHOOK: u32 = 27;
    pub const IOCTLV_DEVCLASSCHANGE: u32 = 28;
    pub const IOCTL_RESET_DEVICE: u32 = 29;
    pub const IOCTLV_DEVINSERTHOOKID: u32 = 30;
    pub const IOCTL_CANCEL_INSERT_NOTIFY: u32 = 31;

    /// Status written to a hook command when the guest cancels it.
    pub const HOOK_CANCELLED: i32 = -7022;
}
