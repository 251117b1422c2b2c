//! High-level emulation of the console's IPC device-driver protocol.
//!
//! Guest drivers talk to the microkernel's device tree by writing a command
//! block into guest memory and ringing the IPC doorbell register. The
//! [`IpcDispatcher`] pops one command per emulated time slice, resolves the
//! descriptor through its fixed-capacity handle table, and invokes one
//! operation on the named backend. Replies are paced through a monotonic
//! watermark so a fast device can never answer before an earlier, slower one.
//!
//! This reproduces a fixed historical protocol: status codes, reply ordering
//! and save-state layout are observable behavior, not implementation details.

pub mod block;
pub mod device;
pub mod devices;
pub mod dispatcher;
pub mod doorbell;

pub use block::{CommandBlock, IoVec, IoctlvBuffer};
pub use device::{Disposition, DeviceRegistry, IpcContext, IpcDevice};
pub use dispatcher::{IpcDispatcher, IPC_MAX_FDS};
pub use doorbell::{CtrlFlags, IpcDoorbell};

/// IPC command kinds, as read from offset 0 of the command block.
pub const CMD_OPEN: u32 = 1;
pub const CMD_CLOSE: u32 = 2;
pub const CMD_READ: u32 = 3;
pub const CMD_WRITE: u32 = 4;
pub const CMD_SEEK: u32 = 5;
pub const CMD_IOCTL: u32 = 6;
pub const CMD_IOCTLV: u32 = 7;

/// The kernel overwrites the command word with this once a request has been
/// executed; it is not a valid command.
pub const CMD_REPLY_SENTINEL: u32 = 8;

/// The historical file-system status table. Guest-visible I/O failures are
/// these values written to the command block's return word, expected and
/// frequent, never an emulator error.
pub mod fs_status {
    pub const SUCCESS: i32 = 0;
    /// Permission denied.
    pub const EACCES: i32 = -1;
    /// File exists.
    pub const EEXIST: i32 = -2;
    /// Invalid argument or descriptor.
    pub const EINVAL: i32 = -4;
    /// No such device or file.
    pub const ENOENT: i32 = -6;
    /// Resource busy.
    pub const EBUSY: i32 = -8;
    /// ECC error.
    pub const EIO: i32 = -12;
    /// Allocation failed during request.
    pub const ENOMEM: i32 = -22;
    /// Fatal error.
    pub const EFATAL: i32 = -101;
    /// Permission denied (extended table).
    pub const EACCES_EXT: i32 = -102;
    /// Corrupted backing store.
    pub const ECORRUPT: i32 = -103;
    /// File exists (extended table).
    pub const EEXIST_EXT: i32 = -105;
    /// No such file (extended table).
    pub const ENOENT_EXT: i32 = -106;
    /// Too many descriptors open.
    pub const ENFILE: i32 = -107;
    /// Maximum block count reached.
    pub const EFBIG: i32 = -108;
    /// Descriptor table exhausted.
    pub const EFDEXHAUSTED: i32 = -109;
    /// Pathname too long.
    pub const ENAMELEN: i32 = -110;
    /// Descriptor already open.
    pub const EFDOPEN: i32 = -111;
    /// ECC error (extended table).
    pub const EIO_EXT: i32 = -114;
    /// Directory not empty.
    pub const ENOTEMPTY: i32 = -115;
    /// Maximum directory depth exceeded.
    pub const EDIRDEPTH: i32 = -116;
    /// Resource busy (extended table).
    pub const EBUSY_EXT: i32 = -118;
}

/// Longest device name an Open command may carry, NUL terminator included.
pub const MAX_DEVICE_NAME_LEN: usize = 64;
