//! The device backend contract and the name registry.

use std::cell::RefCell;
use std::rc::Rc;

use starlet_io_snapshot::SnapshotResult;
use starlet_memory::GuestMemory;
use starlet_timing::{EventId, Scheduler};
use starlet_usb::UsbHost;
use tracing::warn;

use crate::block::CommandBlock;
use crate::fs_status;

/// How a backend finished one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; the dispatcher schedules the reply, paced by the watermark.
    Reply,
    /// The backend will finish later and call
    /// [`IpcContext::enqueue_reply`] itself (blocking reads, asynchronous
    /// transfers). The emulation thread is never blocked either way.
    Suspend,
}

/// Everything a backend operation may touch, passed by reference for the
/// duration of one call. The dispatcher's reply pacing state rides along so
/// suspended backends honor the same contract when they reply late.
pub struct IpcContext<'a> {
    pub mem: &'a mut dyn GuestMemory,
    pub scheduler: &'a mut Scheduler,
    pub usb: &'a mut UsbHost,
    pub(crate) reply_event: EventId,
    pub(crate) last_reply_time: &'a mut u64,
}

impl IpcContext<'_> {
    /// Schedules a reply for the command block at `addr`.
    ///
    /// The delay is clamped upward to at least `last_reply_time - now`: a
    /// later-issued, faster command can never reply before an earlier, slower
    /// one. The watermark couples unrelated devices' reply timing by design;
    /// games depend on the ordering it produces.
    pub fn enqueue_reply(&mut self, addr: u32, delay_ticks: u64) {
        let now = self.scheduler.now();
        let floor = self.last_reply_time.saturating_sub(now);
        let delay = delay_ticks.max(floor);
        *self.last_reply_time = now + delay;
        self.scheduler.schedule(delay, self.reply_event, u64::from(addr));
    }
}

/// One IPC device backend.
///
/// Backends never raise errors across this boundary: guest-visible failures
/// are status codes written into the command block, and every operation
/// defaults to the unimplemented path (diagnostic plus invalid-argument)
/// rather than a panic.
pub trait IpcDevice {
    /// Stable name. Doubles as the Open lookup key and the save-state
    /// rehydration key.
    fn name(&self) -> &str;

    /// Returns the open status: 0 grants the descriptor, negative refuses it.
    fn open(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock, _mode: u32) -> i32 {
        warn!(device = self.name(), "device does not support Open()");
        fs_status::ENOENT
    }

    /// `block` is `None` for forced closes (machine reset), which produce no
    /// reply. The dispatcher frees the descriptor slot regardless of the
    /// outcome reported here.
    fn close(
        &mut self,
        ctx: &mut IpcContext<'_>,
        block: Option<&CommandBlock>,
        _force: bool,
    ) -> Disposition {
        if let Some(block) = block {
            block.set_result(ctx.mem, fs_status::SUCCESS);
        }
        Disposition::Reply
    }

    fn seek(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        self.unimplemented(ctx, block, "Seek")
    }

    fn read(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        self.unimplemented(ctx, block, "Read")
    }

    fn write(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        self.unimplemented(ctx, block, "Write")
    }

    fn ioctl(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        self.unimplemented(ctx, block, "IOCtl")
    }

    fn ioctlv(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        self.unimplemented(ctx, block, "IOCtlV")
    }

    /// Simulated processing time for the reply to `block`, in ticks.
    fn cmd_delay(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock) -> u64 {
        0
    }

    /// Per-slice hook for backends with their own completion paths. Returns
    /// true if the backend made progress (the dispatcher stops the sweep
    /// there for this slice).
    fn update(&mut self, _ctx: &mut IpcContext<'_>) -> bool {
        false
    }

    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_state(&mut self, _ctx: &mut IpcContext<'_>, _bytes: &[u8]) -> SnapshotResult<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Shared unimplemented-operation path; spelled out so backends can reuse
    /// it for individual unsupported sub-commands.
    fn unimplemented(
        &mut self,
        ctx: &mut IpcContext<'_>,
        block: &CommandBlock,
        what: &str,
    ) -> Disposition {
        warn!(device = self.name(), operation = what, "unimplemented IPC operation");
        block.set_result(ctx.mem, fs_status::EINVAL);
        Disposition::Reply
    }
}

pub type DeviceRc = Rc<RefCell<dyn IpcDevice>>;

type Factory = Box<dyn Fn(&mut IpcContext<'_>, &str) -> Option<DeviceRc>>;

/// Ordered list of backend factories. `Open` and save-state rehydration both
/// resolve names here; the first factory that accepts a name wins.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: Vec<Factory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        factory: impl Fn(&mut IpcContext<'_>, &str) -> Option<DeviceRc> + 'static,
    ) {
        self.factories.push(Box::new(factory));
    }

    pub fn create(&self, ctx: &mut IpcContext<'_>, name: &str) -> Option<DeviceRc> {
        self.factories.iter().find_map(|f| f(ctx, name))
    }
}
