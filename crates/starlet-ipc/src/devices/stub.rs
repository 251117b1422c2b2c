//! Stub backend for protocol-only device nodes.
//!
//! Fakes success for open/close/ioctl/ioctlv so guests that merely probe a
//! node keep running. Registered per name.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::block::CommandBlock;
use crate::device::{DeviceRegistry, Disposition, IpcContext, IpcDevice};
use crate::fs_status;

pub struct StubDevice {
    name: String,
}

impl StubDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn register(registry: &mut DeviceRegistry, name: &'static str) {
        registry.register(move |_ctx, open_name| {
            (open_name == name)
                .then(|| Rc::new(RefCell::new(StubDevice::new(name))) as crate::device::DeviceRc)
        });
    }
}

impl IpcDevice for StubDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock, _mode: u32) -> i32 {
        warn!(device = %self.name, "stub faking Open()");
        fs_status::SUCCESS
    }

    fn ioctl(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        warn!(device = %self.name, "stub faking IOCtl()");
        block.set_result(ctx.mem, fs_status::SUCCESS);
        Disposition::Reply
    }

    fn ioctlv(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        warn!(device = %self.name, "stub faking IOCtlV()");
        block.set_result(ctx.mem, fs_status::SUCCESS);
        Disposition::Reply
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
