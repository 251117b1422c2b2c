//! Root node of the version-0 USB device interface.
//!
//! Serves the enumeration surface: the class-filtered device list, root-hub
//! port-status stubs, and device-insertion hooks. A hook is a suspended
//! command that replies when a matching device is plugged in (or is already
//! present when the hook is installed); cancelling it replies with the
//! historical cancelled-hook status.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;

use starlet_io_snapshot::{
    Decoder, Encoder, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter,
};
use starlet_usb::{DeviceChangeListener, DeviceDescriptor, OpenKey};
use tracing::{debug, info};

use crate::block::CommandBlock;
use crate::device::{DeviceRc, DeviceRegistry, Disposition, IpcContext, IpcDevice};
use crate::devices::usb_v0;
use crate::{fs_status, IoctlvBuffer};

pub const USB_ROOT_DEVICE_NAME: &str = "/dev/usb/oh0";

const MAX_HOOKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InsertionHook {
    vid: u16,
    pid: u16,
    class: u8,
    command: u32,
}

impl InsertionHook {
    /// Class matches on the device class or any interface class; zero fields
    /// are wildcards. Already-open devices never match a hook.
    fn matches(&self, desc: &DeviceDescriptor) -> bool {
        if desc.is_open {
            return false;
        }
        if self.class != 0 && !desc.matches_class(self.class) {
            return false;
        }
        if self.vid != 0 && desc.vid != self.vid {
            return false;
        }
        if self.pid != 0 && desc.pid != self.pid {
            return false;
        }
        true
    }
}

pub struct UsbRootDevice {
    hooks: BTreeMap<u32, InsertionHook>,
    next_hook_id: u32,
    seen: HashSet<OpenKey>,
    /// Replies produced outside a dispatcher call (hook matches from hot-plug
    /// callbacks); flushed by `update`.
    ready: VecDeque<(u32, i32)>,
}

impl UsbRootDevice {
    pub fn new() -> Self {
        Self {
            hooks: BTreeMap::new(),
            next_hook_id: 0,
            seen: HashSet::new(),
            ready: VecDeque::new(),
        }
    }

    /// Singleton: every open of the root node shares one backend, and the
    /// backend stays registered as a bus change listener for its lifetime.
    pub fn register(registry: &mut DeviceRegistry) {
        let cached: RefCell<Option<Rc<RefCell<UsbRootDevice>>>> = RefCell::new(None);
        registry.register(move |ctx, name| {
            if name != USB_ROOT_DEVICE_NAME {
                return None;
            }
            let mut cached = cached.borrow_mut();
            let device = match cached.as_ref() {
                Some(device) => Rc::clone(device),
                None => {
                    let device = Rc::new(RefCell::new(UsbRootDevice::new()));
                    ctx.usb.register_change_listener(device.clone());
                    *cached = Some(Rc::clone(&device));
                    device
                }
            };
            Some(device as DeviceRc)
        });
    }

    fn add_hook(
        &mut self,
        ctx: &mut IpcContext<'_>,
        vid: u16,
        pid: u16,
        class: u8,
        command: u32,
    ) -> u32 {
        self.next_hook_id = self.next_hook_id.wrapping_add(1);
        let id = self.next_hook_id;
        let hook = InsertionHook {
            vid,
            pid,
            class,
            command,
        };
        info!(id, vid, pid, class, "device insertion hook installed");

        // A matching device may already be present.
        if let Some(_desc) = ctx.usb.device_list().iter().find(|d| hook.matches(d)) {
            debug!(id, "insertion hook matched an existing device");
            self.ready.push_back((command, fs_status::SUCCESS));
        } else {
            self.hooks.insert(id, hook);
        }
        id
    }
}

impl Default for UsbRootDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceChangeListener for UsbRootDevice {
    fn devices_changed(&mut self, devices: &[DeviceDescriptor]) {
        debug!(count = devices.len(), "usb root saw device change");
        let mut seen = HashSet::with_capacity(devices.len());
        for desc in devices {
            seen.insert(desc.open_key);
            if self.seen.contains(&desc.open_key) {
                continue;
            }
            // Newly inserted device: the first matching hook fires.
            let matched = self
                .hooks
                .iter()
                .find(|(_, h)| h.matches(desc))
                .map(|(&id, h)| (id, h.command));
            if let Some((id, command)) = matched {
                debug!(id, "insertion hook matched a new device");
                self.ready.push_back((command, fs_status::SUCCESS));
                self.hooks.remove(&id);
            }
        }
        self.seen = seen;
    }
}

impl IpcDevice for UsbRootDevice {
    fn name(&self) -> &str {
        USB_ROOT_DEVICE_NAME
    }

    fn open(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock, _mode: u32) -> i32 {
        fs_status::SUCCESS
    }

    fn ioctl(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        let request = block.arg(ctx.mem, 0);
        let buffer_in = block.arg(ctx.mem, 1);
        let buffer_out = block.arg(ctx.mem, 3);
        debug!(request, "usb root ioctl");

        let status = match request {
            usb_v0::IOCTL_GETRHDESCA => {
                // Not meaningfully emulated; known value keeps probes moving.
                ctx.mem.write_u32(buffer_out, 0xDEAD_BEEF);
                fs_status::SUCCESS
            }
            usb_v0::IOCTL_CANCEL_INSERT_NOTIFY => {
                let id = ctx.mem.read_u32(buffer_in);
                match self.hooks.remove(&id) {
                    Some(hook) => {
                        self.ready.push_back((hook.command, usb_v0::HOOK_CANCELLED));
                        fs_status::SUCCESS
                    }
                    None => fs_status::EINVAL,
                }
            }
            _ => fs_status::EINVAL,
        };

        block.set_result(ctx.mem, status);
        Disposition::Reply
    }

    fn ioctlv(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        let v = IoctlvBuffer::parse(ctx.mem, block);
        debug!(parameter = v.parameter, "usb root ioctlv");

        let status = match v.parameter {
            usb_v0::IOCTLV_GETDEVLIST => {
                let (Some(max), Some(class), Some(count_out), Some(list_out)) = (
                    v.in_u8(ctx.mem, 0),
                    v.in_u8(ctx.mem, 1),
                    v.payload_buffers.first().copied(),
                    v.payload_buffers.get(1).copied(),
                ) else {
                    return self.unimplemented(ctx, block, "GETDEVLIST");
                };

                let mut written = 0u8;
                for desc in ctx.usb.device_list() {
                    if written == max {
                        break;
                    }
                    if class != 0 && desc.device_class != class {
                        continue;
                    }
                    // 8-byte entries: reserved word, then vid and pid.
                    let entry = list_out.address + u32::from(written) * 8;
                    ctx.mem.write_u32(entry, 0);
                    ctx.mem.write_u16(entry + 4, desc.vid);
                    ctx.mem.write_u16(entry + 6, desc.pid);
                    written += 1;
                }
                ctx.mem.write_u8(count_out.address, written);
                fs_status::SUCCESS
            }
            usb_v0::IOCTLV_GETRHPORTSTATUS => {
                info!("root-hub port status stub");
                if let Some(out) = v.payload_buffers.first() {
                    ctx.mem.write_u32(out.address, 0);
                }
                fs_status::SUCCESS
            }
            usb_v0::IOCTLV_SETRHPORTSTATUS => {
                info!("set root-hub port status stub");
                fs_status::SUCCESS
            }
            usb_v0::IOCTLV_DEVINSERTHOOK => {
                let (Some(vid), Some(pid)) = (v.in_u16(ctx.mem, 0), v.in_u16(ctx.mem, 1)) else {
                    return self.unimplemented(ctx, block, "DEVINSERTHOOK");
                };
                self.add_hook(ctx, vid, pid, 0, block.address);
                return Disposition::Suspend;
            }
            usb_v0::IOCTLV_DEVCLASSCHANGE => {
                let Some(class) = v.in_u8(ctx.mem, 0) else {
                    return self.unimplemented(ctx, block, "DEVCLASSCHANGE");
                };
                self.add_hook(ctx, 0, 0, class, block.address);
                return Disposition::Suspend;
            }
            usb_v0::IOCTLV_DEVINSERTHOOKID => {
                let (Some(vid), Some(pid), Some(class), Some(id_out)) = (
                    v.in_u16(ctx.mem, 0),
                    v.in_u16(ctx.mem, 1),
                    v.in_u8(ctx.mem, 2),
                    v.payload_buffers.first().copied(),
                ) else {
                    return self.unimplemented(ctx, block, "DEVINSERTHOOKID");
                };
                let id = self.add_hook(ctx, vid, pid, class, block.address);
                ctx.mem.write_u32(id_out.address, id);
                return Disposition::Suspend;
            }
            _ => fs_status::EINVAL,
        };

        block.set_result(ctx.mem, status);
        Disposition::Reply
    }

    fn update(&mut self, ctx: &mut IpcContext<'_>) -> bool {
        let mut progressed = false;
        while let Some((addr, status)) = self.ready.pop_front() {
            let block = CommandBlock::new(addr);
            block.set_result(ctx.mem, status);
            ctx.enqueue_reply(addr, 0);
            progressed = true;
        }
        progressed
    }

    fn save_state(&self) -> Vec<u8> {
        const TAG_HOOKS: u16 = 1;
        const TAG_NEXT_HOOK_ID: u16 = 2;
        const TAG_READY: u16 = 3;

        let mut w = SnapshotWriter::new(*b"USBR", SnapshotVersion::new(1, 0));

        let mut enc = Encoder::new().u32(self.hooks.len() as u32);
        for (id, hook) in &self.hooks {
            enc = enc
                .u32(*id)
                .u16(hook.vid)
                .u16(hook.pid)
                .u8(hook.class)
                .u32(hook.command);
        }
        w.field_bytes(TAG_HOOKS, enc.finish());
        w.field_u32(TAG_NEXT_HOOK_ID, self.next_hook_id);

        let mut enc = Encoder::new().u32(self.ready.len() as u32);
        for (addr, status) in &self.ready {
            enc = enc.u32(*addr).u32(*status as u32);
        }
        w.field_bytes(TAG_READY, enc.finish());

        w.finish()
    }

    fn load_state(&mut self, _ctx: &mut IpcContext<'_>, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_HOOKS: u16 = 1;
        const TAG_NEXT_HOOK_ID: u16 = 2;
        const TAG_READY: u16 = 3;

        let r = SnapshotReader::parse(bytes, *b"USBR")?;
        r.ensure_device_major(1)?;

        let mut hooks = BTreeMap::new();
        if let Some(buf) = r.bytes(TAG_HOOKS) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > MAX_HOOKS {
                return Err(SnapshotError::InvalidFieldEncoding("hook count"));
            }
            for _ in 0..count {
                let id = d.u32()?;
                let hook = InsertionHook {
                    vid: d.u16()?,
                    pid: d.u16()?,
                    class: d.u8()?,
                    command: d.u32()?,
                };
                hooks.insert(id, hook);
            }
            d.finish()?;
        }

        let mut ready = VecDeque::new();
        if let Some(buf) = r.bytes(TAG_READY) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > MAX_HOOKS {
                return Err(SnapshotError::InvalidFieldEncoding("ready reply count"));
            }
            for _ in 0..count {
                let addr = d.u32()?;
                let status = d.u32()? as i32;
                ready.push_back((addr, status));
            }
            d.finish()?;
        }

        self.hooks = hooks;
        self.next_hook_id = r.u32(TAG_NEXT_HOOK_ID)?.unwrap_or(0);
        self.ready = ready;
        // The seen-set is a run-time view; the next hot-plug callback
        // rebuilds it.
        self.seen.clear();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
