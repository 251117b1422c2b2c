//! The IPC command dispatcher.
//!
//! Runs entirely on the single-threaded emulation domain: the handle table,
//! both queues and the watermark need no locking. Once per emulated time
//! slice, [`IpcDispatcher::update`] pops at most one request, executes it, and
//! delivers at most one ready reply.

use std::collections::VecDeque;
use std::rc::Rc;

use starlet_io_snapshot::{
    Decoder, Encoder, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter,
};
use starlet_memory::GuestMemory;
use starlet_timing::{EventId, Scheduler};
use starlet_usb::UsbHost;
use tracing::{info, warn};

use crate::block::CommandBlock;
use crate::device::{DeviceRc, DeviceRegistry, Disposition, IpcContext};
use crate::doorbell::IpcDoorbell;
use crate::{
    fs_status, CMD_CLOSE, CMD_IOCTL, CMD_IOCTLV, CMD_OPEN, CMD_READ, CMD_SEEK, CMD_WRITE,
    MAX_DEVICE_NAME_LEN,
};

/// Fixed handle-table capacity, a property of the emulated kernel.
pub const IPC_MAX_FDS: usize = 24;

/// One distinct open backend plus the number of descriptor slots that refer
/// to it.
struct DeviceRef {
    device: DeviceRc,
    instances: u32,
}

pub struct IpcDispatcher {
    fd_table: Vec<Option<DeviceRc>>,
    devices: Vec<DeviceRef>,
    request_queue: VecDeque<u32>,
    reply_queue: VecDeque<u32>,
    last_reply_time: u64,
    reply_event: EventId,
    registry: DeviceRegistry,
}

impl IpcDispatcher {
    pub fn new(scheduler: &mut Scheduler, registry: DeviceRegistry) -> Self {
        let reply_event = scheduler.register_event("ipc-reply");
        Self {
            fd_table: (0..IPC_MAX_FDS).map(|_| None).collect(),
            devices: Vec::new(),
            request_queue: VecDeque::new(),
            reply_queue: VecDeque::new(),
            last_reply_time: 0,
            reply_event,
            registry,
        }
    }

    /// Called as soon as the doorbell sees a new command pointer.
    pub fn enqueue_request(&mut self, addr: u32) {
        self.request_queue.push_back(addr);
    }

    /// Routes a fired reply event: the address moves onto the reply queue and
    /// is delivered by a later `update`. Returns false for foreign events.
    pub fn process_event(&mut self, id: EventId, userdata: u64) -> bool {
        if id == self.reply_event {
            self.reply_queue.push_back(userdata as u32);
            true
        } else {
            false
        }
    }

    pub fn last_reply_time(&self) -> u64 {
        self.last_reply_time
    }

    pub fn open_descriptor_count(&self) -> usize {
        self.fd_table.iter().filter(|slot| slot.is_some()).count()
    }

    /// Looks up a distinct open backend by name (event injection, tests).
    pub fn device_by_name(&self, name: &str) -> Option<DeviceRc> {
        self.devices
            .iter()
            .find(|entry| entry.device.borrow().name() == name)
            .map(|entry| Rc::clone(&entry.device))
    }

    /// One pass of the dispatcher, once per emulated time slice.
    pub fn update(
        &mut self,
        mem: &mut dyn GuestMemory,
        scheduler: &mut Scheduler,
        usb: &mut UsbHost,
        doorbell: &mut IpcDoorbell,
    ) {
        while let Some(addr) = doorbell.take_request() {
            self.enqueue_request(addr);
        }

        if !doorbell.is_ready() {
            return;
        }

        self.update_devices(mem, scheduler, usb);

        if let Some(addr) = self.request_queue.pop_front() {
            doorbell.generate_ack();
            info!(addr = format_args!("{addr:#010x}"), "acknowledge IPC request");
            self.execute_command(addr, mem, scheduler, usb);
        }

        if let Some(addr) = self.reply_queue.pop_front() {
            info!(addr = format_args!("{addr:#010x}"), "reply to IPC request");
            doorbell.generate_reply(addr);
        }
    }

    /// Gives every distinct open backend its completion-path hook, stopping
    /// at the first one that made progress this slice.
    fn update_devices(
        &mut self,
        mem: &mut dyn GuestMemory,
        scheduler: &mut Scheduler,
        usb: &mut UsbHost,
    ) {
        let devices: Vec<DeviceRc> = self.devices.iter().map(|e| Rc::clone(&e.device)).collect();
        let mut ctx = IpcContext {
            mem,
            scheduler,
            usb,
            reply_event: self.reply_event,
            last_reply_time: &mut self.last_reply_time,
        };
        for device in devices {
            if device.borrow_mut().update(&mut ctx) {
                break;
            }
        }
    }

    fn execute_command(
        &mut self,
        addr: u32,
        mem: &mut dyn GuestMemory,
        scheduler: &mut Scheduler,
        usb: &mut UsbHost,
    ) {
        let block = CommandBlock::new(addr);
        let command = block.command(mem);
        let fd = block.fd(mem);

        let slot_device: Option<DeviceRc> = match usize::try_from(fd) {
            Ok(idx) if idx < IPC_MAX_FDS => self.fd_table[idx].as_ref().map(Rc::clone),
            _ => None,
        };

        let mut ctx = IpcContext {
            mem,
            scheduler,
            usb,
            reply_event: self.reply_event,
            last_reply_time: &mut self.last_reply_time,
        };

        // The device whose simulated delay paces the reply; Open swaps in the
        // freshly resolved backend.
        let mut delay_device: Option<DeviceRc> = slot_device.clone();

        let disposition = match command {
            CMD_OPEN => {
                let name_ptr = block.arg(ctx.mem, 0);
                let mode = block.arg(ctx.mem, 1);
                let name = ctx.mem.read_cstr(name_ptr, MAX_DEVICE_NAME_LEN);

                match self.fd_table.iter().position(Option::is_none) {
                    None => {
                        block.set_result(ctx.mem, fs_status::EFDEXHAUSTED);
                        delay_device = None;
                    }
                    Some(slot) => match self.registry.create(&mut ctx, &name) {
                        None => {
                            warn!(name = %name, "open of unimplemented device");
                            block.set_result(ctx.mem, fs_status::ENOENT);
                            delay_device = None;
                        }
                        Some(device) => {
                            let err = device.borrow_mut().open(&mut ctx, &block, mode);
                            info!(name = %name, slot, err, "IPC open");
                            if err == fs_status::SUCCESS {
                                block.set_result(ctx.mem, slot as i32);
                                self.fd_table[slot] = Some(Rc::clone(&device));
                                Self::retain(&mut self.devices, &device);
                            } else {
                                block.set_result(ctx.mem, err);
                            }
                            delay_device = Some(device);
                        }
                    },
                }
                Disposition::Reply
            }
            CMD_CLOSE => match slot_device {
                Some(device) => {
                    self.fd_table[fd as usize] = None;
                    Self::release(&mut self.devices, &device);
                    device.borrow_mut().close(&mut ctx, Some(&block), false)
                }
                None => {
                    block.set_result(ctx.mem, fs_status::EINVAL);
                    Disposition::Reply
                }
            },
            CMD_READ | CMD_WRITE | CMD_SEEK | CMD_IOCTL | CMD_IOCTLV => match slot_device {
                Some(device) => {
                    let mut dev = device.borrow_mut();
                    match command {
                        CMD_READ => dev.read(&mut ctx, &block),
                        CMD_WRITE => dev.write(&mut ctx, &block),
                        CMD_SEEK => dev.seek(&mut ctx, &block),
                        CMD_IOCTL => dev.ioctl(&mut ctx, &block),
                        CMD_IOCTLV => dev.ioctlv(&mut ctx, &block),
                        _ => unreachable!(),
                    }
                }
                None => {
                    block.set_result(ctx.mem, fs_status::EINVAL);
                    Disposition::Reply
                }
            },
            // Only reachable through an emulator bug, never guest input;
            // continuing would silently corrupt later emulation.
            _ => panic!("unknown IPC command {command} at {addr:#010x}"),
        };

        match disposition {
            Disposition::Reply => {
                block.mark_executed(ctx.mem, command);
                let delay = match delay_device {
                    Some(device) => device.borrow_mut().cmd_delay(&mut ctx, &block),
                    None => 0,
                };
                ctx.enqueue_reply(addr, delay);
            }
            Disposition::Suspend => {
                // The backend owns the reply now; nothing is scheduled until
                // it calls `enqueue_reply` itself.
            }
        }
    }

    fn retain(devices: &mut Vec<DeviceRef>, device: &DeviceRc) {
        match devices
            .iter_mut()
            .find(|e| Rc::ptr_eq(&e.device, device))
        {
            Some(entry) => entry.instances += 1,
            None => devices.push(DeviceRef {
                device: Rc::clone(device),
                instances: 1,
            }),
        }
    }

    /// Drops one descriptor reference; the backend itself is destroyed when
    /// the count reaches zero.
    fn release(devices: &mut Vec<DeviceRef>, device: &DeviceRc) {
        let Some(idx) = devices.iter().position(|e| Rc::ptr_eq(&e.device, device)) else {
            warn!("descriptor released for an untracked backend");
            return;
        };
        devices[idx].instances -= 1;
        if devices[idx].instances == 0 {
            devices.remove(idx);
        }
    }

    /// Hard reset: force-close every descriptor (no replies), flush both
    /// queues and any scheduled reply events, and zero the watermark.
    pub fn reset(
        &mut self,
        mem: &mut dyn GuestMemory,
        scheduler: &mut Scheduler,
        usb: &mut UsbHost,
    ) {
        scheduler.remove_all(self.reply_event);

        let open: Vec<DeviceRc> = self.fd_table.iter().flatten().map(Rc::clone).collect();
        for slot in self.fd_table.iter_mut() {
            *slot = None;
        }
        {
            let mut ctx = IpcContext {
                mem,
                scheduler,
                usb,
                reply_event: self.reply_event,
                last_reply_time: &mut self.last_reply_time,
            };
            for device in open {
                device.borrow_mut().close(&mut ctx, None, true);
            }
        }
        self.devices.clear();
        self.request_queue.clear();
        self.reply_queue.clear();
        self.last_reply_time = 0;
    }

    // ----------------------------------------
    // Save-state
    // ----------------------------------------
    //
    // Fixed layout for version compatibility: request queue, reply queue,
    // watermark, then per distinct open backend a (name, state) pair, then
    // per descriptor slot an index into that list or "empty". A backend
    // shared by several slots serializes once.

    const SNAPSHOT_ID: [u8; 4] = *b"IPCD";
    const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    const TAG_REQUEST_QUEUE: u16 = 1;
    const TAG_REPLY_QUEUE: u16 = 2;
    const TAG_LAST_REPLY_TIME: u16 = 3;
    const TAG_DEVICES: u16 = 4;
    const TAG_FD_TABLE: u16 = 5;

    pub fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::SNAPSHOT_ID, Self::SNAPSHOT_VERSION);

        let encode_queue = |queue: &VecDeque<u32>| {
            let mut enc = Encoder::new().u32(queue.len() as u32);
            for addr in queue {
                enc = enc.u32(*addr);
            }
            enc.finish()
        };
        w.field_bytes(Self::TAG_REQUEST_QUEUE, encode_queue(&self.request_queue));
        w.field_bytes(Self::TAG_REPLY_QUEUE, encode_queue(&self.reply_queue));
        w.field_u64(Self::TAG_LAST_REPLY_TIME, self.last_reply_time);

        let mut enc = Encoder::new().u32(self.devices.len() as u32);
        for entry in &self.devices {
            let dev = entry.device.borrow();
            let state = dev.save_state();
            enc = enc.str(dev.name()).u32(state.len() as u32).bytes(&state);
        }
        w.field_bytes(Self::TAG_DEVICES, enc.finish());

        let mut enc = Encoder::new();
        for slot in &self.fd_table {
            let idx = slot
                .as_ref()
                .and_then(|dev| {
                    self.devices
                        .iter()
                        .position(|e| Rc::ptr_eq(&e.device, dev))
                })
                .map_or(-1i32, |i| i as i32);
            enc = enc.u32(idx as u32);
        }
        w.field_bytes(Self::TAG_FD_TABLE, enc.finish());

        w.finish()
    }

    /// Rehydrates the dispatcher. Backends are reconstructed by name through
    /// the registry, then fed their own serialized state. On any error the
    /// dispatcher is left untouched.
    pub fn load_state(
        &mut self,
        bytes: &[u8],
        mem: &mut dyn GuestMemory,
        scheduler: &mut Scheduler,
        usb: &mut UsbHost,
    ) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::SNAPSHOT_ID)?;
        r.ensure_device_major(Self::SNAPSHOT_VERSION.major)?;

        let decode_queue = |buf: Option<&[u8]>| -> SnapshotResult<VecDeque<u32>> {
            let Some(buf) = buf else {
                return Ok(VecDeque::new());
            };
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > 0x1000 {
                return Err(SnapshotError::InvalidFieldEncoding("ipc queue length"));
            }
            let mut queue = VecDeque::with_capacity(count);
            for _ in 0..count {
                queue.push_back(d.u32()?);
            }
            d.finish()?;
            Ok(queue)
        };
        let request_queue = decode_queue(r.bytes(Self::TAG_REQUEST_QUEUE))?;
        let reply_queue = decode_queue(r.bytes(Self::TAG_REPLY_QUEUE))?;
        let last_reply_time = r.u64(Self::TAG_LAST_REPLY_TIME)?.unwrap_or(0);

        // Reconstruct the distinct-backend list.
        let mut restored: Vec<DeviceRc> = Vec::new();
        {
            let mut ctx = IpcContext {
                mem,
                scheduler,
                usb,
                reply_event: self.reply_event,
                last_reply_time: &mut self.last_reply_time,
            };
            if let Some(buf) = r.bytes(Self::TAG_DEVICES) {
                let mut d = Decoder::new(buf);
                let count = d.u32()? as usize;
                if count > IPC_MAX_FDS {
                    return Err(SnapshotError::InvalidFieldEncoding("ipc device count"));
                }
                for _ in 0..count {
                    let name = d.str()?;
                    let len = d.u32()? as usize;
                    let state = d.bytes(len)?;
                    let device = self
                        .registry
                        .create(&mut ctx, &name)
                        .ok_or(SnapshotError::InvalidFieldEncoding("unknown device name"))?;
                    device.borrow_mut().load_state(&mut ctx, state)?;
                    restored.push(device);
                }
                d.finish()?;
            }
        }

        // Slot indices, rebuilding the per-backend instance counts.
        let mut fd_table: Vec<Option<DeviceRc>> = (0..IPC_MAX_FDS).map(|_| None).collect();
        let mut devices: Vec<DeviceRef> = Vec::new();
        if let Some(buf) = r.bytes(Self::TAG_FD_TABLE) {
            let mut d = Decoder::new(buf);
            for slot in fd_table.iter_mut() {
                let idx = d.u32()? as i32;
                if idx >= 0 {
                    let device = restored
                        .get(idx as usize)
                        .ok_or(SnapshotError::InvalidFieldEncoding("fd table index"))?;
                    *slot = Some(Rc::clone(device));
                    Self::retain(&mut devices, device);
                }
            }
            d.finish()?;
        }

        self.fd_table = fd_table;
        self.devices = devices;
        self.request_queue = request_queue;
        self.reply_queue = reply_queue;
        self.last_reply_time = last_reply_time;
        Ok(())
    }
}
