//! Keyboard device node.
//!
//! The guest reads keyboard events with a blocking ioctl: if the message
//! queue is empty, the command suspends until the host pushes a connect,
//! disconnect or input-report message. Messages are fixed 16-byte records:
//! type word, reserved word, then eight report bytes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use starlet_io_snapshot::{
    Decoder, Encoder, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter,
};
use starlet_memory::GuestMemory;
use tracing::debug;

use crate::block::CommandBlock;
use crate::device::{DeviceRc, DeviceRegistry, Disposition, IpcContext, IpcDevice};
use crate::fs_status;

pub const KEYBOARD_DEVICE_NAME: &str = "/dev/usb/kbd";

const MSG_CONNECT: u32 = 0;
const MSG_DISCONNECT: u32 = 1;
const MSG_EVENT: u32 = 2;

const MAX_QUEUED_MESSAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardMessage {
    Connect,
    Disconnect,
    Report([u8; 8]),
}

impl KeyboardMessage {
    fn kind(self) -> u32 {
        match self {
            KeyboardMessage::Connect => MSG_CONNECT,
            KeyboardMessage::Disconnect => MSG_DISCONNECT,
            KeyboardMessage::Report(_) => MSG_EVENT,
        }
    }

    fn report(self) -> [u8; 8] {
        match self {
            KeyboardMessage::Report(report) => report,
            _ => [0; 8],
        }
    }

    fn write_to(self, mem: &mut dyn GuestMemory, addr: u32) {
        mem.write_u32(addr, self.kind());
        mem.write_u32(addr + 4, 0);
        mem.write_bytes(addr + 8, &self.report());
    }
}

pub struct KeyboardDevice {
    queue: VecDeque<KeyboardMessage>,
    /// Command block of a suspended blocking ioctl, if any.
    pending: Option<u32>,
    connected: bool,
}

impl KeyboardDevice {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            pending: None,
            connected: false,
        }
    }

    pub fn register(registry: &mut DeviceRegistry) {
        let cached: RefCell<Option<Rc<RefCell<KeyboardDevice>>>> = RefCell::new(None);
        registry.register(move |_ctx, name| {
            if name != KEYBOARD_DEVICE_NAME {
                return None;
            }
            let mut cached = cached.borrow_mut();
            let device = cached
                .get_or_insert_with(|| Rc::new(RefCell::new(KeyboardDevice::new())))
                .clone();
            Some(device as DeviceRc)
        });
    }

    /// Connection edges queue a connect/disconnect message; repeats are
    /// swallowed.
    pub fn set_connected(&mut self, connected: bool) {
        if connected != self.connected {
            self.push(if connected {
                KeyboardMessage::Connect
            } else {
                KeyboardMessage::Disconnect
            });
        }
        self.connected = connected;
    }

    pub fn push_report(&mut self, report: [u8; 8]) {
        self.push(KeyboardMessage::Report(report));
    }

    fn push(&mut self, message: KeyboardMessage) {
        if self.queue.len() >= MAX_QUEUED_MESSAGES {
            debug!("keyboard queue full, dropping oldest message");
            self.queue.pop_front();
        }
        self.queue.push_back(message);
    }
}

impl Default for KeyboardDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcDevice for KeyboardDevice {
    fn name(&self) -> &str {
        KEYBOARD_DEVICE_NAME
    }

    fn open(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock, _mode: u32) -> i32 {
        fs_status::SUCCESS
    }

    fn write(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        // LED/output reports; accepted and ignored.
        debug!("ignoring write to keyboard device");
        block.set_result(ctx.mem, fs_status::SUCCESS);
        Disposition::Reply
    }

    fn ioctl(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        match self.queue.pop_front() {
            Some(message) => {
                let out = block.arg(ctx.mem, 3);
                message.write_to(ctx.mem, out);
                block.set_result(ctx.mem, fs_status::SUCCESS);
                Disposition::Reply
            }
            None => {
                // Blocking read: hold the command until a message arrives.
                self.pending = Some(block.address);
                Disposition::Suspend
            }
        }
    }

    fn update(&mut self, ctx: &mut IpcContext<'_>) -> bool {
        let Some(addr) = self.pending else {
            return false;
        };
        let Some(message) = self.queue.pop_front() else {
            return false;
        };
        self.pending = None;

        let block = CommandBlock::new(addr);
        let out = block.arg(ctx.mem, 3);
        message.write_to(ctx.mem, out);
        block.set_result(ctx.mem, fs_status::SUCCESS);
        ctx.enqueue_reply(addr, 0);
        true
    }

    fn save_state(&self) -> Vec<u8> {
        const TAG_QUEUE: u16 = 1;
        const TAG_PENDING: u16 = 2;
        const TAG_CONNECTED: u16 = 3;

        let mut w = SnapshotWriter::new(*b"UKBD", SnapshotVersion::new(1, 0));
        let mut enc = Encoder::new().u32(self.queue.len() as u32);
        for message in &self.queue {
            enc = enc.u32(message.kind()).bytes(&message.report());
        }
        w.field_bytes(TAG_QUEUE, enc.finish());
        if let Some(addr) = self.pending {
            w.field_u32(TAG_PENDING, addr);
        }
        w.field_bool(TAG_CONNECTED, self.connected);
        w.finish()
    }

    fn load_state(&mut self, _ctx: &mut IpcContext<'_>, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_QUEUE: u16 = 1;
        const TAG_PENDING: u16 = 2;
        const TAG_CONNECTED: u16 = 3;

        let r = SnapshotReader::parse(bytes, *b"UKBD")?;
        r.ensure_device_major(1)?;

        let mut queue = VecDeque::new();
        if let Some(buf) = r.bytes(TAG_QUEUE) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > MAX_QUEUED_MESSAGES {
                return Err(SnapshotError::InvalidFieldEncoding("keyboard queue length"));
            }
            for _ in 0..count {
                let kind = d.u32()?;
                let mut report = [0u8; 8];
                report.copy_from_slice(d.bytes(8)?);
                queue.push_back(match kind {
                    MSG_CONNECT => KeyboardMessage::Connect,
                    MSG_DISCONNECT => KeyboardMessage::Disconnect,
                    MSG_EVENT => KeyboardMessage::Report(report),
                    _ => return Err(SnapshotError::InvalidFieldEncoding("keyboard message")),
                });
            }
            d.finish()?;
        }

        self.queue = queue;
        self.pending = r.u32(TAG_PENDING)?;
        self.connected = r.bool(TAG_CONNECTED)?.unwrap_or(false);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
