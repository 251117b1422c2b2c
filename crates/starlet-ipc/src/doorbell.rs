//! The IPC doorbell register block.
//!
//! Three word registers in the extended window carry the guest⇄kernel
//! handshake: the guest writes a command-block address to the command
//! register, then sets the execute bit in the control register. The
//! dispatcher raises the acknowledge bit when it pops the request and the
//! reply bit (with the block address in the answer register) when the reply
//! is delivered; the guest clears both with write-one-to-clear stores.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;
use starlet_io_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use starlet_mmio::{Mapping, ReadHandler, WriteHandler};
use tracing::debug;

/// Guest → dispatcher: command-block address.
pub const IPC_COMMAND_REGISTER: u32 = 0x0D00_0000;
/// Handshake bits.
pub const IPC_CONTROL_REGISTER: u32 = 0x0D00_0004;
/// Dispatcher → guest: replied command-block address.
pub const IPC_ANSWER_REGISTER: u32 = 0x0D00_0008;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlFlags: u32 {
        /// Guest posted a request (command pulse; reads back zero).
        const EXECUTE = 0x01;
        /// Request acknowledged by the kernel; write-one-to-clear.
        const ACKNOWLEDGE = 0x02;
        /// Reply delivered by the kernel; write-one-to-clear.
        const REPLY = 0x04;
        /// Guest relaunch pulse.
        const RELAUNCH = 0x08;
        /// Interrupt enable for [`CtrlFlags::REPLY`].
        const REPLY_INTERRUPT_ENABLE = 0x10;
        /// Interrupt enable for [`CtrlFlags::ACKNOWLEDGE`].
        const ACK_INTERRUPT_ENABLE = 0x20;
    }
}

const INTERRUPT_ENABLES: CtrlFlags = CtrlFlags::REPLY_INTERRUPT_ENABLE.union(CtrlFlags::ACK_INTERRUPT_ENABLE);

#[derive(Debug, Default)]
pub struct IpcDoorbell {
    command: u32,
    answer: u32,
    ctrl: CtrlFlags,
    posted: VecDeque<u32>,
}

impl IpcDoorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the register block into the dispatch table. The command and
    /// answer registers bind as callbacks over the shared cell; the control
    /// register needs command-pulse and write-one-to-clear semantics.
    pub fn map_registers(this: &Rc<RefCell<Self>>, mmio: &mut Mapping) {
        let bell = Rc::clone(this);
        let read_command = ReadHandler::<u32>::complex(move |_| bell.borrow().command);
        let bell = Rc::clone(this);
        let write_command = WriteHandler::<u32>::complex(move |_, value| {
            bell.borrow_mut().command = value;
        });
        mmio.register_u32(IPC_COMMAND_REGISTER, read_command, write_command);

        let bell = Rc::clone(this);
        let read_ctrl = ReadHandler::<u32>::complex(move |_| bell.borrow().ctrl.bits());
        let bell = Rc::clone(this);
        let write_ctrl = WriteHandler::<u32>::complex(move |_, value| {
            bell.borrow_mut().write_control(value);
        });
        mmio.register_u32(IPC_CONTROL_REGISTER, read_ctrl, write_ctrl);

        let bell = Rc::clone(this);
        let read_answer = ReadHandler::<u32>::complex(move |_| bell.borrow().answer);
        mmio.register_u32(IPC_ANSWER_REGISTER, read_answer, WriteHandler::Invalid);
    }

    /// Guest-side control-register store: command pulses, write-one-to-clear
    /// handshake bits, latched interrupt enables.
    pub fn write_control(&mut self, value: u32) {
        let value = CtrlFlags::from_bits_truncate(value);

        // Write-one-to-clear handshake bits.
        self.ctrl.remove(value & (CtrlFlags::ACKNOWLEDGE | CtrlFlags::REPLY));
        // Interrupt enables latch the written value.
        self.ctrl.remove(INTERRUPT_ENABLES);
        self.ctrl.insert(value & INTERRUPT_ENABLES);

        if value.contains(CtrlFlags::EXECUTE) {
            debug!(addr = format_args!("{:#010x}", self.command), "IPC request posted");
            self.posted.push_back(self.command);
        }
    }

    /// Takes the oldest posted-but-not-yet-queued request.
    pub fn take_request(&mut self) -> Option<u32> {
        self.posted.pop_front()
    }

    /// The dispatcher only runs while the guest has consumed the previous
    /// acknowledge and reply.
    pub fn is_ready(&self) -> bool {
        !self
            .ctrl
            .intersects(CtrlFlags::ACKNOWLEDGE | CtrlFlags::REPLY)
    }

    pub fn generate_ack(&mut self) {
        self.ctrl.insert(CtrlFlags::ACKNOWLEDGE);
    }

    pub fn generate_reply(&mut self, addr: u32) {
        self.answer = addr;
        self.ctrl.insert(CtrlFlags::REPLY);
    }

    pub fn ctrl(&self) -> CtrlFlags {
        self.ctrl
    }

    pub fn answer(&self) -> u32 {
        self.answer
    }

    /// Level-triggered interrupt line toward the CPU.
    pub fn interrupt_asserted(&self) -> bool {
        (self.ctrl.contains(CtrlFlags::ACKNOWLEDGE)
            && self.ctrl.contains(CtrlFlags::ACK_INTERRUPT_ENABLE))
            || (self.ctrl.contains(CtrlFlags::REPLY)
                && self.ctrl.contains(CtrlFlags::REPLY_INTERRUPT_ENABLE))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl IoSnapshot for IpcDoorbell {
    const DEVICE_ID: [u8; 4] = *b"IPCB";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_COMMAND: u16 = 1;
        const TAG_ANSWER: u16 = 2;
        const TAG_CTRL: u16 = 3;
        const TAG_POSTED: u16 = 4;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_COMMAND, self.command);
        w.field_u32(TAG_ANSWER, self.answer);
        w.field_u32(TAG_CTRL, self.ctrl.bits());
        let mut posted = Vec::with_capacity(self.posted.len() * 4);
        for addr in &self.posted {
            posted.extend_from_slice(&addr.to_le_bytes());
        }
        w.field_bytes(TAG_POSTED, posted);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_COMMAND: u16 = 1;
        const TAG_ANSWER: u16 = 2;
        const TAG_CTRL: u16 = 3;
        const TAG_POSTED: u16 = 4;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.command = r.u32(TAG_COMMAND)?.unwrap_or(0);
        self.answer = r.u32(TAG_ANSWER)?.unwrap_or(0);
        self.ctrl = CtrlFlags::from_bits_truncate(r.u32(TAG_CTRL)?.unwrap_or(0));
        self.posted.clear();
        if let Some(buf) = r.bytes(TAG_POSTED) {
            if buf.len() % 4 != 0 {
                return Err(SnapshotError::InvalidFieldEncoding("posted queue"));
            }
            for chunk in buf.chunks_exact(4) {
                self.posted
                    .push_back(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_pulse_posts_the_command_address_once() {
        let mut bell = IpcDoorbell::new();
        bell.command = 0x1000;
        bell.write_control(CtrlFlags::EXECUTE.bits());
        assert_eq!(bell.take_request(), Some(0x1000));
        assert_eq!(bell.take_request(), None);
        // The pulse does not read back.
        assert!(!bell.ctrl().contains(CtrlFlags::EXECUTE));
    }

    #[test]
    fn handshake_bits_are_write_one_to_clear() {
        let mut bell = IpcDoorbell::new();
        bell.generate_ack();
        bell.generate_reply(0x2000);
        assert!(!bell.is_ready());
        assert_eq!(bell.answer(), 0x2000);

        // Writing zero to the bits leaves them set.
        bell.write_control(0);
        assert!(!bell.is_ready());

        bell.write_control((CtrlFlags::ACKNOWLEDGE | CtrlFlags::REPLY).bits());
        assert!(bell.is_ready());
    }

    #[test]
    fn interrupt_line_follows_enables() {
        let mut bell = IpcDoorbell::new();
        bell.generate_reply(0x2000);
        assert!(!bell.interrupt_asserted());
        bell.write_control(CtrlFlags::REPLY_INTERRUPT_ENABLE.bits());
        assert!(bell.interrupt_asserted());
        // Clearing the reply bit drops the line.
        bell.write_control(
            (CtrlFlags::REPLY | CtrlFlags::REPLY_INTERRUPT_ENABLE).bits(),
        );
        assert!(!bell.interrupt_asserted());
    }

    #[test]
    fn mmio_mapping_round_trips_the_registers() {
        let mut mmio = Mapping::new();
        let bell = Rc::new(RefCell::new(IpcDoorbell::new()));
        IpcDoorbell::map_registers(&bell, &mut mmio);

        mmio.write_u32(IPC_COMMAND_REGISTER, 0x0013_37C0);
        assert_eq!(mmio.read_u32(IPC_COMMAND_REGISTER), 0x0013_37C0);

        mmio.write_u32(IPC_CONTROL_REGISTER, CtrlFlags::EXECUTE.bits());
        assert_eq!(bell.borrow_mut().take_request(), Some(0x0013_37C0));

        bell.borrow_mut().generate_reply(0x0013_37C0);
        assert_eq!(mmio.read_u32(IPC_ANSWER_REGISTER), 0x0013_37C0);
        assert_ne!(mmio.read_u32(IPC_CONTROL_REGISTER) & CtrlFlags::REPLY.bits(), 0);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut bell = IpcDoorbell::new();
        bell.command = 0x1234;
        bell.write_control((CtrlFlags::EXECUTE | CtrlFlags::REPLY_INTERRUPT_ENABLE).bits());
        bell.generate_ack();

        let bytes = bell.save_state();
        let mut restored = IpcDoorbell::new();
        restored.load_state(&bytes).unwrap();
        assert_eq!(restored.command, 0x1234);
        assert_eq!(restored.ctrl, bell.ctrl);
        assert_eq!(restored.take_request(), Some(0x1234));
    }
}
