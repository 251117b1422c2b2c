//! Command-block accessors.
//!
//! The command block is a fixed-offset structure in guest memory. The layout
//! is a historical ABI and is reproduced exactly:
//!
//! | offset | contents                                        |
//! |--------|-------------------------------------------------|
//! | 0x00   | command kind (sentinel `8` after completion)    |
//! | 0x04   | return/status word                              |
//! | 0x08   | device descriptor (executed command after done) |
//! | 0x0C.. | operation-specific arguments                    |
//!
//! For IOCtlV the arguments are: parameter word (+0xC), in-buffer count
//! (+0x10), payload-buffer count (+0x14) and a pointer to an array of
//! big-endian (address, size) pairs (+0x18).

use starlet_memory::GuestMemory;
use tracing::warn;

use crate::CMD_REPLY_SENTINEL;

pub const OFF_COMMAND: u32 = 0x00;
pub const OFF_RESULT: u32 = 0x04;
pub const OFF_FD: u32 = 0x08;
pub const OFF_ARG0: u32 = 0x0C;
pub const OFF_ARG1: u32 = 0x10;
pub const OFF_ARG2: u32 = 0x14;
pub const OFF_ARG3: u32 = 0x18;
pub const OFF_ARG4: u32 = 0x1C;

/// A command block at a guest address. Carries no state of its own; every
/// accessor goes straight to guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlock {
    pub address: u32,
}

impl CommandBlock {
    pub fn new(address: u32) -> Self {
        Self { address }
    }

    pub fn command(&self, mem: &dyn GuestMemory) -> u32 {
        mem.read_u32(self.address + OFF_COMMAND)
    }

    pub fn fd(&self, mem: &dyn GuestMemory) -> i32 {
        mem.read_u32(self.address + OFF_FD) as i32
    }

    pub fn arg(&self, mem: &dyn GuestMemory, index: u32) -> u32 {
        debug_assert!(index < 5, "command block has five argument words");
        mem.read_u32(self.address + OFF_ARG0 + index * 4)
    }

    pub fn set_result(&self, mem: &mut dyn GuestMemory, status: i32) {
        mem.write_u32(self.address + OFF_RESULT, status as u32);
    }

    pub fn result(&self, mem: &dyn GuestMemory) -> i32 {
        mem.read_u32(self.address + OFF_RESULT) as i32
    }

    /// Post-completion fixup: the hardware overwrites the command word with a
    /// sentinel and writes back the command that was responded to.
    pub fn mark_executed(&self, mem: &mut dyn GuestMemory, command: u32) {
        mem.write_u32(self.address + OFF_COMMAND, CMD_REPLY_SENTINEL);
        mem.write_u32(self.address + OFF_FD, command);
    }
}

/// One (address, size) pair from an ioctlv vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub address: u32,
    pub size: u32,
}

/// Guest ioctlv vector counts are bounded defensively; nothing in the
/// protocol uses anywhere near this many buffers.
const MAX_IOCTLV_BUFFERS: u32 = 32;

/// Parsed ioctlv argument set: the parameter word plus the in and payload
/// (out or in-out) buffer vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlvBuffer {
    pub parameter: u32,
    pub in_buffers: Vec<IoVec>,
    pub payload_buffers: Vec<IoVec>,
}

impl IoctlvBuffer {
    pub fn parse(mem: &dyn GuestMemory, block: &CommandBlock) -> Self {
        let parameter = block.arg(mem, 0);
        let num_in = block.arg(mem, 1);
        let num_payload = block.arg(mem, 2);
        let mut vector = block.arg(mem, 3);

        if num_in > MAX_IOCTLV_BUFFERS || num_payload > MAX_IOCTLV_BUFFERS {
            warn!(
                addr = format_args!("{:#010x}", block.address),
                num_in, num_payload, "oversized ioctlv vector truncated"
            );
        }

        let mut read_list = |count: u32| -> Vec<IoVec> {
            let count = count.min(MAX_IOCTLV_BUFFERS);
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let address = mem.read_u32(vector);
                let size = mem.read_u32(vector + 4);
                vector += 8;
                list.push(IoVec { address, size });
            }
            list
        };

        let in_buffers = read_list(num_in);
        let payload_buffers = read_list(num_payload);

        Self {
            parameter,
            in_buffers,
            payload_buffers,
        }
    }

    pub fn in_u8(&self, mem: &dyn GuestMemory, index: usize) -> Option<u8> {
        self.in_buffers.get(index).map(|v| mem.read_u8(v.address))
    }

    pub fn in_u16(&self, mem: &dyn GuestMemory, index: usize) -> Option<u16> {
        self.in_buffers.get(index).map(|v| mem.read_u16(v.address))
    }

    pub fn in_u32(&self, mem: &dyn GuestMemory, index: usize) -> Option<u32> {
        self.in_buffers.get(index).map(|v| mem.read_u32(v.address))
    }

    /// Reads a 16-bit value stored little-endian in guest memory. The control
    /// message setup fields are little-endian on the wire, unlike every other
    /// value in the protocol.
    pub fn in_u16_le(&self, mem: &dyn GuestMemory, index: usize) -> Option<u16> {
        self.in_buffers
            .get(index)
            .map(|v| u16::from(mem.read_u8(v.address)) | (u16::from(mem.read_u8(v.address + 1)) << 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlet_memory::Ram;

    #[test]
    fn ioctlv_vector_parses_in_and_payload_pairs() {
        let mut ram = Ram::new(0x1000);
        let block = CommandBlock::new(0x100);

        // Two in buffers, one payload buffer at a vector of pairs.
        ram.write_u32(0x100 + OFF_ARG0, 42);
        ram.write_u32(0x100 + OFF_ARG1, 2);
        ram.write_u32(0x100 + OFF_ARG2, 1);
        ram.write_u32(0x100 + OFF_ARG3, 0x200);
        let pairs = [(0x300u32, 4u32), (0x310, 2), (0x400, 8)];
        for (i, (addr, size)) in pairs.iter().enumerate() {
            ram.write_u32(0x200 + i as u32 * 8, *addr);
            ram.write_u32(0x200 + i as u32 * 8 + 4, *size);
        }

        let v = IoctlvBuffer::parse(&ram, &block);
        assert_eq!(v.parameter, 42);
        assert_eq!(
            v.in_buffers,
            vec![
                IoVec { address: 0x300, size: 4 },
                IoVec { address: 0x310, size: 2 }
            ]
        );
        assert_eq!(v.payload_buffers, vec![IoVec { address: 0x400, size: 8 }]);
    }

    #[test]
    fn oversized_vector_counts_are_truncated() {
        let mut ram = Ram::new(0x4000);
        let block = CommandBlock::new(0x100);
        ram.write_u32(0x100 + OFF_ARG1, 0xFFFF_FFFF);
        ram.write_u32(0x100 + OFF_ARG2, 0);
        ram.write_u32(0x100 + OFF_ARG3, 0x200);

        let v = IoctlvBuffer::parse(&ram, &block);
        assert_eq!(v.in_buffers.len(), 32);
    }

    #[test]
    fn little_endian_setup_fields_read_correctly() {
        let mut ram = Ram::new(0x1000);
        let block = CommandBlock::new(0x100);
        ram.write_u32(0x100 + OFF_ARG1, 1);
        ram.write_u32(0x100 + OFF_ARG2, 0);
        ram.write_u32(0x100 + OFF_ARG3, 0x200);
        ram.write_u32(0x200, 0x300);
        ram.write_u32(0x204, 2);
        // 0x1234 little-endian.
        ram.write_u8(0x300, 0x34);
        ram.write_u8(0x301, 0x12);

        let v = IoctlvBuffer::parse(&ram, &block);
        assert_eq!(v.in_u16_le(&ram, 0), Some(0x1234));
        assert_eq!(v.in_u16(&ram, 0), Some(0x3412));
    }

    #[test]
    fn mark_executed_writes_the_sentinel_and_echoes_the_command() {
        let mut ram = Ram::new(0x1000);
        let block = CommandBlock::new(0x100);
        ram.write_u32(0x100, crate::CMD_IOCTL);
        ram.write_u32(0x108, 3);

        block.mark_executed(&mut ram, crate::CMD_IOCTL);
        assert_eq!(ram.read_u32(0x100), CMD_REPLY_SENTINEL);
        assert_eq!(ram.read_u32(0x108), crate::CMD_IOCTL);
    }
}
