//! Guest physical memory.
//!
//! The emulated CPU is big-endian, so all multi-byte accessors are big-endian
//! regardless of host order. IPC command blocks, ioctl vectors and device
//! payloads all live in this address space at guest-chosen addresses.
//!
//! Out-of-range reads float the bus high (all ones) and out-of-range writes are
//! dropped; both are logged. Device models must never be able to crash the
//! emulator through a bad guest pointer.

use tracing::warn;

/// Access interface used by device models and the IPC dispatcher.
///
/// Kept as a trait so tests and alternative backing stores (e.g. a sparse map)
/// can stand in for [`Ram`].
pub trait GuestMemory {
    fn read_u8(&self, addr: u32) -> u8;
    fn write_u8(&mut self, addr: u32, value: u8);

    fn read_u16(&self, addr: u32) -> u16 {
        (u16::from(self.read_u8(addr)) << 8) | u16::from(self.read_u8(addr.wrapping_add(1)))
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        self.write_u8(addr, (value >> 8) as u8);
        self.write_u8(addr.wrapping_add(1), value as u8);
    }

    fn read_u32(&self, addr: u32) -> u32 {
        (u32::from(self.read_u16(addr)) << 16) | u32::from(self.read_u16(addr.wrapping_add(2)))
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_u16(addr, (value >> 16) as u16);
        self.write_u16(addr.wrapping_add(2), value as u16);
    }

    fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(addr.wrapping_add(i as u32));
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *b);
        }
    }

    /// NUL-terminated string starting at `addr`, truncated at `max_len` bytes.
    ///
    /// Non-UTF-8 bytes are replaced; guest device names are ASCII in practice.
    fn read_cstr(&self, addr: u32, max_len: usize) -> String {
        let mut bytes = Vec::new();
        for i in 0..max_len {
            let b = self.read_u8(addr.wrapping_add(i as u32));
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Flat guest RAM.
pub struct Ram {
    bytes: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

impl GuestMemory for Ram {
    fn read_u8(&self, addr: u32) -> u8 {
        match self.bytes.get(addr as usize) {
            Some(b) => *b,
            None => {
                warn!(addr = format_args!("{addr:#010x}"), "guest read out of range");
                0xFF
            }
        }
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        match self.bytes.get_mut(addr as usize) {
            Some(b) => *b = value,
            None => {
                warn!(addr = format_args!("{addr:#010x}"), "guest write out of range");
            }
        }
    }
}
