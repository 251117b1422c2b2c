//! Hardware register dispatch table.
//!
//! Every guest load/store to the memory-mapped register space resolves through
//! a [`Mapping`]: a fixed-size table of typed handler slots covering the two
//! 64 KiB register windows. Each slot holds one read strategy and one write
//! strategy; 8/16/32-bit accesses are independently addressed, so a 32-bit
//! register may legitimately be covered by four separately configured narrower
//! slots. Slots are replaced, never removed, and default to [`Invalid`]
//! (`ReadHandler::Invalid`), which reports the access and returns a
//! width-truncated all-ones sentinel. No access through the table is ever
//! fatal.
//!
//! This is the hot path for the interpreter/JIT, so dispatch is a direct array
//! index plus one `match`, with no hashing and no range walk.

use std::cell::Cell;
use std::rc::Rc;

use tracing::warn;

/// There are two register windows:
/// - `0x0C00_xxxx`: the compatibility block;
/// - `0x0D00_xxxx`: the extended block, mirrored at `0x0D80_xxxx`.
///
/// Since the third block mirrors the second, the table only distinguishes two.
pub const BLOCK_SIZE: u32 = 0x10000;
pub const NUM_BLOCKS: u32 = 2;
pub const NUM_SLOTS: u32 = NUM_BLOCKS * BLOCK_SIZE;

pub const COMPAT_BLOCK_BASE: u32 = 0x0C00_0000;
pub const EXTENSION_BLOCK_BASE: u32 = 0x0D00_0000;
pub const EXTENSION_BLOCK_MIRROR: u32 = 0x0D80_0000;

pub fn is_mmio_address(addr: u32) -> bool {
    matches!(
        addr & 0xFFFF_0000,
        COMPAT_BLOCK_BASE | EXTENSION_BLOCK_BASE | EXTENSION_BLOCK_MIRROR
    )
}

/// Internal unique ID for a register address: `(addr & 0xFFFF) * (1 + block)`,
/// where the block bit is bit 24 of the address. The mirror window shares the
/// extended block's slots by construction.
#[inline]
fn unique_id(addr: u32) -> u32 {
    debug_assert!(
        is_mmio_address(addr),
        "not a register address: {addr:#010x}"
    );
    (addr & 0xFFFF) * (1 + ((addr >> 24) & 1))
}

/// Read-side handling strategy for one slot.
pub enum ReadHandler<T> {
    /// The value read from this register is always the same.
    Constant(T),
    /// Reads come straight from a host cell, restricted by `mask`.
    Direct { cell: Rc<Cell<T>>, mask: T },
    /// Owner-supplied callback, invoked synchronously with the faulting
    /// address. May have side effects (interrupt acknowledge, FIFO pop).
    Complex(Box<dyn FnMut(u32) -> T>),
    /// Default for unmapped slots: report and return the all-ones sentinel.
    Invalid,
}

/// Write-side handling strategy for one slot.
pub enum WriteHandler<T> {
    /// Writes that should have no effect and not be reported either.
    Nop,
    /// Writes store `value & mask` into a host cell; bits outside the mask are
    /// left unspecified, mirroring unimplemented register bits.
    Direct { cell: Rc<Cell<T>>, mask: T },
    /// Owner-supplied callback, invoked synchronously.
    Complex(Box<dyn FnMut(u32, T)>),
    /// Default for unmapped slots: report and discard.
    Invalid,
}

macro_rules! handler_ctors {
    ($t:ty) => {
        impl ReadHandler<$t> {
            /// Direct read with all bits implemented.
            pub fn direct(cell: Rc<Cell<$t>>) -> Self {
                ReadHandler::Direct {
                    cell,
                    mask: <$t>::MAX,
                }
            }

            pub fn direct_masked(cell: Rc<Cell<$t>>, mask: $t) -> Self {
                ReadHandler::Direct { cell, mask }
            }

            pub fn complex(f: impl FnMut(u32) -> $t + 'static) -> Self {
                ReadHandler::Complex(Box::new(f))
            }
        }

        impl WriteHandler<$t> {
            /// Direct write with all bits implemented.
            pub fn direct(cell: Rc<Cell<$t>>) -> Self {
                WriteHandler::Direct {
                    cell,
                    mask: <$t>::MAX,
                }
            }

            pub fn direct_masked(cell: Rc<Cell<$t>>, mask: $t) -> Self {
                WriteHandler::Direct { cell, mask }
            }

            pub fn complex(f: impl FnMut(u32, $t) + 'static) -> Self {
                WriteHandler::Complex(Box::new(f))
            }
        }
    };
}

handler_ctors!(u8);
handler_ctors!(u16);
handler_ctors!(u32);

/// The register dispatch table.
///
/// One handler pair per slot per access width. Larger access widths have fewer
/// possible (aligned) addresses, hence the smaller arrays.
pub struct Mapping {
    read8: Vec<ReadHandler<u8>>,
    write8: Vec<WriteHandler<u8>>,
    read16: Vec<ReadHandler<u16>>,
    write16: Vec<WriteHandler<u16>>,
    read32: Vec<ReadHandler<u32>>,
    write32: Vec<WriteHandler<u32>>,
}

macro_rules! mapping_accessors {
    ($t:ty, $reads:ident, $writes:ident, $register:ident, $read:ident, $write:ident) => {
        /// Installs both strategies for one slot, replacing any prior ones.
        /// Callable at any time, including from inside a handler's owner.
        pub fn $register(&mut self, addr: u32, read: ReadHandler<$t>, write: WriteHandler<$t>) {
            let id = (unique_id(addr) / std::mem::size_of::<$t>() as u32) as usize;
            self.$reads[id] = read;
            self.$writes[id] = write;
        }

        pub fn $read(&mut self, addr: u32) -> $t {
            let id = (unique_id(addr) / std::mem::size_of::<$t>() as u32) as usize;
            match &mut self.$reads[id] {
                ReadHandler::Constant(v) => *v,
                ReadHandler::Direct { cell, mask } => cell.get() & *mask,
                ReadHandler::Complex(f) => f(addr),
                ReadHandler::Invalid => {
                    warn!(
                        addr = format_args!("{addr:#010x}"),
                        width = std::mem::size_of::<$t>(),
                        "read from unmapped register"
                    );
                    <$t>::MAX
                }
            }
        }

        pub fn $write(&mut self, addr: u32, value: $t) {
            let id = (unique_id(addr) / std::mem::size_of::<$t>() as u32) as usize;
            match &mut self.$writes[id] {
                WriteHandler::Nop => {}
                WriteHandler::Direct { cell, mask } => cell.set(value & *mask),
                WriteHandler::Complex(f) => f(addr, value),
                WriteHandler::Invalid => {
                    warn!(
                        addr = format_args!("{addr:#010x}"),
                        width = std::mem::size_of::<$t>(),
                        value = format_args!("{value:#x}"),
                        "write to unmapped register"
                    );
                }
            }
        }
    };
}

impl Mapping {
    pub fn new() -> Self {
        fn invalid_table<R, W>(len: usize, read: fn() -> R, write: fn() -> W) -> (Vec<R>, Vec<W>) {
            (
                (0..len).map(|_| read()).collect(),
                (0..len).map(|_| write()).collect(),
            )
        }

        let (read8, write8) = invalid_table(
            NUM_SLOTS as usize,
            || ReadHandler::Invalid,
            || WriteHandler::Invalid,
        );
        let (read16, write16) = invalid_table(
            (NUM_SLOTS / 2) as usize,
            || ReadHandler::Invalid,
            || WriteHandler::Invalid,
        );
        let (read32, write32) = invalid_table(
            (NUM_SLOTS / 4) as usize,
            || ReadHandler::Invalid,
            || WriteHandler::Invalid,
        );

        Self {
            read8,
            write8,
            read16,
            write16,
            read32,
            write32,
        }
    }

    mapping_accessors!(u8, read8, write8, register_u8, read_u8, write_u8);
    mapping_accessors!(u16, read16, write16, register_u16, read_u16, write_u16);
    mapping_accessors!(u32, read32, write32, register_u32, read_u32, write_u32);
}

impl Default for Mapping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;

    const REG: u32 = EXTENSION_BLOCK_BASE + 0x3000;

    #[test]
    fn unregistered_addresses_read_the_sentinel_and_drop_writes() {
        let mut map = Mapping::new();
        assert_eq!(map.read_u8(COMPAT_BLOCK_BASE + 0x42), 0xFF);
        assert_eq!(map.read_u16(COMPAT_BLOCK_BASE + 0x42), 0xFFFF);
        assert_eq!(map.read_u32(COMPAT_BLOCK_BASE + 0x44), 0xFFFF_FFFF);
        // Must not panic or change later reads.
        map.write_u32(COMPAT_BLOCK_BASE + 0x44, 0x1234_5678);
        assert_eq!(map.read_u32(COMPAT_BLOCK_BASE + 0x44), 0xFFFF_FFFF);
    }

    #[test]
    fn constant_reads_are_read_only_fixed_values() {
        let mut map = Mapping::new();
        map.register_u16(REG, ReadHandler::Constant(0xCAFE), WriteHandler::Nop);
        assert_eq!(map.read_u16(REG), 0xCAFE);
        map.write_u16(REG, 0x0000);
        assert_eq!(map.read_u16(REG), 0xCAFE);
    }

    #[test]
    fn direct_slots_apply_the_mask_on_both_directions() {
        let mut map = Mapping::new();
        let cell = Rc::new(Cell::new(0u32));
        map.register_u32(
            REG,
            ReadHandler::<u32>::direct_masked(cell.clone(), 0x0000_FF00),
            WriteHandler::<u32>::direct_masked(cell.clone(), 0x0000_FF00),
        );

        map.write_u32(REG, 0xFFFF_FFFF);
        assert_eq!(cell.get(), 0x0000_FF00);
        assert_eq!(map.read_u32(REG), 0x0000_FF00);

        // Out-of-mask bits in the backing cell never leak into reads.
        cell.set(0xABCD_1234);
        assert_eq!(map.read_u32(REG), 0x0000_1200);
    }

    #[test]
    fn complex_handlers_run_synchronously_with_side_effects() {
        let mut map = Mapping::new();
        let fifo = Rc::new(RefCell::new(vec![3u32, 2, 1]));

        let read_fifo = fifo.clone();
        map.register_u32(
            REG,
            ReadHandler::<u32>::complex(move |_| read_fifo.borrow_mut().pop().unwrap_or(0)),
            WriteHandler::<u32>::complex({
                let fifo = fifo.clone();
                move |_, value| fifo.borrow_mut().push(value)
            }),
        );

        assert_eq!(map.read_u32(REG), 1);
        map.write_u32(REG, 9);
        assert_eq!(map.read_u32(REG), 9);
        assert_eq!(map.read_u32(REG), 2);
    }

    #[test]
    fn widths_are_independently_addressed() {
        let mut map = Mapping::new();
        let word = Rc::new(Cell::new(0u32));
        let high_half = Rc::new(Cell::new(0u16));

        map.register_u32(
            REG,
            ReadHandler::<u32>::direct(word.clone()),
            WriteHandler::<u32>::direct(word.clone()),
        );
        map.register_u16(
            REG,
            ReadHandler::<u16>::direct(high_half.clone()),
            WriteHandler::<u16>::direct(high_half.clone()),
        );

        map.write_u32(REG, 0x1111_2222);
        map.write_u16(REG, 0x3333);
        assert_eq!(map.read_u32(REG), 0x1111_2222);
        assert_eq!(map.read_u16(REG), 0x3333);
    }

    #[test]
    fn reregistering_replaces_the_previous_strategy() {
        let mut map = Mapping::new();
        map.register_u32(REG, ReadHandler::Constant(1), WriteHandler::Nop);
        assert_eq!(map.read_u32(REG), 1);
        map.register_u32(REG, ReadHandler::Constant(2), WriteHandler::Nop);
        assert_eq!(map.read_u32(REG), 2);
    }

    #[test]
    fn mirror_window_resolves_to_the_extension_block_slots() {
        let mut map = Mapping::new();
        let cell = Rc::new(Cell::new(0u32));
        map.register_u32(
            EXTENSION_BLOCK_BASE + 0x20,
            ReadHandler::<u32>::direct(cell.clone()),
            WriteHandler::<u32>::direct(cell.clone()),
        );

        map.write_u32(EXTENSION_BLOCK_MIRROR + 0x20, 0xDEAD_BEEF);
        assert_eq!(map.read_u32(EXTENSION_BLOCK_BASE + 0x20), 0xDEAD_BEEF);
    }

    proptest! {
        // Mask invariance: read-after-write returns `v & mask` regardless of
        // whatever the backing cell held beforehand.
        #[test]
        fn direct_mask_invariance(prior in any::<u32>(), value in any::<u32>(), mask in any::<u32>()) {
            let mut map = Mapping::new();
            let cell = Rc::new(Cell::new(prior));
            map.register_u32(
                REG,
                ReadHandler::<u32>::direct_masked(cell.clone(), mask),
                WriteHandler::<u32>::direct_masked(cell.clone(), mask),
            );
            map.write_u32(REG, value);
            prop_assert_eq!(map.read_u32(REG), value & mask);
        }
    }
}
