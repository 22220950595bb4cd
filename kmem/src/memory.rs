use crate::address::PhysAddr;

/// Trait for physical memory
/// which is read and written in bytes and 8-byte words
///
/// Page descriptors, block headers and page-table entries all live in
/// physical memory. The allocators only ever reach them through this trait at
/// computed addresses, so the same code runs against identity-mapped RAM on the
/// board and against a simulated buffer on the host.
///
/// Writes take `&self`: physical memory is shared by every layer above it and
/// the caller serialises access.
pub trait PhysMemory {
    /// Read one byte
    fn read_u8(&self, pa: PhysAddr) -> u8;
    /// Write one byte
    fn write_u8(&self, pa: PhysAddr, val: u8);
    /// Read an 8-byte aligned word
    fn read_u64(&self, pa: PhysAddr) -> u64;
    /// Write an 8-byte aligned word
    fn write_u64(&self, pa: PhysAddr, val: u64);

    /// Zero `len` bytes at `pa` in 8-byte strides.
    fn zero(&self, pa: PhysAddr, len: usize) {
        assert!(
            pa.0 % 8 == 0 && len % 8 == 0,
            "zero: {:?} + {:#x} is not word aligned",
            pa,
            len
        );
        for offset in (0..len).step_by(8) {
            self.write_u64(pa + offset, 0);
        }
    }
}

impl<T: PhysMemory + ?Sized> PhysMemory for &T {
    fn read_u8(&self, pa: PhysAddr) -> u8 {
        (**self).read_u8(pa)
    }
    fn write_u8(&self, pa: PhysAddr, val: u8) {
        (**self).write_u8(pa, val)
    }
    fn read_u64(&self, pa: PhysAddr) -> u64 {
        (**self).read_u64(pa)
    }
    fn write_u64(&self, pa: PhysAddr, val: u64) {
        (**self).write_u64(pa, val)
    }
    fn zero(&self, pa: PhysAddr, len: usize) {
        (**self).zero(pa, len)
    }
}
