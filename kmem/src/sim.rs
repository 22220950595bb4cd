//! RAM simulated by a word buffer, for running the allocators off the board

use crate::address::PhysAddr;
use crate::memory::PhysMemory;
use alloc::vec::Vec;
use core::cell::Cell;

/// A window of physical memory `[base, base + size)` backed by a buffer.
///
/// Words are stored little-endian like on RV64. Touching an address outside
/// the window panics, the way a bus fault would stop the board.
pub struct SimMemory {
    base: usize,
    words: Vec<Cell<u64>>,
}

impl SimMemory {
    /// Zero-filled RAM
    pub fn new(base: usize, size: usize) -> Self {
        Self::filled(base, size, 0)
    }
    /// RAM where every byte starts out as `byte`
    pub fn filled(base: usize, size: usize, byte: u8) -> Self {
        assert!(
            base % 8 == 0 && size % 8 == 0,
            "simulated RAM must be word aligned"
        );
        let word = u64::from_le_bytes([byte; 8]);
        Self {
            base,
            words: (0..size / 8).map(|_| Cell::new(word)).collect(),
        }
    }
    pub fn base(&self) -> PhysAddr {
        PhysAddr(self.base)
    }
    pub fn size(&self) -> usize {
        self.words.len() * 8
    }
    pub fn end(&self) -> PhysAddr {
        PhysAddr(self.base + self.size())
    }
    fn word(&self, pa: PhysAddr) -> &Cell<u64> {
        let addr: usize = pa.into();
        if addr < self.base || addr >= self.base + self.size() {
            panic!(
                "bus fault: {:?} outside simulated RAM [{:#x}, {:#x})",
                pa,
                self.base,
                self.base + self.size()
            );
        }
        &self.words[(addr - self.base) / 8]
    }
}

impl PhysMemory for SimMemory {
    fn read_u8(&self, pa: PhysAddr) -> u8 {
        let shift = (pa.0 % 8) * 8;
        (self.word(pa).get() >> shift) as u8
    }
    fn write_u8(&self, pa: PhysAddr, val: u8) {
        let shift = (pa.0 % 8) * 8;
        let word = self.word(pa);
        word.set(word.get() & !(0xff << shift) | (val as u64) << shift);
    }
    fn read_u64(&self, pa: PhysAddr) -> u64 {
        assert_eq!(pa.0 % 8, 0, "misaligned load at {:?}", pa);
        self.word(pa).get()
    }
    fn write_u64(&self, pa: PhysAddr, val: u64) {
        assert_eq!(pa.0 % 8, 0, "misaligned store at {:?}", pa);
        self.word(pa).set(val);
    }
}
