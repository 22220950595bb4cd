//! Implementation of [`FrameAllocator`] which
//! controls all the frames in the operating system.

// 堆区间内每个 4096 字节的物理页帧对应一个字节的描述符，描述符表放在区间开头，
// 被管理的页帧紧随其后。一段连续的多页分配就是一串 TAKEN 描述符，最后一个同时带有 LAST

use crate::address::PhysAddr;
use crate::config::PAGE_SIZE;
use crate::memory::PhysMemory;
use log::{info, trace};

bitflags! {
    /// state of one physical frame, no flag means free
    pub struct PageFlags: u8 {
        const TAKEN = 1 << 0;
        const LAST = 1 << 1;
    }
}

/// frame allocator over the heap window `[heap_start, heap_start + heap_size)`
pub struct FrameAllocator<M: PhysMemory> {
    mem: M,
    /// address of descriptor 0
    table: PhysAddr,
    num_pages: usize,
    alloc_start: PhysAddr,
}

/// A multi-frame allocation found in the descriptor table
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub start: PhysAddr,
    pub pages: usize,
}

impl Allocation {
    /// last byte of the run
    pub fn end(&self) -> PhysAddr {
        self.start + (self.pages * PAGE_SIZE - 1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameStats {
    pub allocated: usize,
    pub free: usize,
}

impl<M: PhysMemory> FrameAllocator<M> {
    /// Lay the descriptor table over the start of the heap window and hand out
    /// the frames behind it.
    pub fn new(mem: M, heap_start: usize, heap_size: usize) -> Self {
        let table: PhysAddr = PhysAddr::from(heap_start).ceil().into();
        let heap_end = heap_start + heap_size;
        assert!(
            heap_end > table.0,
            "frame heap [{:#x}, {:#x}) holds no page",
            heap_start,
            heap_end
        );
        let total = (heap_end - table.0) / PAGE_SIZE;
        // one descriptor byte per frame, the table takes the first frames itself
        let reserved = (total + PAGE_SIZE - 1) / PAGE_SIZE;
        assert!(
            total > reserved,
            "frame heap [{:#x}, {:#x}) is too small for its own descriptors",
            heap_start,
            heap_end
        );
        let num_pages = total - reserved;
        for idx in 0..num_pages {
            mem.write_u8(table + idx, PageFlags::empty().bits());
        }
        let alloc_start: PhysAddr = PhysAddr::from(table.0 + num_pages).ceil().into();
        info!(
            "HEAP_START = {:#x}, HEAP_SIZE = {:#x}, num of pages = {}",
            heap_start, heap_size, num_pages
        );
        Self {
            mem,
            table,
            num_pages,
            alloc_start,
        }
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }
    /// first allocatable frame
    pub fn alloc_start(&self) -> PhysAddr {
        self.alloc_start
    }
    /// one past the last allocatable frame
    pub fn alloc_end(&self) -> PhysAddr {
        self.alloc_start + self.num_pages * PAGE_SIZE
    }
    /// number of allocatable frames
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }
    pub fn descriptor_table(&self) -> PhysAddr {
        self.table
    }

    fn flags(&self, idx: usize) -> PageFlags {
        assert!(idx < self.num_pages);
        PageFlags::from_bits_truncate(self.mem.read_u8(self.table + idx))
    }
    fn set_flags(&mut self, idx: usize, flags: PageFlags) {
        assert!(idx < self.num_pages);
        self.mem.write_u8(self.table + idx, flags.bits());
    }

    /// Allocate `n` contiguous frames, first fit. `None` when no free run of
    /// that length exists.
    pub fn alloc(&mut self, n: usize) -> Option<PhysAddr> {
        assert!(n > 0, "frame alloc: asked for 0 pages");
        // 首次适配：从低地址开始找第一段长度为 n 的空闲页帧，遇到已分配的页帧就从它之后重新开始
        let mut start = 0;
        'search: while start + n <= self.num_pages {
            for idx in start..start + n {
                if self.flags(idx).contains(PageFlags::TAKEN) {
                    start = idx + 1;
                    continue 'search;
                }
            }
            for idx in start..start + n - 1 {
                self.set_flags(idx, PageFlags::TAKEN);
            }
            self.set_flags(start + n - 1, PageFlags::TAKEN | PageFlags::LAST);
            let pa = self.alloc_start + start * PAGE_SIZE;
            trace!("frame alloc {} page(s) at {:?}", n, pa);
            return Some(pa);
        }
        None
    }

    /// Like [`Self::alloc`], but the run is zeroed before it is returned.
    pub fn zalloc(&mut self, n: usize) -> Option<PhysAddr> {
        let pa = self.alloc(n)?;
        self.mem.zero(pa, n * PAGE_SIZE);
        Some(pa)
    }

    /// Return the run starting at `pa` to the free set.
    ///
    /// Panics when `pa` is not a frame of this allocator or does not start a
    /// live allocation.
    pub fn dealloc(&mut self, pa: PhysAddr) {
        if pa < self.alloc_start || pa >= self.alloc_end() {
            panic!(
                "frame dealloc: {:?} is out of range [{:?}, {:?})",
                pa,
                self.alloc_start,
                self.alloc_end()
            );
        }
        if !pa.aligned() {
            panic!("frame dealloc: {:?} is not page aligned", pa);
        }
        // 从起始页帧往后逐个清除描述符，直到带有 LAST 的那一页；
        // 中途遇到空闲页帧或走出描述符表都说明重复释放或描述符表已损坏
        let first = (pa.0 - self.alloc_start.0) / PAGE_SIZE;
        let mut idx = first;
        loop {
            if idx >= self.num_pages {
                panic!("frame dealloc: run at {:?} has no last page", pa);
            }
            let flags = self.flags(idx);
            if !flags.contains(PageFlags::TAKEN) {
                panic!(
                    "frame dealloc: page {:?} of the run at {:?} is not allocated",
                    self.alloc_start + idx * PAGE_SIZE,
                    pa
                );
            }
            self.set_flags(idx, PageFlags::empty());
            if flags.contains(PageFlags::LAST) {
                break;
            }
            idx += 1;
        }
        trace!("frame dealloc {} page(s) at {:?}", idx - first + 1, pa);
    }

    pub fn stats(&self) -> FrameStats {
        let allocated = (0..self.num_pages)
            .filter(|&idx| self.flags(idx).contains(PageFlags::TAKEN))
            .count();
        FrameStats {
            allocated,
            free: self.num_pages - allocated,
        }
    }

    /// Walk the live allocations in address order.
    pub fn allocations(&self) -> Allocations<'_, M> {
        Allocations {
            allocator: self,
            idx: 0,
        }
    }

    pub fn print_page_allocations(&self) {
        info!("PAGE ALLOCATION TABLE");
        info!(
            "META: {:#x} -> {:#x}",
            self.table.0,
            self.table.0 + self.num_pages
        );
        info!(
            "PHYS: {:#x} -> {:#x}",
            self.alloc_start.0,
            self.alloc_end().0
        );
        info!("~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~");
        for allocation in self.allocations() {
            info!(
                "{:#x} => {:#x} {}",
                allocation.start.0,
                allocation.end().0,
                allocation.pages
            );
        }
        let stats = self.stats();
        info!("~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~");
        info!(
            "Allocated: {} pages {} bytes",
            stats.allocated,
            stats.allocated * PAGE_SIZE
        );
        info!(
            "Free     : {} pages {} bytes",
            stats.free,
            stats.free * PAGE_SIZE
        );
    }
}

/// iterator over the runs of a [`FrameAllocator`]
pub struct Allocations<'a, M: PhysMemory> {
    allocator: &'a FrameAllocator<M>,
    idx: usize,
}

impl<'a, M: PhysMemory> Iterator for Allocations<'a, M> {
    type Item = Allocation;
    fn next(&mut self) -> Option<Allocation> {
        let num_pages = self.allocator.num_pages;
        while self.idx < num_pages && !self.allocator.flags(self.idx).contains(PageFlags::TAKEN) {
            self.idx += 1;
        }
        if self.idx >= num_pages {
            return None;
        }
        let first = self.idx;
        // a run without a LAST marker is reported up to the end of the table
        while self.idx < num_pages {
            let flags = self.allocator.flags(self.idx);
            self.idx += 1;
            if flags.contains(PageFlags::LAST) {
                break;
            }
        }
        Some(Allocation {
            start: self.allocator.alloc_start + first * PAGE_SIZE,
            pages: self.idx - first,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    const BASE: usize = 0x8020_0000;

    fn machine(pages: usize) -> SimMemory {
        SimMemory::filled(BASE, pages * PAGE_SIZE, 0xa5)
    }

    #[test]
    fn descriptor_table_takes_the_first_frames() {
        let mem = machine(64);
        let frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        assert_eq!(frames.descriptor_table(), PhysAddr(BASE));
        assert_eq!(frames.num_pages(), 63);
        assert_eq!(frames.alloc_start(), PhysAddr(BASE + PAGE_SIZE));
        assert_eq!(frames.alloc_end(), PhysAddr(BASE + 64 * PAGE_SIZE));
        assert_eq!(frames.stats(), FrameStats { allocated: 0, free: 63 });
    }

    #[test]
    fn unaligned_heap_start_is_rounded_up() {
        let mem = machine(257);
        let frames = FrameAllocator::new(&mem, BASE + 8, 256 * PAGE_SIZE);
        assert_eq!(frames.descriptor_table(), PhysAddr(BASE + PAGE_SIZE));
        assert_eq!(frames.num_pages(), 254);
        assert_eq!(frames.alloc_start(), PhysAddr(BASE + 2 * PAGE_SIZE));
        assert!(frames.alloc_end().0 <= BASE + 8 + 256 * PAGE_SIZE);
    }

    #[test]
    fn dealloc_then_alloc_returns_the_same_run() {
        let mem = machine(64);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let _pinned = frames.alloc(3).unwrap();
        for n in 1..=8 {
            let pa = frames.alloc(n).unwrap();
            frames.dealloc(pa);
            assert_eq!(frames.alloc(n), Some(pa));
            frames.dealloc(pa);
        }
        assert_eq!(frames.stats().allocated, 3);
    }

    #[test]
    fn whole_heap_fits_in_one_allocation() {
        let mem = machine(64);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let num = frames.num_pages();
        assert_eq!(frames.alloc(num + 1), None);
        let pa = frames.alloc(num).unwrap();
        assert_eq!(pa, frames.alloc_start());
        assert_eq!(frames.alloc(1), None);
        frames.dealloc(pa);
        assert_eq!(frames.stats().free, num);
    }

    #[test]
    fn more_than_the_largest_free_run_fails() {
        let mem = machine(64);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let num = frames.num_pages();
        let half = frames.alloc(num / 2 + 10).unwrap();
        assert_eq!(frames.alloc(num / 2), None);
        frames.dealloc(half);
        assert!(frames.alloc(num / 2).is_some());
    }

    #[test]
    fn first_fit_skips_holes_that_are_too_small() {
        let mem = machine(64);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let a = frames.alloc(2).unwrap();
        let b = frames.alloc(3).unwrap();
        let c = frames.alloc(1).unwrap();
        assert_eq!(b, a + 2 * PAGE_SIZE);
        assert_eq!(c, b + 3 * PAGE_SIZE);
        frames.dealloc(b);
        assert_eq!(frames.alloc(4), Some(c + PAGE_SIZE));
        assert_eq!(frames.alloc(3), Some(b));
    }

    #[test]
    fn zalloc_clears_every_byte_of_the_run() {
        let mem = machine(16);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let pa = frames.zalloc(2).unwrap();
        for offset in 0..2 * PAGE_SIZE {
            assert_eq!(mem.read_u8(pa + offset), 0);
        }
        // the frame after the run keeps its old contents
        assert_eq!(mem.read_u8(pa + 2 * PAGE_SIZE), 0xa5);
    }

    #[test]
    fn allocations_lists_each_run_once() {
        let mem = machine(32);
        let mut frames = FrameAllocator::new(&mem, BASE, 32 * PAGE_SIZE);
        let a = frames.alloc(1).unwrap();
        let b = frames.alloc(4).unwrap();
        let c = frames.alloc(2).unwrap();
        frames.dealloc(b);
        let runs: Vec<Allocation> = frames.allocations().collect();
        assert_eq!(
            runs,
            [
                Allocation { start: a, pages: 1 },
                Allocation { start: c, pages: 2 },
            ]
        );
        assert_eq!(runs[1].end(), c + (2 * PAGE_SIZE - 1));
        frames.print_page_allocations();
    }

    #[test]
    fn half_allocation_leaves_no_second_half() {
        // 64 pages leave an odd number of frames, 65 pages an even one
        for pages in [64, 65] {
            let mem = machine(pages);
            let mut frames = FrameAllocator::new(&mem, BASE, pages * PAGE_SIZE);
            let free = frames.stats().free;
            let half = frames.alloc(free / 2 + 10).unwrap();
            assert_eq!(frames.alloc(free / 2), None, "free = {}", free);
            frames.dealloc(half);
            assert_eq!(frames.stats().free, free);
        }
    }

    #[test]
    fn repeated_large_allocations_do_not_leak() {
        let mem = machine(64);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let num = frames.num_pages();
        for _ in 0..500 {
            let pa = frames.alloc(num - 1).unwrap();
            frames.dealloc(pa);
        }
        assert_eq!(frames.stats().allocated, 0);
    }

    #[test]
    #[should_panic(expected = "asked for 0 pages")]
    fn zero_page_alloc_is_a_bug() {
        let mem = machine(16);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        frames.alloc(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn dealloc_outside_the_heap_panics() {
        let mem = machine(16);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        frames.dealloc(PhysAddr(BASE + 64 * PAGE_SIZE));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn dealloc_of_the_descriptor_table_panics() {
        let mem = machine(16);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        frames.dealloc(PhysAddr(BASE));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_dealloc_panics() {
        let mem = machine(16);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let pa = frames.alloc(2).unwrap();
        frames.dealloc(pa);
        frames.dealloc(pa);
    }

    #[test]
    #[should_panic(expected = "has no last page")]
    fn run_without_last_marker_panics() {
        let mem = machine(16);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let num = frames.num_pages();
        let pa = frames.alloc(num).unwrap();
        // corrupt the table: drop the LAST marker of the only run
        let last = frames.descriptor_table() + (num - 1);
        mem.write_u8(last, PageFlags::TAKEN.bits());
        frames.dealloc(pa);
    }
}
