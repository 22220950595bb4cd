//! Implementation of [`PageTableEntry`], [`PageTable`] and [`PageTableManager`].

// SV39 多级页表：每个页表 512 项、每项 8 字节，共三级，第 2 级为根节点。
// V 为 1 且 R/W/X 全为 0 的页表项指向下一级页表，R/W/X 任一为 1 则为叶节点；
// 第 1 级和第 2 级的叶节点分别映射 2 MiB 和 1 GiB 的大页
use crate::address::{PhysAddr, PhysPageNum, VPNRange, VirtAddr};
use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS, PTE_PER_TABLE, VPN_BITS_PER_LEVEL};
use crate::frame_allocator::FrameAllocator;
use crate::memory::PhysMemory;
use core::fmt::{self, Debug, Display, Formatter};
use log::{debug, trace};

bitflags! {
    /// page table entry flags
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
/// page table entry structure
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    /// valid and carries at least one of R/W/X
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }
    /// valid and points at the next level
    pub fn is_branch(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }
    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PTE:{:#x}", self.bits))
    }
}

/// bytes covered by one entry at `level`
pub fn level_size(level: usize) -> usize {
    1 << (PAGE_SIZE_BITS + VPN_BITS_PER_LEVEL * level)
}

fn read_pte<M: PhysMemory + ?Sized>(mem: &M, table: PhysPageNum, idx: usize) -> PageTableEntry {
    assert!(idx < PTE_PER_TABLE);
    let pa = PhysAddr::from(table) + idx * 8;
    PageTableEntry {
        bits: mem.read_u64(pa) as usize,
    }
}

fn write_pte<M: PhysMemory + ?Sized>(mem: &M, table: PhysPageNum, idx: usize, pte: PageTableEntry) {
    assert!(idx < PTE_PER_TABLE);
    let pa = PhysAddr::from(table) + idx * 8;
    mem.write_u64(pa, pte.bits as u64);
}

/// Handle on a root page table. The root frame belongs to whoever created it
/// (the kernel, or a process record); the tables below it belong to the root.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageTable {
    root_ppn: PhysPageNum,
}

impl PageTable {
    /// Allocate a zeroed root table.
    pub fn new<M: PhysMemory>(frames: &mut FrameAllocator<M>) -> Option<Self> {
        frames.zalloc(1).map(|pa| Self {
            root_ppn: pa.floor(),
        })
    }
    pub fn from_root(root_ppn: PhysPageNum) -> Self {
        Self { root_ppn }
    }
    /// Temporarily used to inspect the table a `satp` value points at.
    pub fn from_token(satp: usize) -> Self {
        Self {
            root_ppn: PhysPageNum::from(satp & ((1usize << 44) - 1)),
        }
    }
    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }
    /// `satp` value selecting Sv39 with this root
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }

    /// The leaf translating `va` and the level it sits at.
    pub fn find_leaf<M: PhysMemory + ?Sized>(
        &self,
        mem: &M,
        va: VirtAddr,
    ) -> Option<(PageTableEntry, usize)> {
        let idxs = va.floor().indexes();
        let mut ppn = self.root_ppn;
        for level in (0..=2).rev() {
            let pte = read_pte(mem, ppn, idxs[2 - level]);
            if !pte.is_valid() {
                return None;
            }
            if pte.is_leaf() {
                return Some((pte, level));
            }
            ppn = pte.ppn();
        }
        // valid branch at level 0: nothing below it to translate through
        None
    }

    /// Walk the table for `va`. `None` is a page fault; what to do about it is
    /// the caller's business.
    pub fn translate<M: PhysMemory + ?Sized>(&self, mem: &M, va: VirtAddr) -> Option<PhysAddr> {
        self.find_leaf(mem, va).map(|(pte, level)| {
            // huge leaves pass the extra VPN bits through as offset
            let mask = level_size(level) - 1;
            let base: PhysAddr = pte.ppn().into();
            PhysAddr(base.0 & !mask | va.0 & mask)
        })
    }
}

/// Recoverable mapping failures
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapError {
    /// no frame left for an intermediate table
    OutOfFrames,
    /// a huge leaf at `level` already covers the address
    LeafInPath { va: VirtAddr, level: usize },
    /// the target entry points at a table, overwriting it would orphan it
    TableAtTarget { va: VirtAddr, level: usize },
    /// huge page target not aligned to its size
    Misaligned { pa: PhysAddr, level: usize },
}

impl Display for MapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfFrames => write!(f, "no free physical page left for a page table"),
            MapError::LeafInPath { va, level } => {
                write!(f, "{:?} is already mapped by a level-{} leaf", va, level)
            }
            MapError::TableAtTarget { va, level } => {
                write!(f, "level-{} entry for {:?} points at a page table", level, va)
            }
            MapError::Misaligned { pa, level } => {
                write!(f, "{:?} is not aligned for a level-{} page", pa, level)
            }
        }
    }
}

/// Builds, walks and tears down page tables, taking intermediate tables from
/// the frame allocator it was handed.
pub struct PageTableManager<'a, M: PhysMemory> {
    frames: &'a mut FrameAllocator<M>,
}

impl<'a, M: PhysMemory> PageTableManager<'a, M> {
    pub fn new(frames: &'a mut FrameAllocator<M>) -> Self {
        Self { frames }
    }
    pub fn frames(&mut self) -> &mut FrameAllocator<M> {
        &mut *self.frames
    }

    fn pte(&self, table: PhysPageNum, idx: usize) -> PageTableEntry {
        read_pte(self.frames.memory(), table, idx)
    }
    fn set_pte(&self, table: PhysPageNum, idx: usize, pte: PageTableEntry) {
        write_pte(self.frames.memory(), table, idx, pte)
    }

    /// Map `va` to `pa` with a leaf at `level` (0: 4 KiB, 1: 2 MiB, 2: 1 GiB),
    /// creating the tables on the way down. Mapping over an existing leaf
    /// replaces it.
    pub fn map(
        &mut self,
        table: &PageTable,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PTEFlags,
        level: usize,
    ) -> Result<(), MapError> {
        // 没有 R/W/X 的叶节点会被 MMU 当成指向下一级页表的页表项，只能视为内核 bug
        if !flags.intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X) {
            panic!(
                "map: {:?} -> {:?} should set R|W|X, got {:?}",
                va, pa, flags
            );
        }
        assert!(level <= 2, "map: level {} does not exist in Sv39", level);
        if level > 0 && pa.0 & (level_size(level) - 1) != 0 {
            return Err(MapError::Misaligned { pa, level });
        }
        let va = VirtAddr::from(va.floor());
        let idxs = va.floor().indexes();
        let mut ppn = table.root_ppn();
        for lvl in (level + 1..=2).rev() {
            let idx = idxs[2 - lvl];
            let pte = self.pte(ppn, idx);
            // 途中遇到不合法的页表项就新分配一个清零的物理页帧作为下一级页表
            ppn = if !pte.is_valid() {
                let child = self.frames.zalloc(1).ok_or(MapError::OutOfFrames)?.floor();
                self.set_pte(ppn, idx, PageTableEntry::new(child, PTEFlags::V));
                child
            } else if pte.is_leaf() {
                return Err(MapError::LeafInPath { va, level: lvl });
            } else {
                pte.ppn()
            };
        }
        let idx = idxs[2 - level];
        // 目标位置已经是一个页表时不能覆盖，否则其下的整棵子树就丢失了
        if self.pte(ppn, idx).is_branch() {
            return Err(MapError::TableAtTarget { va, level });
        }
        let pte = PageTableEntry::new(pa.floor(), flags | PTEFlags::V);
        self.set_pte(ppn, idx, pte);
        trace!("{}: map {:?} to {:?}, {:?}", level, va, pa, pte);
        Ok(())
    }

    /// Identity-map every page of `[round_down(start), round_up(end))`.
    pub fn identity_map_range(
        &mut self,
        table: &PageTable,
        start: PhysAddr,
        end: PhysAddr,
        flags: PTEFlags,
    ) -> Result<(), MapError> {
        assert!(start <= end, "identity map: {:?} > {:?}", start, end);
        let start_va = VirtAddr::from(start.0);
        let end_va = VirtAddr::from(end.0);
        debug!("identity map [{:#x}, {:#x}) {:?}", start.0, end.0, flags);
        for vpn in VPNRange::new(start_va.floor(), end_va.ceil()) {
            let va = VirtAddr::from(vpn);
            self.map(table, va, PhysAddr::from(va.0), flags, 0)?;
        }
        Ok(())
    }

    pub fn translate(&self, table: &PageTable, va: VirtAddr) -> Option<PhysAddr> {
        table.translate(self.frames.memory(), va)
    }

    /// Free every table below the root and clear the root. The root frame
    /// itself stays with its owner; leaf targets were never ours to free.
    pub fn unmap(&mut self, table: &PageTable) {
        let root = table.root_ppn();
        self.free_children(root, 2);
        self.frames.memory().zero(root.into(), PAGE_SIZE);
        debug!("unmap: released tables under {:?}", root);
    }

    fn free_children(&mut self, table: PhysPageNum, level: usize) {
        for idx in 0..PTE_PER_TABLE {
            let pte = self.pte(table, idx);
            if !pte.is_branch() {
                continue;
            }
            assert!(
                level > 0,
                "unmap: entry {} of level-0 table {:?} points at another table",
                idx,
                table
            );
            self.free_children(pte.ppn(), level - 1);
            self.frames.dealloc(pte.ppn().into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    const BASE: usize = 0x8020_0000;

    fn rw() -> PTEFlags {
        PTEFlags::R | PTEFlags::W
    }

    #[test]
    fn entry_packs_ppn_fields_like_the_mmu() {
        let pa: usize = 0x12_3456_7890_1000;
        let ppn0 = (pa >> 12) & 0x1ff;
        let ppn1 = (pa >> 21) & 0x1ff;
        let ppn2 = (pa >> 30) & 0x3ff_ffff;
        let pte = PageTableEntry::new(PhysAddr::from(pa).floor(), PTEFlags::R | PTEFlags::V);
        assert_eq!(pte.bits, ppn2 << 28 | ppn1 << 19 | ppn0 << 10 | 0b11);
        assert_eq!(PhysAddr::from(pte.ppn()), PhysAddr(pa));
        assert!(pte.is_leaf());
        assert!(!PageTableEntry::new(PhysPageNum(1), PTEFlags::V).is_leaf());
        assert!(PageTableEntry::new(PhysPageNum(1), PTEFlags::V).is_branch());
        assert!(!PageTableEntry::new(PhysPageNum(1), PTEFlags::R).is_valid());
    }

    #[test]
    fn mapped_page_translates_with_offset() {
        let mem = SimMemory::new(BASE, 64 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        let pairs = [
            (0x0000_1000, 0x8800_0000),
            (0x4000_0000, 0x8800_1000),
            (0x0f_0000_0000, 0x8000_0000),
            (0x7f_ffff_f000, 0x1000_0000),
        ];
        for &(va, pa) in pairs.iter() {
            manager
                .map(&table, VirtAddr(va), PhysAddr(pa), rw(), 0)
                .unwrap();
        }
        for &(va, pa) in pairs.iter() {
            for k in [0, 1, 0x123, PAGE_SIZE - 1] {
                assert_eq!(
                    manager.translate(&table, VirtAddr(va + k)),
                    Some(PhysAddr(pa + k))
                );
            }
        }
        assert_eq!(manager.translate(&table, VirtAddr(0x2000)), None);
    }

    #[test]
    fn unaligned_virtual_address_is_rounded_down() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        manager
            .map(&table, VirtAddr(0x5432), PhysAddr(0x9000), PTEFlags::R, 0)
            .unwrap();
        assert_eq!(
            manager.translate(&table, VirtAddr(0x5000)),
            Some(PhysAddr(0x9000))
        );
        assert_eq!(
            manager.translate(&table, VirtAddr(0x5432)),
            Some(PhysAddr(0x9432))
        );
    }

    #[test]
    fn maps_in_one_region_share_intermediate_tables() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        manager
            .map(&table, VirtAddr(0x1000), PhysAddr(0x8000_0000), rw(), 0)
            .unwrap();
        assert_eq!(manager.frames().stats().allocated, 3);
        manager
            .map(&table, VirtAddr(0x2000), PhysAddr(0x8000_1000), rw(), 0)
            .unwrap();
        assert_eq!(manager.frames().stats().allocated, 3);
        // next 2 MiB region needs a new level-0 table only
        manager
            .map(&table, VirtAddr(0x20_0000), PhysAddr(0x8000_2000), rw(), 0)
            .unwrap();
        assert_eq!(manager.frames().stats().allocated, 4);
    }

    #[test]
    fn remapping_a_leaf_replaces_it() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        let va = VirtAddr(0x3000);
        manager.map(&table, va, PhysAddr(0x8000_0000), rw(), 0).unwrap();
        manager
            .map(&table, va, PhysAddr(0x8000_5000), PTEFlags::R, 0)
            .unwrap();
        assert_eq!(manager.translate(&table, va), Some(PhysAddr(0x8000_5000)));
        let (leaf, level) = table.find_leaf(&mem, va).unwrap();
        assert_eq!(level, 0);
        assert!(!leaf.writable());
    }

    #[test]
    fn huge_pages_pass_the_low_bits_through() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        // 2 MiB: one level-1 table under the root
        manager
            .map(&table, VirtAddr(0x4020_0000), PhysAddr(0x8020_0000), rw(), 1)
            .unwrap();
        assert_eq!(manager.frames().stats().allocated, 2);
        assert_eq!(
            manager.translate(&table, VirtAddr(0x4021_2345)),
            Some(PhysAddr(0x8021_2345))
        );
        // 1 GiB: a leaf straight in the root
        manager
            .map(&table, VirtAddr(0x8000_0000), PhysAddr(0x8000_0000), rw(), 2)
            .unwrap();
        assert_eq!(manager.frames().stats().allocated, 2);
        assert_eq!(
            manager.translate(&table, VirtAddr(0x8765_4321)),
            Some(PhysAddr(0x8765_4321))
        );
        assert_eq!(table.find_leaf(&mem, VirtAddr(0x8765_4321)).unwrap().1, 2);
    }

    #[test]
    fn misaligned_huge_page_is_refused() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        assert_eq!(
            manager.map(&table, VirtAddr(0x20_0000), PhysAddr(0x8000_1000), rw(), 1),
            Err(MapError::Misaligned {
                pa: PhysAddr(0x8000_1000),
                level: 1
            })
        );
    }

    #[test]
    fn small_page_under_a_huge_leaf_is_refused() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        manager
            .map(&table, VirtAddr(0x20_0000), PhysAddr(0x8020_0000), rw(), 1)
            .unwrap();
        assert_eq!(
            manager.map(&table, VirtAddr(0x20_3000), PhysAddr(0x9000), rw(), 0),
            Err(MapError::LeafInPath {
                va: VirtAddr(0x20_3000),
                level: 1
            })
        );
    }

    #[test]
    fn huge_leaf_over_a_table_is_refused() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        manager
            .map(&table, VirtAddr(0x20_3000), PhysAddr(0x9000), rw(), 0)
            .unwrap();
        assert_eq!(
            manager.map(&table, VirtAddr(0x20_0000), PhysAddr(0x8020_0000), rw(), 1),
            Err(MapError::TableAtTarget {
                va: VirtAddr(0x20_0000),
                level: 1
            })
        );
        assert_eq!(
            manager.translate(&table, VirtAddr(0x20_3000)),
            Some(PhysAddr(0x9000))
        );
    }

    #[test]
    fn running_out_of_table_frames_is_reported() {
        let mem = SimMemory::new(BASE, 4 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 4 * PAGE_SIZE);
        assert_eq!(frames.num_pages(), 3);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        manager
            .map(&table, VirtAddr(0x1000), PhysAddr(0x9000), rw(), 0)
            .unwrap();
        assert_eq!(
            manager.map(&table, VirtAddr(0x4000_0000), PhysAddr(0xa000), rw(), 0),
            Err(MapError::OutOfFrames)
        );
        assert_eq!(
            manager.translate(&table, VirtAddr(0x1000)),
            Some(PhysAddr(0x9000))
        );
    }

    #[test]
    #[should_panic(expected = "should set R|W|X")]
    fn map_without_permissions_panics() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        let _ = manager.map(&table, VirtAddr(0x1000), PhysAddr(0x9000), PTEFlags::U, 0);
    }

    #[test]
    fn identity_range_covers_partial_pages() {
        let mem = SimMemory::new(BASE, 16 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 16 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let mut manager = PageTableManager::new(&mut frames);
        manager
            .identity_map_range(
                &table,
                PhysAddr(0x1000_0010),
                PhysAddr(0x1000_2001),
                rw(),
            )
            .unwrap();
        for va in [0x1000_0000, 0x1000_0010, 0x1000_1abc, 0x1000_2fff] {
            assert_eq!(manager.translate(&table, VirtAddr(va)), Some(PhysAddr(va)));
        }
        assert_eq!(manager.translate(&table, VirtAddr(0x0fff_f000)), None);
        assert_eq!(manager.translate(&table, VirtAddr(0x1000_3000)), None);
    }

    #[test]
    fn unmap_returns_every_table_frame() {
        let mem = SimMemory::new(BASE, 64 * PAGE_SIZE);
        let mut frames = FrameAllocator::new(&mem, BASE, 64 * PAGE_SIZE);
        let table = PageTable::new(&mut frames).unwrap();
        let root: PhysAddr = table.root_ppn().into();
        let mut manager = PageTableManager::new(&mut frames);
        let vas = [0x1000, 0x20_0000, 0x4000_0000, 0x4000_1000, 0x0f_0000_0000];
        for (i, &va) in vas.iter().enumerate() {
            manager
                .map(&table, VirtAddr(va), PhysAddr(0x9000_0000 + i * PAGE_SIZE), rw(), 0)
                .unwrap();
        }
        manager
            .map(&table, VirtAddr(0x8000_0000), PhysAddr(0x8000_0000), rw(), 2)
            .unwrap();
        assert_eq!(manager.frames().stats().allocated, 1 + 7);
        manager.unmap(&table);
        assert_eq!(manager.frames().stats().allocated, 1);
        for &va in vas.iter() {
            assert_eq!(manager.translate(&table, VirtAddr(va)), None);
        }
        assert_eq!(manager.translate(&table, VirtAddr(0x8000_0000)), None);
        // the first table frame handed out after the root is free again
        assert_eq!(manager.frames().alloc(1), Some(root + PAGE_SIZE));
    }

    #[test]
    fn token_selects_sv39() {
        let table = PageTable::from_root(PhysPageNum(0x80201));
        assert_eq!(table.token(), 0x8000_0000_0008_0201);
        assert_eq!(PageTable::from_token(table.token()), table);
    }
}
