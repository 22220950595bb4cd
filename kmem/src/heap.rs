//! Sub-page allocator for kernel objects smaller than a page

// 从 FrameAllocator 取一段连续页帧作为 arena，arena 被若干块首尾相接地铺满。
// 每块以 8 字节的块头开始：最低位表示是否已分配，其余位是包含块头在内的块大小。
// 块头只通过 PhysMemory 在检查过边界的偏移处读写，再解码为 BlockHeader，不把内存强转成结构体

use crate::address::PhysAddr;
use crate::config::{KMEM_PAGES, PAGE_SIZE};
use crate::frame_allocator::FrameAllocator;
use crate::memory::PhysMemory;
use crate::page_table::PageTable;
use core::fmt::{self, Display, Formatter};
use log::{error, info, trace};

/// bytes taken by one block header
pub const HEADER_SIZE: usize = 8;
/// block sizes and payloads are multiples of this
const ALIGN: usize = 8;

fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGN - 1)? & !(ALIGN - 1))
}

/// Decoded block header
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// bytes in the block, header included
    pub size: usize,
    pub taken: bool,
}

impl BlockHeader {
    const TAKEN_BIT: u64 = 1;

    pub fn free(size: usize) -> Self {
        Self { size, taken: false }
    }
    pub fn taken(size: usize) -> Self {
        Self { size, taken: true }
    }
    pub fn decode(word: u64) -> Self {
        Self {
            size: (word & !Self::TAKEN_BIT) as usize,
            taken: word & Self::TAKEN_BIT != 0,
        }
    }
    pub fn encode(self) -> u64 {
        debug_assert_eq!(self.size % ALIGN, 0);
        self.size as u64 | if self.taken { Self::TAKEN_BIT } else { 0 }
    }
}

/// A block in the chain
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// address of the header
    pub addr: PhysAddr,
    pub size: usize,
    pub taken: bool,
}

impl Block {
    /// first byte handed to the caller
    pub fn payload(&self) -> PhysAddr {
        self.addr + HEADER_SIZE
    }
}

/// The block chain no longer tiles the arena: a double free or a stray write
/// went through a header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// header size cannot describe a block (zero, smaller than a header, unaligned)
    BadSize { at: PhysAddr, size: usize },
    /// block runs past the end of the arena
    Overrun { at: PhysAddr, size: usize },
}

impl Display for HeapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::BadSize { at, size } => {
                write!(f, "block at {:?} has impossible size {:#x}", at, size)
            }
            HeapError::Overrun { at, size } => {
                write!(f, "block at {:?} of size {:#x} runs past the arena", at, size)
            }
        }
    }
}

/// Byte allocator for kernel objects smaller than a page
pub struct Heap<M: PhysMemory> {
    mem: M,
    arena: PhysAddr,
    len: usize,
    kernel_table: PageTable,
}

impl<M: PhysMemory + Clone> Heap<M> {
    /// Take [`KMEM_PAGES`] frames for the arena and one more for the kernel's
    /// root page table.
    pub fn new(frames: &mut FrameAllocator<M>) -> Self {
        Self::with_pages(frames, KMEM_PAGES)
    }

    /// Same as [`Self::new`] with an arena of `pages` frames.
    ///
    /// Runs at boot with nothing to fall back on, so running out of frames here
    /// panics.
    pub fn with_pages(frames: &mut FrameAllocator<M>, pages: usize) -> Self {
        let arena = frames
            .zalloc(pages)
            .unwrap_or_else(|| panic!("kmem init: no room for {} heap pages", pages));
        let kernel_table = PageTable::new(frames)
            .unwrap_or_else(|| panic!("kmem init: no room for the kernel page table"));
        let len = pages * PAGE_SIZE;
        let heap = Self {
            mem: frames.memory().clone(),
            arena,
            len,
            kernel_table,
        };
        heap.write_header(0, BlockHeader::free(len));
        info!(
            "kmem: arena [{:#x}, {:#x}), kernel table {:?}",
            arena.0,
            arena.0 + len,
            kernel_table.root_ppn()
        );
        heap
    }
}

impl<M: PhysMemory> Heap<M> {
    pub fn arena_start(&self) -> PhysAddr {
        self.arena
    }
    pub fn arena_len(&self) -> usize {
        self.len
    }
    /// root page table of the kernel address space
    pub fn kernel_table(&self) -> PageTable {
        self.kernel_table
    }

    /// Header at `offset` into the arena, validated against the arena extent.
    fn header_at(&self, offset: usize) -> Result<BlockHeader, HeapError> {
        assert!(offset + HEADER_SIZE <= self.len && offset % ALIGN == 0);
        let at = self.arena + offset;
        let header = BlockHeader::decode(self.mem.read_u64(at));
        if header.size <= HEADER_SIZE || header.size % ALIGN != 0 {
            return Err(HeapError::BadSize {
                at,
                size: header.size,
            });
        }
        if header.size > self.len - offset {
            return Err(HeapError::Overrun {
                at,
                size: header.size,
            });
        }
        Ok(header)
    }

    fn write_header(&self, offset: usize, header: BlockHeader) {
        assert!(offset + header.size <= self.len && offset % ALIGN == 0);
        self.mem.write_u64(self.arena + offset, header.encode());
    }

    /// Walk the chain from the start of the arena.
    pub fn blocks(&self) -> Blocks<'_, M> {
        Blocks {
            heap: self,
            offset: 0,
            failed: false,
        }
    }

    fn offset_of(&self, block: &Block) -> usize {
        block.addr.0 - self.arena.0
    }

    /// Allocate `size` bytes, first fit. The result is 8-byte aligned.
    /// `None` when no free block is large enough, or for zero bytes.
    pub fn malloc(&mut self, size: usize) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }
        let need = align_up(size)?.checked_add(HEADER_SIZE)?;
        let block = self
            .blocks()
            .map(|block| block.unwrap_or_else(|err| panic!("kmalloc: heap corrupted: {}", err)))
            .find(|block| !block.taken && block.size >= need)?;
        let offset = self.offset_of(&block);
        let rem = block.size - need;
        // 剩余部分放得下块头再加至少 8 字节时才切分出新的空闲块
        if rem > HEADER_SIZE {
            self.write_header(offset + need, BlockHeader::free(rem));
            self.write_header(offset, BlockHeader::taken(need));
        } else {
            self.write_header(offset, BlockHeader::taken(block.size));
        }
        trace!("kmalloc {} bytes at {:?}", size, block.payload());
        Some(block.payload())
    }

    /// Like [`Self::malloc`], with the payload zeroed.
    pub fn zmalloc(&mut self, size: usize) -> Option<PhysAddr> {
        let ptr = self.malloc(size)?;
        self.mem.zero(ptr, align_up(size)?);
        Some(ptr)
    }

    /// Release a block handed out by [`Self::malloc`] and merge free
    /// neighbours. A null pointer is ignored.
    pub fn free(&mut self, ptr: PhysAddr) {
        if ptr.is_null() {
            return;
        }
        if ptr < self.arena + HEADER_SIZE || ptr >= self.arena + self.len || ptr.0 % ALIGN != 0 {
            panic!("kfree: {:?} is not a heap pointer", ptr);
        }
        let addr = ptr - HEADER_SIZE;
        let block = self
            .blocks()
            .map(|block| block.unwrap_or_else(|err| panic!("kfree: heap corrupted: {}", err)))
            .find(|block| block.addr >= addr)
            .filter(|block| block.addr == addr)
            .unwrap_or_else(|| panic!("kfree: {:?} does not start a block", ptr));
        if block.taken {
            let offset = self.offset_of(&block);
            self.write_header(offset, BlockHeader::free(block.size));
            trace!("kfree {:?}", ptr);
        }
        if let Err(err) = self.coalesce() {
            panic!("kfree: heap corrupted: {}", err);
        }
    }

    /// Merge every run of adjacent free blocks, in one pass from the start.
    ///
    /// A header that cannot be right stops the pass and is reported; nothing
    /// is repaired.
    pub fn coalesce(&mut self) -> Result<(), HeapError> {
        let result = self.merge_free_runs();
        if let Err(err) = result {
            error!("coalesce stopped: {}", err);
        }
        result
    }

    fn merge_free_runs(&mut self) -> Result<(), HeapError> {
        let mut offset = 0;
        while offset < self.len {
            let head = self.header_at(offset)?;
            let next = offset + head.size;
            if next == self.len {
                break;
            }
            let neighbour = self.header_at(next)?;
            if !head.taken && !neighbour.taken {
                // 合并后停在 head 上，继续尝试吞并再后面的空闲块
                self.write_header(offset, BlockHeader::free(head.size + neighbour.size));
                continue;
            }
            offset = next;
        }
        Ok(())
    }

    pub fn print_blocks(&self) {
        for block in self.blocks() {
            match block {
                Ok(block) => info!(
                    "{:#x}: len {}, taken {}",
                    block.addr.0, block.size, block.taken as u8
                ),
                Err(err) => error!("{}", err),
            }
        }
    }
}

/// iterator over the block chain of a [`Heap`]; stops after the first
/// corrupt header
pub struct Blocks<'a, M: PhysMemory> {
    heap: &'a Heap<M>,
    offset: usize,
    failed: bool,
}

impl<'a, M: PhysMemory> Iterator for Blocks<'a, M> {
    type Item = Result<Block, HeapError>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.heap.len {
            return None;
        }
        match self.heap.header_at(self.offset) {
            Ok(header) => {
                let block = Block {
                    addr: self.heap.arena + self.offset,
                    size: header.size,
                    taken: header.taken,
                };
                self.offset += header.size;
                Some(Ok(block))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
