//! Memory core of the kernel: physical frames, the sub-page heap and Sv39
//! page tables.
//!
//! Nothing here owns hardware. Every access to physical memory goes through
//! [`PhysMemory`]; the kernel hands in identity-mapped RAM, tests and the
//! host tools hand in [`SimMemory`].
#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;
#[macro_use]
extern crate bitflags;

mod address;
pub mod config;
mod frame_allocator;
mod heap;
mod memory;
mod page_table;
#[cfg(any(test, feature = "sim"))]
mod sim;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use config::{KMEM_PAGES, PAGE_SIZE, PAGE_SIZE_BITS};
pub use frame_allocator::{Allocation, Allocations, FrameAllocator, FrameStats, PageFlags};
pub use heap::{Block, BlockHeader, Blocks, Heap, HeapError, HEADER_SIZE};
pub use memory::PhysMemory;
pub use page_table::{
    level_size, MapError, PTEFlags, PageTable, PageTableEntry, PageTableManager,
};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimMemory;
