//! Memory management implementation
//!
//! SV39 page-based virtual-memory architecture for RV64 systems. The frame
//! allocator, the kernel heap and the page tables come from `kmem`; this
//! module owns them for the kernel, builds the kernel address space and turns
//! paging on.

mod heap_allocator;
mod identity;
mod memory_set;

pub use heap_allocator::{frame_allocator_test, heap_test};
pub use identity::IdentityMemory;
pub use memory_set::{kernel_token, remap_test};

use crate::config::MEMORY_END;
use kmem::{FrameAllocator, Heap, PageTableManager};

/// Everything the memory core hands out, owned by `rust_main`.
pub struct KernelMemory {
    pub frames: FrameAllocator<IdentityMemory>,
    pub heap: Heap<IdentityMemory>,
}

/// initiate frame allocator, kernel heap and kernel space
pub fn init() -> KernelMemory {
    extern "C" {
        fn ekernel();
    }
    // 物理页帧管理器接管内核镜像之后直到 MEMORY_END 的全部物理内存
    let heap_start = ekernel as usize;
    let mut frames = FrameAllocator::new(IdentityMemory, heap_start, MEMORY_END - heap_start);
    // 内核堆与内核根页表都从页帧分配器中取得
    let heap = Heap::new(&mut frames);
    let kernel_table = heap.kernel_table();
    memory_set::map_kernel(&mut PageTableManager::new(&mut frames), &kernel_table);
    // 创建内核地址空间并让 CPU 开启分页模式， MMU 在地址转换的时候使用内核的多级页表
    memory_set::activate(&kernel_table);
    KernelMemory { frames, heap }
}
