//! Constants used in the kernel

pub use kmem::config::PAGE_SIZE;

/// qemu virt 机器的物理内存上限，帧分配器管理 [ekernel, MEMORY_END)
pub const MEMORY_END: usize = 0x8800_0000;

/// memory-mapped device registers of the qemu virt board, `(base, len)`
pub const MMIO: &[(usize, usize)] = &[
    (0x1000_0000, 0x100),    // UART0
    (0x1000_1000, 0x1000),   // VIRTIO0
    (0x0200_0000, 0x1_0000), // CLINT
    (0x0c00_0000, 0x60_0000), // PLIC
];
