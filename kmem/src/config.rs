//! Constants used by the memory core

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;
/// frames handed to the sub-page heap at boot (2 MiB)
pub const KMEM_PAGES: usize = 512;
/// entries in one page table
pub const PTE_PER_TABLE: usize = 512;
/// bits of the virtual page number consumed per level
pub const VPN_BITS_PER_LEVEL: usize = 9;

pub const PA_WIDTH_SV39: usize = 56;
pub const VA_WIDTH_SV39: usize = 39;
pub const PPN_WIDTH_SV39: usize = PA_WIDTH_SV39 - PAGE_SIZE_BITS;
pub const VPN_WIDTH_SV39: usize = VA_WIDTH_SV39 - PAGE_SIZE_BITS;
