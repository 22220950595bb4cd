//! Physical memory as the kernel sees it: identity mapped, before and after
//! paging is turned on.

use kmem::{PhysAddr, PhysMemory};

/// RAM reached through raw pointers at the physical address itself
#[derive(Copy, Clone, Default)]
pub struct IdentityMemory;

// 内核地址空间对 [stext, MEMORY_END) 做恒等映射，开启分页前后物理地址都可以直接当作指针使用
impl PhysMemory for IdentityMemory {
    fn read_u8(&self, pa: PhysAddr) -> u8 {
        unsafe { (pa.0 as *const u8).read_volatile() }
    }
    fn write_u8(&self, pa: PhysAddr, val: u8) {
        unsafe { (pa.0 as *mut u8).write_volatile(val) }
    }
    fn read_u64(&self, pa: PhysAddr) -> u64 {
        assert_eq!(pa.0 % 8, 0, "unaligned word read at {:?}", pa);
        unsafe { (pa.0 as *const u64).read_volatile() }
    }
    fn write_u64(&self, pa: PhysAddr, val: u64) {
        assert_eq!(pa.0 % 8, 0, "unaligned word write at {:?}", pa);
        unsafe { (pa.0 as *mut u64).write_volatile(val) }
    }
}
