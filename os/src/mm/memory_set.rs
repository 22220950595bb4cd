//! The kernel address space: identity maps of the kernel image, the frame
//! heap and the device registers, and switching the MMU over to it.

use super::IdentityMemory;
use crate::config::{MEMORY_END, MMIO};
use crate::sync::UPSafeCell;
use core::arch::asm;
use kmem::{PTEFlags, PageTable, PageTableManager, PhysAddr, VirtAddr};
use lazy_static::*;
use log::info;
use riscv::register::satp;

extern "C" {
    fn stext();
    fn etext();
    fn srodata();
    fn erodata();
    fn sdata();
    fn edata();
    fn sbss_with_stack();
    fn ebss();
    fn ekernel();
}

lazy_static! {
    /// satp value of the kernel address space, 0 until it is activated
    static ref KERNEL_TOKEN: UPSafeCell<usize> = unsafe { UPSafeCell::new(0) };
}

/// Get kernel space satp token
pub fn kernel_token() -> usize {
    *KERNEL_TOKEN.exclusive_access()
}

bitflags! {
    /// map permission corresponding to that in pte: `R W X U`
    pub struct MapPermission: u8 {
        ///Readable
        const R = 1 << 1;
        ///Writable
        const W = 1 << 2;
        ///Excutable
        const X = 1 << 3;
        ///Accessible in U mode
        const U = 1 << 4;
    }
}

impl From<MapPermission> for PTEFlags {
    fn from(perm: MapPermission) -> Self {
        PTEFlags::from_bits_truncate(perm.bits())
    }
}

fn map_identical(
    pt: &mut PageTableManager<IdentityMemory>,
    table: &PageTable,
    name: &str,
    start: usize,
    end: usize,
    perm: MapPermission,
) {
    println!("mapping {} [{:#x}, {:#x})", name, start, end);
    pt.identity_map_range(table, PhysAddr::from(start), PhysAddr::from(end), perm.into())
        .unwrap_or_else(|err| panic!("kernel space: mapping {} failed: {}", name, err));
}

/// Identity-map the kernel image section by section, the rest of RAM and the
/// device registers into `table`.
pub fn map_kernel(pt: &mut PageTableManager<IdentityMemory>, table: &PageTable) {
    map_identical(
        pt,
        table,
        ".text",
        stext as usize,
        etext as usize,
        MapPermission::R | MapPermission::X,
    );
    map_identical(
        pt,
        table,
        ".rodata",
        srodata as usize,
        erodata as usize,
        MapPermission::R,
    );
    map_identical(
        pt,
        table,
        ".data",
        sdata as usize,
        edata as usize,
        MapPermission::R | MapPermission::W,
    );
    // 启动栈放在 .bss.stack 中，与 .bss 一起映射
    map_identical(
        pt,
        table,
        ".bss",
        sbss_with_stack as usize,
        ebss as usize,
        MapPermission::R | MapPermission::W,
    );
    map_identical(
        pt,
        table,
        "physical memory",
        ekernel as usize,
        MEMORY_END,
        MapPermission::R | MapPermission::W,
    );
    for &(base, len) in MMIO {
        // 透明的恒等映射，从而让内核可以兼容于直接访问物理地址的设备驱动
        map_identical(
            pt,
            table,
            "memory-mapped registers",
            base,
            base + len,
            MapPermission::R | MapPermission::W,
        );
    }
}

/// Turn on Sv39 paging with `table` as the root.
pub fn activate(table: &PageTable) {
    let satp = table.token();
    unsafe {
        // 这条写入 satp 的指令及其下一条指令都在恒等映射的代码段中，切换前后取指地址不变
        satp::write(satp);
        // sfence.vma 清空快表，MMU 不会再看到过期的键值对
        asm!("sfence.vma");
    }
    *KERNEL_TOKEN.exclusive_access() = satp;
    info!("kernel space activated, satp = {:#x}", satp);
}

/// Check the permissions of the live kernel address space.
pub fn remap_test() {
    let table = PageTable::from_token(kernel_token());
    let leaf = |va: usize| {
        table
            .find_leaf(&IdentityMemory, VirtAddr::from(va))
            .map(|(pte, _)| pte)
            .unwrap_or_else(|| panic!("remap_test: {:#x} is not mapped", va))
    };
    let mid_text = (stext as usize + etext as usize) / 2;
    let mid_rodata = (srodata as usize + erodata as usize) / 2;
    let mid_data = (sdata as usize + edata as usize) / 2;
    assert!(!leaf(mid_text).writable());
    assert!(!leaf(mid_rodata).writable());
    assert!(!leaf(mid_data).executable());
    assert_eq!(
        table.translate(&IdentityMemory, VirtAddr::from(mid_data)),
        Some(PhysAddr::from(mid_data))
    );
    println!("remap_test passed!");
}
