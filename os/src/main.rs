// os/src/main.rs
#![no_std]
#![no_main]
// 需要在 main.rs 开头加上 #![feature(panic_info_message)] 才能通过 PanicInfo::message 获取报错信息
#![feature(panic_info_message)]

#[macro_use]
extern crate bitflags;

#[macro_use]
mod console;
mod config;
mod lang_items;
mod logging;
pub mod mm;
pub mod sbi;
pub mod sync;

use core::arch::global_asm;
use log::info;
// 通过 include_str! 宏将同目录下的汇编代码 entry.asm 转化为字符串并通过 global_asm! 宏嵌入到代码中
global_asm!(include_str!("entry.asm"));

#[no_mangle]
pub fn rust_main() -> ! {
    clear_bss();
    logging::init();
    println!("[kernel] Hello, world!");
    let mut kernel_memory = mm::init();
    info!("[kernel] running on kernel space, satp = {:#x}", mm::kernel_token());
    mm::remap_test();
    mm::frame_allocator_test(&mut kernel_memory.frames);
    mm::heap_test(&mut kernel_memory.heap);
    kernel_memory.frames.print_page_allocations();
    kernel_memory.heap.print_blocks();
    println!("[kernel] memory core is up, shutting down");
    sbi::shutdown(false)
}

// 在使用任何被分配到 .bss 段的全局变量之前我们需要确保 .bss 段已被清零，启动栈在 sbss 之前，不会被清掉
fn clear_bss() {
    extern "C" {
        fn sbss();
        fn ebss();
    }
    unsafe {
        core::slice::from_raw_parts_mut(sbss as usize as *mut u8, ebss as usize - sbss as usize)
            .fill(0);
    }
}
