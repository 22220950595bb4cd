//! Boot-time checks of the frame allocator and the kernel heap, run on the
//! real RAM once paging is on.

use super::IdentityMemory;
use crate::config::PAGE_SIZE;
use kmem::{FrameAllocator, Heap, PhysMemory};

pub fn frame_allocator_test(frames: &mut FrameAllocator<IdentityMemory>) {
    let before = frames.stats();
    // 几乎全部空闲页帧的大块分配
    let large = frames
        .alloc(before.free - 1)
        .expect("frame_allocator_test: large allocation failed");
    assert_eq!(frames.stats().free, 1);
    frames.dealloc(large);
    // 多分配 10 页，剩下的连续空间无论 free 奇偶都不够再分一半
    let half = frames
        .alloc(before.free / 2 + 10)
        .expect("frame_allocator_test: half allocation failed");
    assert!(frames.alloc(before.free / 2).is_none());
    frames.dealloc(half);
    let run = frames.alloc(3).unwrap();
    frames.dealloc(run);
    assert_eq!(frames.alloc(3), Some(run));
    IdentityMemory.write_u8(run + (PAGE_SIZE + 7), 0xa5);
    frames.dealloc(run);
    let zeroed = frames.zalloc(3).unwrap();
    assert_eq!(zeroed, run);
    assert!((0..3 * PAGE_SIZE).all(|offset| IdentityMemory.read_u8(zeroed + offset) == 0));
    frames.dealloc(zeroed);
    assert_eq!(frames.stats(), before);
    println!("frame_allocator_test passed!");
}

pub fn heap_test(heap: &mut Heap<IdentityMemory>) {
    let blocks = heap.blocks().count();
    assert!(heap.malloc(0).is_none());
    assert!(heap.malloc(heap.arena_len()).is_none());
    let a = heap.zmalloc(24).unwrap();
    let b = heap.malloc(100).unwrap();
    let c = heap.malloc(8).unwrap();
    for ptr in [a, b, c] {
        assert_eq!(ptr.0 % 8, 0);
        assert!(ptr > heap.arena_start() && ptr.0 < heap.arena_start().0 + heap.arena_len());
    }
    assert!(b.0 >= a.0 + 24 && c.0 >= b.0 + 100);
    assert_eq!(IdentityMemory.read_u64(a + 16), 0);
    heap.free(b);
    heap.free(a);
    heap.free(c);
    assert_eq!(heap.blocks().count(), blocks);
    assert!(heap.coalesce().is_ok());
    println!("heap_test passed!");
}
