//! [`GlobalAlloc`] support, so that a `static` [`Heap`] can back `alloc`.
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: Heap = Heap::new(16);
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use super::Heap;

unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.free_aligned(ptr, layout.align()) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= self.alignment() {
            return unsafe { Heap::realloc(self, NonNull::new(ptr), new_size) }
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        let Some(new_ptr) = self.alloc_aligned(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        unsafe {
            new_ptr.as_ptr().copy_from_nonoverlapping(ptr, layout.size().min(new_size));
            GlobalAlloc::dealloc(self, ptr, layout);
        }
        new_ptr.as_ptr()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_heap(size: usize) -> Heap {
        let heap = Heap::new(16);
        heap.add_pool(Box::leak(vec![0_u8; size].into_boxed_slice()))
            .unwrap();
        heap
    }

    #[test]
    fn test_layout_alignment_is_honored() {
        let heap = leaked_heap(8192);
        let initial = heap.bytes_free();
        unsafe {
            for align in [1, 16, 128, 512] {
                let layout = Layout::from_size_align(200, align).unwrap();
                let ptr = GlobalAlloc::alloc(&heap, layout);
                assert!(!ptr.is_null());
                assert_eq!(ptr.addr() % align, 0);
                ptr.write_bytes(0x33, 200);
                GlobalAlloc::dealloc(&heap, ptr, layout);
            }
        }
        assert_eq!(heap.bytes_free(), initial);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let heap = leaked_heap(8192);
        unsafe {
            for align in [8, 256] {
                let layout = Layout::from_size_align(64, align).unwrap();
                let ptr = GlobalAlloc::alloc(&heap, layout);
                ptr.write_bytes(0x33, 64);
                let grown = GlobalAlloc::realloc(&heap, ptr, layout, 1000);
                assert!(!grown.is_null());
                assert_eq!(grown.addr() % align, 0);
                assert!((0..64).all(|i| grown.add(i).read() == 0x33));
                let layout = Layout::from_size_align(1000, align).unwrap();
                GlobalAlloc::dealloc(&heap, grown, layout);
            }
        }
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_exhaustion_yields_null() {
        let heap = leaked_heap(512);
        let layout = Layout::from_size_align(4096, 8).unwrap();
        assert!(unsafe { GlobalAlloc::alloc(&heap, layout) }.is_null());
    }
}
