//! Global allocator adapter.
//!
//! Platform-specific interposition (preload shims, loader tricks) lives
//! outside this crate; for pure Rust programs the same hook contract is
//! satisfied by installing [`StreamAllocator`] as the global allocator.  It
//! delegates every operation to [`System`] and reports the outcome to the
//! process-wide tracker, which ignores everything until [`crate::init`] runs.

use std::alloc::{GlobalAlloc, Layout, System};

use libc::c_void;

/// Allocator that reports each heap operation to the tracker and forwards the
/// actual work to [`System`].
///
/// ```
/// use heap_stream::StreamAllocator;
///
/// #[global_allocator]
/// static GLOBAL: StreamAllocator = StreamAllocator;
///
/// fn main() {}
/// ```
pub struct StreamAllocator;

unsafe impl GlobalAlloc for StreamAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            crate::record_malloc(ptr as *mut c_void, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            crate::record_malloc(ptr as *mut c_void, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        crate::record_free(ptr as *mut c_void);
        System.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            crate::record_realloc(ptr as *mut c_void, new_size, new_ptr as *mut c_void);
        }
        new_ptr
    }
}
