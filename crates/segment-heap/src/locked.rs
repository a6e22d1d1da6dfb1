//! A [`HeapManager`] behind a spin lock, usable as a global allocator.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::{Mutex, MutexGuard};

use crate::{HeapManager, InitError, block::ALIGNMENT};

/// A thread-safe heap.
///
/// Implements [`GlobalAlloc`] for layouts whose alignment does not exceed
/// [`ALIGNMENT`](crate::ALIGNMENT). Requests with a stricter alignment fail.
///
/// ```rust,ignore
/// use segment_heap::LockedHeap;
///
/// #[global_allocator]
/// static HEAP: LockedHeap = LockedHeap::empty();
///
/// fn init_heap(start: *mut u8, size: usize) {
///     unsafe { HEAP.init(start, size) }.unwrap();
/// }
/// ```
pub struct LockedHeap {
    heap: Mutex<HeapManager>,
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedHeap {
    /// Creates a heap without a segment. Every allocation fails until
    /// [`init`](Self::init) is called.
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(HeapManager::empty())
    }

    #[must_use]
    pub const fn new(heap: HeapManager) -> Self {
        Self {
            heap: Mutex::new(heap),
        }
    }

    /// Resets the heap to serve the region `base..base + capacity`.
    ///
    /// # Safety
    ///
    /// Same as [`HeapManager::init`]. In addition, no allocation made before
    /// this call may still be in use.
    pub unsafe fn init(&self, base: *mut u8, capacity: usize) -> Result<(), InitError> {
        unsafe { self.heap.lock().init(base, capacity) }
    }

    /// Locks the heap for direct access.
    pub fn lock(&self) -> MutexGuard<'_, HeapManager> {
        self.heap.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.heap
            .lock()
            .allocate(layout.size())
            .map_or(ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.heap.lock().release(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        unsafe { self.heap.lock().resize(ptr, new_size) }
            .map_or(ptr::null_mut(), |ptr| ptr.as_ptr())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn with_locked_heap<F>(words: usize, test_fn: F)
    where
        F: FnOnce(&LockedHeap),
    {
        let mut buf = vec![0_usize; words];
        let heap = LockedHeap::empty();
        unsafe { heap.init(buf.as_mut_ptr().cast(), words * size_of::<usize>()) }.unwrap();
        test_fn(&heap);
        assert!(heap.lock().validate());
        drop(heap);
        drop(buf);
    }

    #[test]
    fn test_empty_heap_fails() {
        let heap = LockedHeap::empty();
        let layout = Layout::from_size_align(8, 8).unwrap();
        assert!(unsafe { heap.alloc(layout) }.is_null());
    }

    #[test]
    fn test_alloc_dealloc() {
        with_locked_heap(128, |heap| unsafe {
            let layout = Layout::new::<[u64; 4]>();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert!(ptr.cast::<u64>().is_aligned());
            ptr.cast::<[u64; 4]>().write([1, 2, 3, 4]);
            heap.dealloc(ptr, layout);
            assert_eq!(heap.lock().stats().allocated_blocks, 0);
        });
    }

    #[test]
    fn test_rejects_over_aligned_layout() {
        with_locked_heap(128, |heap| {
            let layout = Layout::from_size_align(16, 2 * ALIGNMENT).unwrap();
            assert!(unsafe { heap.alloc(layout) }.is_null());
            assert_eq!(heap.lock().used(), 0);
        });
    }

    #[test]
    fn test_realloc_keeps_contents() {
        with_locked_heap(256, |heap| unsafe {
            let layout = Layout::from_size_align(16, 8).unwrap();
            let ptr = heap.alloc(layout);
            let _blocker = heap.alloc(layout);
            ptr.copy_from_nonoverlapping(b"0123456789abcdef".as_ptr(), 16);
            let grown = heap.realloc(ptr, layout, 200);
            assert!(!grown.is_null());
            assert_ne!(grown, ptr);
            assert_eq!(
                core::slice::from_raw_parts(grown, 16),
                b"0123456789abcdef"
            );
            heap.dealloc(grown, Layout::from_size_align(200, 8).unwrap());
        });
    }

    #[test]
    fn test_shared_between_threads() {
        let mut buf = vec![0_usize; 4096];
        let heap = Arc::new(LockedHeap::empty());
        unsafe { heap.init(buf.as_mut_ptr().cast(), buf.len() * size_of::<usize>()) }.unwrap();

        let handles = (0..4_u8)
            .map(|n| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let layout = Layout::from_size_align(usize::from(n) * 8 + 8, 8).unwrap();
                    for _ in 0..100 {
                        unsafe {
                            let ptr = heap.alloc(layout);
                            assert!(!ptr.is_null());
                            ptr.write_bytes(n, layout.size());
                            assert!((0..layout.size()).all(|i| ptr.add(i).read() == n));
                            heap.dealloc(ptr, layout);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let heap = heap.lock();
        assert!(heap.validate());
        assert_eq!(heap.stats().allocated_blocks, 0);
        drop(heap);
        drop(buf);
    }
}
