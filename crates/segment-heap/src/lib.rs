//! An explicit free-list heap allocator over a single, caller-supplied
//! memory segment.
//!
//! The allocator keeps all of its bookkeeping inside the segment it manages.
//! The segment is tiled by blocks, each a one-word header followed by a
//! payload. Free blocks are threaded onto an intrusive doubly linked list
//! through their first two payload words. Blocks are committed from the start
//! of the segment upwards, so the segment is split into a committed prefix and
//! an uncommitted tail:
//!
//! ```text
//! ┌──────┬─────────┬──────┬──────┬──────┬─────────┬─────────────────────┐
//! │ hdr  │ payload │ hdr  │ free │ hdr  │ payload │ uncommitted         │
//! └──────┴─────────┴──────┴──────┴──────┴─────────┴─────────────────────┘
//! ▲ start                                         ▲ end      start+capacity ▲
//! ```
//!
//! # Features
//!
//! - First-fit allocation with block splitting
//! - Immediate coalescing of adjacent free blocks on release
//! - In-place resizing whenever the neighbouring blocks allow it
//! - A consistency check that detects overwritten headers and broken links
//! - A [`GlobalAlloc`](core::alloc::GlobalAlloc) wrapper, [`LockedHeap`]
//!
//! # Examples
//!
//! ```rust
//! use segment_heap::HeapManager;
//!
//! let mut segment = vec![0_u64; 512];
//! let mut heap = unsafe {
//!     HeapManager::new(segment.as_mut_ptr().cast(), segment.len() * size_of::<u64>())
//! }
//! .unwrap();
//!
//! let a = heap.allocate(100).unwrap();
//! let b = heap.allocate(200).unwrap();
//! unsafe { heap.release(a.as_ptr()) };
//!
//! // the freed block is reused for a request that fits
//! let c = heap.allocate(90).unwrap();
//! assert_eq!(c, a);
//!
//! let b = unsafe { heap.resize(b.as_ptr(), 400) }.unwrap();
//! assert!(heap.validate());
//! # unsafe {
//! #     heap.release(b.as_ptr());
//! #     heap.release(c.as_ptr());
//! # }
//! ```
//!
//! # Safety
//!
//! Memory handed to a heap must stay valid and exclusive to it for as long as
//! the heap serves it. Pointers passed to [`HeapManager::release`] and
//! [`HeapManager::resize`] must have come from the same heap and still be
//! live. Releasing a pointer twice corrupts the heap; this is detected by the
//! next [`HeapManager::check`] at the latest.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod check;
mod free_list;
mod inspect;
mod locked;
mod manager;
mod segment;

pub use self::{
    block::{
        ALIGNMENT, BlockStatus, HEADER_SIZE, Header, MIN_HEAP_SIZE, MIN_PAYLOAD, payload_size_for,
        round_up,
    },
    check::HeapCorruption,
    inspect::{BlockInfo, Blocks, HeapDump, HeapStats},
    locked::LockedHeap,
    manager::{HeapManager, InitError},
};
