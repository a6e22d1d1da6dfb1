//! Raw access to the managed memory segment.
//!
//! Every read or write of heap metadata goes through [`Segment`]. The rest of
//! the crate works on byte offsets from the segment start, and the primitives
//! here turn those offsets into pointers after checking them against the
//! segment capacity. This keeps all `unsafe` memory access in one place.
//!
//! ```text
//! base                                                    base + capacity
//! ┌──────┬─────────┬──────┬──────────────┬───────────────────────────┐
//! │ hdr  │ payload │ hdr  │ payload      │   uncommitted             │
//! └──────┴─────────┴──────┴──────────────┴───────────────────────────┘
//! 0      8                               used
//! ```

use core::ptr::{self, NonNull};

const WORD: usize = size_of::<usize>();

/// A contiguous byte region handed to the allocator by its owner.
#[derive(Debug)]
pub(crate) struct Segment {
    base: NonNull<u8>,
    capacity: usize,
}

impl Segment {
    /// Returns a segment of zero capacity that cannot be read or written.
    pub(crate) const fn dangling() -> Self {
        Self {
            base: NonNull::dangling(),
            capacity: 0,
        }
    }

    /// Creates a segment covering `base..base + capacity`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base..base + capacity` is valid for reads and writes
    /// - the region is not used by anything else while the segment is alive
    /// - `base` is aligned to `usize`
    pub(crate) unsafe fn new(base: NonNull<u8>, capacity: usize) -> Self {
        assert!(
            base.cast::<usize>().is_aligned(),
            "segment base must be word aligned"
        );
        Self { base, capacity }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if `offset..offset + len` lies inside the segment.
    pub(crate) fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.capacity)
    }

    fn word_ptr(&self, offset: usize) -> NonNull<usize> {
        assert!(
            offset.is_multiple_of(WORD),
            "unaligned word offset {offset:#x}"
        );
        assert!(
            self.contains(offset, WORD),
            "word offset {offset:#x} outside segment of {} bytes",
            self.capacity
        );
        // in bounds: checked above
        unsafe { self.base.add(offset) }.cast()
    }

    /// Reads the machine word stored at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not word aligned or the word does not fit inside
    /// the segment.
    pub(crate) fn read_word(&self, offset: usize) -> usize {
        let ptr = self.word_ptr(offset);
        unsafe { ptr.read() }
    }

    /// Writes a machine word at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not word aligned or the word does not fit inside
    /// the segment.
    pub(crate) fn write_word(&mut self, offset: usize, value: usize) {
        let ptr = self.word_ptr(offset);
        unsafe { ptr.write(value) }
    }

    /// Returns a pointer to the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of the segment.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset <= self.capacity,
            "offset {offset:#x} outside segment of {} bytes",
            self.capacity
        );
        unsafe { self.base.add(offset) }
    }

    /// Translates a pointer into the segment back into an offset.
    ///
    /// Returns `None` if `ptr` does not point inside the segment.
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr.addr().get().checked_sub(self.base.addr().get())?;
        (offset < self.capacity).then_some(offset)
    }

    /// Copies `len` bytes from `src` to `dst`, both offsets into the segment.
    ///
    /// The ranges may overlap.
    ///
    /// # Panics
    ///
    /// Panics if either range is not inside the segment.
    pub(crate) fn copy(&mut self, src: usize, dst: usize, len: usize) {
        assert!(self.contains(src, len), "copy source out of bounds");
        assert!(self.contains(dst, len), "copy destination out of bounds");
        unsafe {
            ptr::copy(
                self.base.add(src).as_ptr(),
                self.base.add(dst).as_ptr(),
                len,
            );
        }
    }
}
