//! The heap manager.
//!
//! [`HeapManager`] owns one memory segment and carves it into blocks on
//! demand. Blocks are committed from the start of the segment upwards; the
//! committed prefix is tiled by blocks without gaps:
//!
//! ```text
//! start                                   end = start + used    start + capacity
//! ┌───────────┬──────┬───────────┬───────┬──────────────────────┐
//! │ allocated │ free │ allocated │ free  │ uncommitted          │
//! └───────────┴──────┴───────────┴───────┴──────────────────────┘
//!               ▲                  ▲
//!               └── free list ─────┘
//! ```
//!
//! # Algorithm
//!
//! - **Allocation**: first-fit search of the free list in list order. A block
//!   that is larger than needed is split and the remainder goes back to the
//!   tail of the list. When nothing fits, a new block is bump-allocated at the
//!   end of the committed region.
//! - **Release**: the block absorbs every free block that directly follows it,
//!   then is merged into a free block that directly precedes it, or appended
//!   to the free list if there is none. No two free blocks are ever adjacent.
//! - **Resize**: shrinking splits the tail off in place. Growing absorbs
//!   following free blocks, extends the committed region when the block is the
//!   last one, and otherwise moves the payload to a new block.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) where n is the number of free blocks
//! - **Release**: O(n) for the search of a free left neighbour
//! - **Memory Overhead**: one word per block

use core::{cmp::Ordering, ptr::NonNull};

use snafu::{OptionExt as _, Snafu, ensure};

use crate::{
    block::{
        ALIGNMENT, BlockRef, BlockStatus, HEADER_SIZE, Header, MIN_HEAP_SIZE, MIN_PAYLOAD,
        payload_size_for,
    },
    free_list::FreeList,
    segment::Segment,
};

/// Error returned when a heap cannot be set up on the given region.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum InitError {
    #[snafu(display("heap segment base address is null"))]
    NullBase,
    #[snafu(display(
        "heap segment of {capacity} bytes is smaller than the minimum of {minimum} bytes"
    ))]
    TooSmall { capacity: usize, minimum: usize },
}

/// Result of planning an in-place growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    /// The free blocks that follow provide enough room.
    InPlace,
    /// The free blocks that follow run up to the end of the committed region,
    /// giving a payload of `reach` bytes.
    AtEnd { reach: usize },
    /// An allocated block is in the way.
    Blocked,
}

/// An explicit free-list allocator over a single memory segment.
///
/// All bookkeeping lives inside the segment: every block carries a one-word
/// header and free blocks double as the nodes of a doubly linked free list.
/// The manager itself only remembers the segment bounds, the number of
/// committed bytes and the ends of the free list.
///
/// # Thread Safety
///
/// The manager is `Send` but not `Sync`. Wrap it in a
/// [`LockedHeap`](crate::LockedHeap) to share it between threads.
pub struct HeapManager {
    segment: Segment,
    used: usize,
    free_list: FreeList,
}

unsafe impl Send for HeapManager {}

impl Default for HeapManager {
    fn default() -> Self {
        Self::empty()
    }
}

impl HeapManager {
    /// Creates a manager without a segment.
    ///
    /// Every allocation fails until [`init`](Self::init) is called.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            segment: Segment::dangling(),
            used: 0,
            free_list: FreeList::new(),
        }
    }

    /// Creates a manager for the region `base..base + capacity`.
    ///
    /// See [`init`](Self::init) for the requirements on the region.
    ///
    /// # Safety
    ///
    /// Same as [`init`](Self::init).
    pub unsafe fn new(base: *mut u8, capacity: usize) -> Result<Self, InitError> {
        let mut heap = Self::empty();
        unsafe { heap.init(base, capacity)? };
        Ok(heap)
    }

    /// Resets the manager to serve the region `base..base + capacity`.
    ///
    /// If `base` is not aligned to [`ALIGNMENT`] it is moved forward to the
    /// next aligned address and the capacity shrinks by the same amount. All
    /// previous state is discarded: pointers handed out before this call must
    /// not be used with this manager again.
    ///
    /// # Errors
    ///
    /// Fails if `base` is null or the aligned region is smaller than
    /// [`MIN_HEAP_SIZE`](crate::MIN_HEAP_SIZE).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the given range `base..base + capacity` is valid for reads and writes
    /// - the region is not used by any other allocator or code
    /// - the region stays valid for as long as this manager serves it
    pub unsafe fn init(&mut self, base: *mut u8, capacity: usize) -> Result<(), InitError> {
        let base = NonNull::new(base).context(NullBaseSnafu)?;
        let align_offset = base.align_offset(ALIGNMENT);
        let aligned_capacity = capacity.saturating_sub(align_offset);
        ensure!(
            aligned_capacity >= MIN_HEAP_SIZE,
            TooSmallSnafu {
                capacity,
                minimum: MIN_HEAP_SIZE,
            }
        );

        let aligned_base = unsafe { base.add(align_offset) };
        self.segment = unsafe { Segment::new(aligned_base, aligned_capacity) };
        self.used = 0;
        self.free_list = FreeList::new();

        log::debug!(
            "HeapManager::init({:p}, {capacity}) -> {aligned_base:p}, {aligned_capacity} bytes",
            base
        );
        Ok(())
    }

    /// Returns the number of bytes the segment can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    /// Returns the number of bytes committed to blocks, headers included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the first byte of the segment.
    #[must_use]
    pub fn start(&self) -> NonNull<u8> {
        self.segment.base()
    }

    /// Returns the address one past the last committed block.
    #[must_use]
    pub fn end(&self) -> NonNull<u8> {
        self.segment.ptr_at(self.used)
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.segment
    }

    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Allocates a block with room for at least `size` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`]. Returns `None` if
    /// `size` is zero or neither a free block nor the uncommitted part of the
    /// segment can hold the request.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self
            .allocate_block(size)
            .map(|block| self.segment.ptr_at(block.payload_offset()));
        match ptr {
            Some(ptr) => log::trace!("HeapManager::allocate({size}) -> {ptr:p}"),
            None => log::trace!("HeapManager::allocate({size}) -> null"),
        }
        ptr
    }

    /// Releases a block returned by [`allocate`](Self::allocate) or
    /// [`resize`](Self::resize). A null pointer is ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` is null or was returned by this
    /// manager since its last initialization and has not been released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        log::trace!("HeapManager::release({ptr:p})");
        let block = self.block_of(ptr);
        self.free_block(block);
    }

    /// Changes the size of the block at `ptr` to at least `new_size` bytes.
    ///
    /// - A null `ptr` behaves like [`allocate`](Self::allocate).
    /// - A `new_size` of zero releases the block and returns `None`.
    /// - Otherwise the block is resized in place when possible, or its payload
    ///   is moved to a new block and the old block is released.
    ///
    /// A `None` result for a nonzero `new_size` means the segment is exhausted;
    /// the original block is then left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release).
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            unsafe { self.release(ptr.as_ptr()) };
            return None;
        }

        let block = self.block_of(ptr);
        let current = block.header(&self.segment).size;
        let needed = payload_size_for(new_size)?;
        let resized = match needed.cmp(&current) {
            Ordering::Equal => Some(ptr),
            Ordering::Less => {
                self.split(block, needed);
                Some(ptr)
            }
            Ordering::Greater => self.grow(block, current, needed, new_size),
        };
        match resized {
            Some(new_ptr) => log::trace!("HeapManager::resize({ptr:p}, {new_size}) -> {new_ptr:p}"),
            None => log::trace!("HeapManager::resize({ptr:p}, {new_size}) -> null"),
        }
        resized
    }

    /// Returns the payload size of the allocated block at `ptr`, including
    /// any padding absorbed into it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer returned by this manager.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.block_of(ptr).header(&self.segment).size
    }

    fn block_of(&self, ptr: NonNull<u8>) -> BlockRef {
        let Some(offset) = self.segment.offset_of(ptr) else {
            panic!("pointer {ptr:p} does not belong to this heap");
        };
        BlockRef::from_payload(offset)
    }

    /// Returns the block that follows a block with a payload of `size` bytes,
    /// or `None` if that position is the end of the committed region.
    fn successor(&self, block: BlockRef, size: usize) -> Option<BlockRef> {
        let next = block.end_offset(size);
        (next < self.used).then_some(BlockRef::at(next))
    }

    fn allocate_block(&mut self, size: usize) -> Option<BlockRef> {
        if size == 0 {
            return None;
        }
        let needed = payload_size_for(size)?;

        if let Some(block) = self.first_fit(needed) {
            self.free_list.unlink(&mut self.segment, block);
            let header = block.header(&self.segment);
            block.set_header(
                &mut self.segment,
                header.with_status(BlockStatus::Allocated),
            );
            self.split(block, needed);
            return Some(block);
        }

        self.bump(needed)
    }

    fn first_fit(&self, needed: usize) -> Option<BlockRef> {
        self.free_list
            .iter(&self.segment)
            .find(|block| block.header(&self.segment).size >= needed)
    }

    /// Commits a new allocated block at the end of the committed region.
    fn bump(&mut self, needed: usize) -> Option<BlockRef> {
        let new_used = self.used.checked_add(HEADER_SIZE)?.checked_add(needed)?;
        if new_used > self.segment.capacity() {
            return None;
        }
        let block = BlockRef::at(self.used);
        block.set_header(&mut self.segment, Header::allocated(needed));
        self.used = new_used;
        Some(block)
    }

    /// Cuts `block` down to `needed` payload bytes if the leftover can stand
    /// on its own as a free block, and hands the leftover to the free list.
    /// A smaller leftover stays in `block` as padding.
    fn split(&mut self, block: BlockRef, needed: usize) {
        let header = block.header(&self.segment);
        let leftover = header.size - needed;
        if leftover < HEADER_SIZE + MIN_PAYLOAD {
            return;
        }

        block.set_header(
            &mut self.segment,
            Header {
                size: needed,
                status: header.status,
            },
        );
        let remainder = BlockRef::at(block.end_offset(needed));
        remainder.set_header(&mut self.segment, Header::free(leftover - HEADER_SIZE));
        self.absorb_free_successors(remainder, None);
        self.free_list.push_back(&mut self.segment, remainder);
    }

    /// Merges the free blocks directly following `block` into it, keeping the
    /// status of `block`. Stops at an allocated block, at the end of the
    /// committed region, or once the payload reaches `limit` bytes.
    ///
    /// Returns the new payload size of `block`.
    fn absorb_free_successors(&mut self, block: BlockRef, limit: Option<usize>) -> usize {
        let mut header = block.header(&self.segment);
        while limit.is_none_or(|limit| header.size < limit) {
            let Some(next) = self.successor(block, header.size) else {
                break;
            };
            let next_header = next.header(&self.segment);
            if next_header.status.is_allocated() {
                break;
            }
            self.free_list.unlink(&mut self.segment, next);
            header.size += HEADER_SIZE + next_header.size;
            block.set_header(&mut self.segment, header);
        }
        header.size
    }

    /// Returns the free block that ends exactly where `block` starts.
    fn free_predecessor(&self, block: BlockRef) -> Option<BlockRef> {
        self.free_list
            .iter(&self.segment)
            .find(|free| free.end_offset(free.header(&self.segment).size) == block.offset())
    }

    fn free_block(&mut self, block: BlockRef) {
        let header = block.header(&self.segment);
        block.set_header(&mut self.segment, header.with_status(BlockStatus::Free));
        let size = self.absorb_free_successors(block, None);

        if let Some(left) = self.free_predecessor(block) {
            let left_size = left.header(&self.segment).size;
            left.set_header(
                &mut self.segment,
                Header::free(left_size + HEADER_SIZE + size),
            );
        } else {
            self.free_list.push_back(&mut self.segment, block);
        }
    }

    /// Looks at the blocks after `block` to decide how it can grow to
    /// `needed` bytes. Does not modify the heap.
    fn plan_growth(&self, block: BlockRef, current: usize, needed: usize) -> Growth {
        let mut reach = current;
        loop {
            if reach >= needed {
                return Growth::InPlace;
            }
            let Some(next) = self.successor(block, reach) else {
                return Growth::AtEnd { reach };
            };
            let header = next.header(&self.segment);
            if header.status.is_allocated() {
                return Growth::Blocked;
            }
            reach += HEADER_SIZE + header.size;
        }
    }

    fn grow(
        &mut self,
        block: BlockRef,
        current: usize,
        needed: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        match self.plan_growth(block, current, needed) {
            Growth::InPlace => {
                self.absorb_free_successors(block, Some(needed));
                self.split(block, needed);
                Some(self.segment.ptr_at(block.payload_offset()))
            }
            Growth::AtEnd { reach } => {
                let new_used = self.used.checked_add(needed - reach)?;
                if new_used > self.segment.capacity() {
                    return None;
                }
                self.absorb_free_successors(block, None);
                block.set_header(&mut self.segment, Header::allocated(needed));
                self.used = new_used;
                Some(self.segment.ptr_at(block.payload_offset()))
            }
            Growth::Blocked => {
                let moved = self.allocate_block(new_size)?;
                self.segment.copy(
                    block.payload_offset(),
                    moved.payload_offset(),
                    current.min(needed),
                );
                self.free_block(block);
                Some(self.segment.ptr_at(moved.payload_offset()))
            }
        }
    }
}
