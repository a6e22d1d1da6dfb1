//! Heap consistency check.
//!
//! The check walks every block from the segment start to the committed end
//! and then follows the free list from its head. It only reads memory inside
//! the committed region, so it is safe to run on a heap whose metadata has
//! been overwritten.

use snafu::{Snafu, ensure};

use crate::{
    HeapManager,
    block::{ALIGNMENT, BlockRef, HEADER_SIZE, Header, MIN_PAYLOAD},
    free_list::raw_links,
};

/// A broken heap invariant found by [`HeapManager::check`].
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum HeapCorruption {
    #[snafu(display("used more heap than available: used={used}, capacity={capacity}"))]
    OverCommitted { used: usize, capacity: usize },
    #[snafu(display("bytes overwritten: header at offset {offset:#x} holds {word:#x}"))]
    ReservedBits { offset: usize, word: usize },
    #[snafu(display(
        "block at offset {offset:#x} has a payload of {size} bytes, below the minimum of {minimum}"
    ))]
    UndersizedBlock {
        offset: usize,
        size: usize,
        minimum: usize,
    },
    #[snafu(display(
        "block at offset {offset:#x} with a payload of {size} bytes runs past the committed end {used:#x}"
    ))]
    BlockOverrun {
        offset: usize,
        size: usize,
        used: usize,
    },
    #[snafu(display("free blocks at offsets {offset:#x} and {next:#x} are adjacent"))]
    AdjacentFree { offset: usize, next: usize },
    #[snafu(display("free list node at offset {offset:#x} is outside the committed region"))]
    NodeOutOfBounds { offset: usize },
    #[snafu(display("free list node at offset {offset:#x} is marked allocated"))]
    NodeAllocated { offset: usize },
    #[snafu(display(
        "free list node at offset {offset:#x} links back to {found:?} instead of {expected:?}"
    ))]
    BrokenBackLink {
        offset: usize,
        expected: Option<usize>,
        found: Option<usize>,
    },
    #[snafu(display("free list tail is {tail:?} but the last node reached is {last:?}"))]
    TailMismatch {
        tail: Option<usize>,
        last: Option<usize>,
    },
    #[snafu(display("free list is longer than the {free_blocks} free blocks in the heap"))]
    ListTooLong { free_blocks: usize },
    #[snafu(display(
        "free list holds {listed} blocks ({listed_bytes} bytes) \
         but the heap has {walked} free blocks ({walked_bytes} bytes)"
    ))]
    FreeCountMismatch {
        listed: usize,
        listed_bytes: usize,
        walked: usize,
        walked_bytes: usize,
    },
}

impl HeapManager {
    /// Verifies the heap metadata.
    ///
    /// Checks that the committed size fits the segment, that every header is
    /// intact and the blocks tile the committed region, that no two free
    /// blocks are adjacent, and that the free list is a well-formed chain of
    /// exactly the free blocks.
    ///
    /// # Errors
    ///
    /// Returns the first broken invariant found.
    pub fn check(&self) -> Result<(), HeapCorruption> {
        let capacity = self.capacity();
        let used = self.used();
        ensure!(used <= capacity, OverCommittedSnafu { used, capacity });

        let segment = self.segment();
        let mut offset = 0;
        let mut prev_free = None;
        let mut walked = 0;
        let mut walked_bytes = 0;
        while offset < used {
            ensure!(
                offset + HEADER_SIZE <= used,
                BlockOverrunSnafu {
                    offset,
                    size: 0_usize,
                    used
                }
            );
            let word = segment.read_word(offset);
            ensure!(
                Header::reserved_bits(word) == 0,
                ReservedBitsSnafu { offset, word }
            );
            let header = Header::decode(word);
            ensure!(
                header.size >= MIN_PAYLOAD,
                UndersizedBlockSnafu {
                    offset,
                    size: header.size,
                    minimum: MIN_PAYLOAD,
                }
            );
            let end = BlockRef::at(offset)
                .payload_offset()
                .checked_add(header.size)
                .filter(|&end| end <= used);
            let Some(end) = end else {
                return BlockOverrunSnafu {
                    offset,
                    size: header.size,
                    used,
                }
                .fail();
            };

            if header.status.is_free() {
                if let Some(prev) = prev_free {
                    return AdjacentFreeSnafu { offset: prev, next: offset }.fail();
                }
                prev_free = Some(offset);
                walked += 1;
                walked_bytes += header.size;
            } else {
                prev_free = None;
            }
            offset = end;
        }

        self.check_free_list(walked, walked_bytes)
    }

    fn check_free_list(&self, walked: usize, walked_bytes: usize) -> Result<(), HeapCorruption> {
        let segment = self.segment();
        let used = self.used();
        let mut listed = 0;
        let mut listed_bytes = 0_usize;
        let mut last = None;
        let mut current = self.free_list().head().map(BlockRef::offset);
        while let Some(offset) = current {
            ensure!(listed < walked, ListTooLongSnafu { free_blocks: walked });
            ensure!(
                offset.is_multiple_of(ALIGNMENT),
                NodeOutOfBoundsSnafu { offset }
            );
            let Some((prev, next)) = raw_links(segment, offset, used) else {
                return NodeOutOfBoundsSnafu { offset }.fail();
            };
            let header = Header::decode(segment.read_word(offset));
            ensure!(header.status.is_free(), NodeAllocatedSnafu { offset });
            ensure!(
                prev == last,
                BrokenBackLinkSnafu {
                    offset,
                    expected: last,
                    found: prev,
                }
            );
            listed += 1;
            listed_bytes = listed_bytes.saturating_add(header.size);
            last = Some(offset);
            current = next;
        }

        let tail = self.free_list().tail().map(BlockRef::offset);
        ensure!(tail == last, TailMismatchSnafu { tail, last });
        ensure!(
            listed == walked && listed_bytes == walked_bytes,
            FreeCountMismatchSnafu {
                listed,
                listed_bytes,
                walked,
                walked_bytes,
            }
        );
        Ok(())
    }

    /// Runs [`check`](Self::check) and reports the outcome as a boolean.
    ///
    /// A failure is logged at `error` level together with a heap dump.
    #[must_use]
    pub fn validate(&self) -> bool {
        match self.check() {
            Ok(()) => true,
            Err(err) => {
                log::error!("heap consistency check failed: {err}");
                log::debug!("{}", self.dump());
                false
            }
        }
    }
}
