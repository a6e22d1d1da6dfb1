//! Intrusive doubly linked list of free blocks.
//!
//! The nodes of the list are the free blocks themselves. The first payload
//! word of a free block holds the offset of the previous free block and the
//! second payload word the offset of the next one:
//!
//! ```text
//! Free block:
//! ┌────────┬──────────────┬──────────────┬────────────────────┐
//! │ header │ prev offset  │ next offset  │ unused             │
//! └────────┴──────────────┴──────────────┴────────────────────┘
//! ```
//!
//! A missing neighbour is stored as [`NIL`]. The list owns no memory of its
//! own; it only remembers the head and tail blocks.

use crate::{
    block::{BlockRef, HEADER_SIZE},
    segment::Segment,
};

/// Link value meaning "no block".
const NIL: usize = usize::MAX;

const PREV_LINK: usize = 0;
const NEXT_LINK: usize = size_of::<usize>();

fn decode_link(word: usize) -> Option<BlockRef> {
    (word != NIL).then(|| BlockRef::at(word))
}

fn encode_link(block: Option<BlockRef>) -> usize {
    block.map_or(NIL, BlockRef::offset)
}

impl BlockRef {
    pub(crate) fn prev_free(self, segment: &Segment) -> Option<Self> {
        decode_link(segment.read_word(self.payload_offset() + PREV_LINK))
    }

    pub(crate) fn next_free(self, segment: &Segment) -> Option<Self> {
        decode_link(segment.read_word(self.payload_offset() + NEXT_LINK))
    }

    fn set_prev_free(self, segment: &mut Segment, prev: Option<Self>) {
        segment.write_word(self.payload_offset() + PREV_LINK, encode_link(prev));
    }

    fn set_next_free(self, segment: &mut Segment, next: Option<Self>) {
        segment.write_word(self.payload_offset() + NEXT_LINK, encode_link(next));
    }
}

/// Reads the link words of the block at `offset` without trusting them.
///
/// Returns `None` if the link words do not fit inside the first `limit` bytes
/// of the segment.
pub(crate) fn raw_links(
    segment: &Segment,
    offset: usize,
    limit: usize,
) -> Option<(Option<usize>, Option<usize>)> {
    let links = offset.checked_add(HEADER_SIZE)?;
    let links_end = links.checked_add(2 * size_of::<usize>())?;
    if links_end > limit || !segment.contains(links, 2 * size_of::<usize>()) {
        return None;
    }
    let prev = segment.read_word(links + PREV_LINK);
    let next = segment.read_word(links + NEXT_LINK);
    Some(((prev != NIL).then_some(prev), (next != NIL).then_some(next)))
}

/// Head and tail of the free list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeList {
    head: Option<BlockRef>,
    tail: Option<BlockRef>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub(crate) fn head(&self) -> Option<BlockRef> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<BlockRef> {
        self.tail
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `block` at the tail of the list.
    ///
    /// The block must not already be linked. Its link words are overwritten.
    pub(crate) fn push_back(&mut self, segment: &mut Segment, block: BlockRef) {
        block.set_prev_free(segment, self.tail);
        block.set_next_free(segment, None);
        match self.tail {
            Some(tail) => tail.set_next_free(segment, Some(block)),
            None => self.head = Some(block),
        }
        self.tail = Some(block);
    }

    /// Removes `block` from the list, joining its neighbours.
    ///
    /// The block must currently be linked.
    pub(crate) fn unlink(&mut self, segment: &mut Segment, block: BlockRef) {
        let prev = block.prev_free(segment);
        let next = block.next_free(segment);
        match prev {
            Some(prev) => prev.set_next_free(segment, next),
            None => {
                assert_eq!(self.head, Some(block), "unlinked node is not the head");
                self.head = next;
            }
        }
        match next {
            Some(next) => next.set_prev_free(segment, prev),
            None => {
                assert_eq!(self.tail, Some(block), "unlinked node is not the tail");
                self.tail = prev;
            }
        }
    }

    /// Iterates over the free blocks from head to tail.
    pub(crate) fn iter<'a>(&self, segment: &'a Segment) -> Iter<'a> {
        Iter {
            segment,
            next: self.head,
        }
    }
}

pub(crate) struct Iter<'a> {
    segment: &'a Segment,
    next: Option<BlockRef>,
}

impl Iterator for Iter<'_> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next_free(self.segment);
        Some(current)
    }
}
