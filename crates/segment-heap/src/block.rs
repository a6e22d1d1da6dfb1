//! Block layout.
//!
//! The segment is tiled by blocks. Each block starts with a one-word header
//! followed by its payload:
//!
//! ```text
//! ┌───────────────────────────────┬──────────────────────────────┐
//! │ header (1 word)               │ payload (size bytes)         │
//! │ ┌───────────────────────┬───┐ │                              │
//! │ │ size (low bits zero)  │ A │ │                              │
//! │ └───────────────────────┴───┘ │                              │
//! └───────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The payload size is always a multiple of [`ALIGNMENT`], so its low bits are
//! free. Bit 0 (`A`) holds the allocation status; the remaining low bits are
//! reserved and must stay zero. [`Header`] is the only place that knows about
//! this packing.

use core::fmt;

use crate::segment::Segment;

/// Payload alignment in bytes. Every payload size is a multiple of this.
pub const ALIGNMENT: usize = size_of::<usize>();

/// Size of the header that precedes every payload.
pub const HEADER_SIZE: usize = size_of::<usize>();

/// Smallest payload a block may have: enough room for the two free-list links.
pub const MIN_PAYLOAD: usize = 2 * size_of::<usize>();

/// Smallest segment that can hold a single block.
pub const MIN_HEAP_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;

const STATUS_BIT: usize = 1;
const LOW_BITS: usize = ALIGNMENT - 1;
const RESERVED_BITS: usize = LOW_BITS & !STATUS_BIT;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT > STATUS_BIT);

/// Allocation status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::IsVariant)]
pub enum BlockStatus {
    /// The block is on the free list.
    #[display("free")]
    Free,
    /// The block's payload belongs to a caller.
    #[display("allocated")]
    Allocated,
}

/// Decoded form of a block header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    /// Payload size in bytes, excluding the header.
    pub size: usize,
    /// Allocation status.
    pub status: BlockStatus,
}

impl Header {
    #[must_use]
    pub const fn free(size: usize) -> Self {
        Self {
            size,
            status: BlockStatus::Free,
        }
    }

    #[must_use]
    pub const fn allocated(size: usize) -> Self {
        Self {
            size,
            status: BlockStatus::Allocated,
        }
    }

    /// Returns the same header with a different status.
    #[must_use]
    pub const fn with_status(self, status: BlockStatus) -> Self {
        Self {
            size: self.size,
            status,
        }
    }

    /// Packs the header into a single word.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`ALIGNMENT`].
    #[must_use]
    pub fn encode(self) -> usize {
        assert!(
            self.size & LOW_BITS == 0,
            "block size {} is not a multiple of {ALIGNMENT}",
            self.size
        );
        match self.status {
            BlockStatus::Free => self.size,
            BlockStatus::Allocated => self.size | STATUS_BIT,
        }
    }

    /// Unpacks a header word. Reserved bits are ignored; see
    /// [`Header::reserved_bits`].
    #[must_use]
    pub const fn decode(word: usize) -> Self {
        let status = if word & STATUS_BIT == 0 {
            BlockStatus::Free
        } else {
            BlockStatus::Allocated
        };
        Self {
            size: word & !LOW_BITS,
            status,
        }
    }

    /// Returns the reserved bits of a header word. Nonzero means the header
    /// has been overwritten.
    #[must_use]
    pub const fn reserved_bits(word: usize) -> usize {
        word & RESERVED_BITS
    }
}

/// Rounds `size` up to the next multiple of `align`, which must be a power of
/// two. Returns `None` on overflow.
#[must_use]
pub const fn round_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Computes the payload size used to satisfy a request of `requested` bytes.
///
/// The request is rounded up to [`ALIGNMENT`] and then raised to
/// [`MIN_PAYLOAD`] if it is still smaller.
#[must_use]
pub const fn payload_size_for(requested: usize) -> Option<usize> {
    match round_up(requested, ALIGNMENT) {
        Some(size) if size < MIN_PAYLOAD => Some(MIN_PAYLOAD),
        other => other,
    }
}

/// A block, identified by the segment offset of its header.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockRef(usize);

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRef({:#x})", self.0)
    }
}

impl BlockRef {
    pub(crate) const fn at(offset: usize) -> Self {
        Self(offset)
    }

    /// Returns the block whose payload starts at `payload_offset`.
    pub(crate) fn from_payload(payload_offset: usize) -> Self {
        assert!(
            payload_offset >= HEADER_SIZE,
            "payload offset {payload_offset:#x} has no room for a header"
        );
        Self(payload_offset - HEADER_SIZE)
    }

    pub(crate) const fn offset(self) -> usize {
        self.0
    }

    pub(crate) const fn payload_offset(self) -> usize {
        self.0 + HEADER_SIZE
    }

    /// Offset just past the payload, assuming a payload of `size` bytes. This
    /// is where the next block by address starts.
    pub(crate) const fn end_offset(self, size: usize) -> usize {
        self.0 + HEADER_SIZE + size
    }

    pub(crate) fn header(self, segment: &Segment) -> Header {
        Header::decode(segment.read_word(self.0))
    }

    pub(crate) fn set_header(self, segment: &mut Segment, header: Header) {
        segment.write_word(self.0, header.encode());
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let word = Header::allocated(48).encode();
        assert_eq!(word, 48 | 1);
        assert_eq!(Header::decode(word), Header::allocated(48));

        let word = Header::free(48).encode();
        assert_eq!(word, 48);
        assert_eq!(Header::decode(word), Header::free(48));
    }

    #[test]
    #[should_panic(expected = "is not a multiple")]
    fn test_header_rejects_unaligned_size() {
        let _ = Header::free(ALIGNMENT + 1).encode();
    }

    #[test]
    fn test_reserved_bits() {
        assert_eq!(Header::reserved_bits(Header::allocated(64).encode()), 0);
        assert_eq!(Header::reserved_bits(Header::free(64).encode()), 0);
        if ALIGNMENT > 2 {
            assert_ne!(Header::reserved_bits(64 | 2), 0);
            // the size still decodes without the stray bit
            assert_eq!(Header::decode(64 | 2).size, 64);
        }
    }

    #[test]
    fn test_status_variants() {
        assert!(Header::decode(16).status.is_free());
        assert!(Header::decode(16 | 1).status.is_allocated());
        assert_eq!(Header::free(16).with_status(BlockStatus::Allocated), Header::allocated(16));
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), Some(0));
        assert_eq!(round_up(1, 8), Some(8));
        assert_eq!(round_up(8, 8), Some(8));
        assert_eq!(round_up(13, 8), Some(16));
        assert_eq!(round_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_payload_size_for() {
        assert_eq!(payload_size_for(1), Some(MIN_PAYLOAD));
        assert_eq!(payload_size_for(MIN_PAYLOAD), Some(MIN_PAYLOAD));
        assert_eq!(payload_size_for(MIN_PAYLOAD + 1), Some(MIN_PAYLOAD + ALIGNMENT));
        assert_eq!(payload_size_for(100), round_up(100, ALIGNMENT));
        assert_eq!(payload_size_for(usize::MAX), None);
    }

    #[test]
    fn test_block_ref_offsets() {
        let block = BlockRef::from_payload(HEADER_SIZE + 32);
        assert_eq!(block.offset(), 32);
        assert_eq!(block.payload_offset(), 32 + HEADER_SIZE);
        assert_eq!(block.end_offset(16), 32 + HEADER_SIZE + 16);
        assert_eq!(BlockRef::at(32), block);
    }
}
