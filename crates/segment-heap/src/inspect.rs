//! Read-only views of a heap: a block walk, summary statistics and a
//! printable dump.

use core::{fmt, ptr::NonNull};

use crate::{
    HeapManager,
    block::{BlockRef, BlockStatus, HEADER_SIZE},
};

/// One block found by walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the segment start.
    pub offset: usize,
    /// First payload byte.
    pub payload: NonNull<u8>,
    /// Payload size in bytes.
    pub size: usize,
    pub status: BlockStatus,
}

/// Iterator over the blocks of a heap in address order.
///
/// Created by [`HeapManager::blocks`]. The walk stops early rather than read
/// outside the committed region if a header has been overwritten.
pub struct Blocks<'a> {
    heap: &'a HeapManager,
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let segment = self.heap.segment();
        let used = self.heap.used();
        if self.offset >= used || !segment.contains(self.offset, HEADER_SIZE) {
            return None;
        }
        let block = BlockRef::at(self.offset);
        let header = block.header(segment);
        self.offset = block
            .payload_offset()
            .checked_add(header.size)
            .unwrap_or(usize::MAX);
        Some(BlockInfo {
            offset: block.offset(),
            payload: segment.ptr_at(block.payload_offset()),
            size: header.size,
            status: header.status,
        })
    }
}

/// Block and byte counts of a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub used: usize,
    pub allocated_blocks: usize,
    /// Payload bytes of allocated blocks, padding included.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

impl HeapStats {
    /// Bytes taken by block headers.
    #[must_use]
    pub fn header_bytes(&self) -> usize {
        (self.allocated_blocks + self.free_blocks) * HEADER_SIZE
    }

    /// Bytes never committed to any block.
    #[must_use]
    pub fn uncommitted_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }
}

/// Printable listing of every block, see [`HeapManager::dump`].
pub struct HeapDump<'a> {
    heap: &'a HeapManager,
}

impl fmt::Display for HeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;
        let limit = heap.segment().ptr_at(heap.capacity());
        write!(
            f,
            "Heap segment starts at address {:p}, ends at {limit:p}. {} bytes currently used.",
            heap.start(),
            heap.used()
        )?;
        for block in heap.blocks() {
            write!(
                f,
                "\n{:p} size={} {}",
                block.payload, block.size, block.status
            )?;
        }
        Ok(())
    }
}

impl HeapManager {
    /// Walks all committed blocks in address order.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            offset: 0,
        }
    }

    /// Counts blocks and bytes by status.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(
            HeapStats {
                capacity: self.capacity(),
                used: self.used(),
                ..HeapStats::default()
            },
            |mut stats, block| {
                match block.status {
                    BlockStatus::Free => {
                        stats.free_blocks += 1;
                        stats.free_bytes += block.size;
                    }
                    BlockStatus::Allocated => {
                        stats.allocated_blocks += 1;
                        stats.allocated_bytes += block.size;
                    }
                }
                stats
            },
        )
    }

    /// Returns a value that prints the segment bounds and one line per block.
    ///
    /// Meant for debugging sessions, e.g. `log::debug!("{}", heap.dump())`.
    #[must_use]
    pub fn dump(&self) -> HeapDump<'_> {
        HeapDump { heap: self }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MIN_PAYLOAD, payload_size_for};

    #[test]
    fn test_blocks_and_stats() {
        let mut buf = [0_usize; 64];
        let mut heap =
            unsafe { HeapManager::new(buf.as_mut_ptr().cast(), size_of_val(&buf)) }.unwrap();
        let a = heap.allocate(10).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(1).unwrap();
        unsafe { heap.release(b.as_ptr()) };

        let blocks = heap.blocks().collect::<Vec<_>>();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].payload, a);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].payload, b);
        assert!(blocks[1].status.is_free());
        assert_eq!(blocks[2].payload, c);

        let big = payload_size_for(100).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 2);
        assert_eq!(stats.allocated_bytes, 2 * MIN_PAYLOAD);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, big);
        assert_eq!(stats.header_bytes(), 3 * HEADER_SIZE);
        assert_eq!(
            stats.header_bytes() + stats.allocated_bytes + stats.free_bytes,
            stats.used
        );
        assert_eq!(stats.uncommitted_bytes(), size_of_val(&buf) - stats.used);
    }

    #[test]
    fn test_blocks_stop_at_overrun() {
        let mut buf = [0_usize; 16];
        let mut heap =
            unsafe { HeapManager::new(buf.as_mut_ptr().cast(), size_of_val(&buf)) }.unwrap();
        let a = heap.allocate(16).unwrap();
        // overwrite the header with a size far past the committed end
        unsafe { a.cast::<usize>().sub(1).write(0x1000 | 1) };
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn test_dump() {
        let mut buf = [0_usize; 32];
        let mut heap =
            unsafe { HeapManager::new(buf.as_mut_ptr().cast(), size_of_val(&buf)) }.unwrap();
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        unsafe { heap.release(a.as_ptr()) };

        let dump = heap.dump().to_string();
        let lines = dump.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains(&format!("{} bytes currently used", heap.used())));
        assert_eq!(lines[1], format!("{a:p} size={MIN_PAYLOAD} free"));
        assert_eq!(lines[2], format!("{b:p} size={MIN_PAYLOAD} allocated"));
    }
}
