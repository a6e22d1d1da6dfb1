//! Replays a script against a fresh heap and checks every result.

use std::{
    alloc::{self, Layout, LayoutError},
    collections::BTreeMap,
    ptr::NonNull,
};

use segment_heap::{ALIGNMENT, HeapCorruption, HeapManager, InitError};
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

use crate::script::{Op, Step};

/// Alignment of the backing memory.
const ARENA_ALIGN: usize = 16;

#[derive(Debug, Snafu)]
pub enum ReplayError {
    #[snafu(display("invalid segment size {size}"))]
    ArenaLayout {
        #[snafu(implicit)]
        location: snafu::Location,
        size: usize,
        #[snafu(source)]
        source: LayoutError,
    },
    #[snafu(display("failed to reserve {size} bytes of backing memory"))]
    ArenaAlloc {
        #[snafu(implicit)]
        location: snafu::Location,
        size: usize,
    },
    #[snafu(display("failed to initialize heap"))]
    Init {
        #[snafu(implicit)]
        location: snafu::Location,
        #[snafu(source)]
        source: InitError,
    },
    #[snafu(display("line {line}: heap exhausted, id={id}, size={size}"))]
    Exhausted {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
        size: usize,
    },
    #[snafu(display("line {line}: payload {addr:#x} of block {id} is not aligned to {ALIGNMENT}"))]
    Misaligned {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
        addr: usize,
    },
    #[snafu(display(
        "line {line}: payload {addr:#x} with {size} bytes of block {id} lies outside the segment"
    ))]
    OutsideSegment {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
        addr: usize,
        size: usize,
    },
    #[snafu(display("line {line}: payload of block {id} overlaps block {other}"))]
    Overlap {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
        other: usize,
    },
    #[snafu(display("line {line}: payload of block {id} was overwritten at byte {offset}"))]
    Corrupted {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
        offset: usize,
    },
    #[snafu(display("line {line}: heap is inconsistent"))]
    Inconsistent {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        #[snafu(source)]
        source: HeapCorruption,
    },
    #[snafu(display("line {line}: block {id} is not live"))]
    UnknownId {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
    },
    #[snafu(display("line {line}: block {id} is already live"))]
    DuplicateId {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        id: usize,
    },
}

/// Zeroed memory from the global allocator, freed on drop.
struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(size: usize) -> Result<Self, ReplayError> {
        let layout = Layout::from_size_align(size.max(1), ARENA_ALIGN)
            .context(ArenaLayoutSnafu { size })?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).context(ArenaAllocSnafu { size })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    ptr: NonNull<u8>,
    size: usize,
}

/// Outcome of a successful replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub ops: usize,
    /// Largest sum of requested sizes of live blocks at any point.
    pub peak_payload: usize,
    /// Bytes of the segment committed to blocks at the end of the run.
    pub committed: usize,
}

impl Summary {
    /// Peak payload divided by committed bytes.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.committed == 0 {
            return 0.0;
        }
        self.peak_payload as f64 / self.committed as f64
    }
}

fn pattern(id: usize) -> u8 {
    id.to_le_bytes()[0] ^ 0x5a
}

/// Drives a heap over its own backing segment.
pub struct Replayer {
    heap: HeapManager,
    live: BTreeMap<usize, LiveBlock>,
    payload: usize,
    summary: Summary,
    validate: bool,
    // dropped last, the heap points into it
    _arena: Arena,
}

impl Replayer {
    /// Creates a heap over a new segment of `segment_size` bytes.
    ///
    /// With `validate` set, the heap is checked after every operation.
    pub fn new(segment_size: usize, validate: bool) -> Result<Self, ReplayError> {
        let arena = Arena::new(segment_size)?;
        let heap = unsafe { HeapManager::new(arena.ptr.as_ptr(), segment_size) }
            .context(InitSnafu)?;
        Ok(Self {
            heap,
            live: BTreeMap::new(),
            payload: 0,
            summary: Summary::default(),
            validate,
            _arena: arena,
        })
    }

    #[must_use]
    pub fn heap(&self) -> &HeapManager {
        &self.heap
    }

    /// Runs all steps in order, stopping at the first failure.
    pub fn run(&mut self, steps: &[Step]) -> Result<Summary, ReplayError> {
        for step in steps {
            self.step(*step)?;
        }
        Ok(self.summary)
    }

    fn step(&mut self, Step { line, op }: Step) -> Result<(), ReplayError> {
        log::trace!("line {line}: {op:?}");
        match op {
            Op::Allocate { id, size } => self.allocate(line, id, size)?,
            Op::Resize { id, size } => self.resize(line, id, size)?,
            Op::Release { id } => self.release(line, id)?,
        }
        if self.validate {
            self.heap.check().context(InconsistentSnafu { line })?;
        }
        self.summary.ops += 1;
        self.summary.peak_payload = self.summary.peak_payload.max(self.payload);
        self.summary.committed = self.heap.used();
        Ok(())
    }

    fn allocate(&mut self, line: usize, id: usize, size: usize) -> Result<(), ReplayError> {
        ensure!(!self.live.contains_key(&id), DuplicateIdSnafu { line, id });
        let ptr = self
            .heap
            .allocate(size)
            .context(ExhaustedSnafu { line, id, size })?;
        self.place(line, id, ptr, size)?;
        unsafe { ptr.write_bytes(pattern(id), size) };
        self.insert(id, LiveBlock { ptr, size });
        Ok(())
    }

    fn resize(&mut self, line: usize, id: usize, size: usize) -> Result<(), ReplayError> {
        let block = self.take(line, id)?;
        verify(line, id, block, block.size)?;
        let resized = unsafe { self.heap.resize(block.ptr.as_ptr(), size) };
        if size == 0 {
            return Ok(());
        }
        let Some(ptr) = resized else {
            // the old block is still live
            self.insert(id, block);
            return ExhaustedSnafu { line, id, size }.fail();
        };
        self.place(line, id, ptr, size)?;
        let resized = LiveBlock { ptr, size };
        verify(line, id, resized, block.size.min(size))?;
        unsafe { ptr.write_bytes(pattern(id), size) };
        self.insert(id, resized);
        Ok(())
    }

    fn release(&mut self, line: usize, id: usize) -> Result<(), ReplayError> {
        let block = self.take(line, id)?;
        verify(line, id, block, block.size)?;
        unsafe { self.heap.release(block.ptr.as_ptr()) };
        Ok(())
    }

    fn insert(&mut self, id: usize, block: LiveBlock) {
        self.payload += block.size;
        self.live.insert(id, block);
    }

    fn take(&mut self, line: usize, id: usize) -> Result<LiveBlock, ReplayError> {
        let block = self.live.remove(&id).context(UnknownIdSnafu { line, id })?;
        self.payload -= block.size;
        Ok(block)
    }

    /// Checks that a new payload is aligned, inside the segment and clear of
    /// every live payload.
    fn place(
        &self,
        line: usize,
        id: usize,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), ReplayError> {
        let addr = ptr.addr().get();
        ensure!(
            addr.is_multiple_of(ALIGNMENT),
            MisalignedSnafu { line, id, addr }
        );

        let start = self.heap.start().addr().get();
        let limit = start + self.heap.capacity();
        let end = addr.checked_add(size);
        ensure!(
            addr >= start && end.is_some_and(|end| end <= limit),
            OutsideSegmentSnafu {
                line,
                id,
                addr,
                size
            }
        );

        let end = addr + size;
        for (&other, block) in &self.live {
            let other_start = block.ptr.addr().get();
            let other_end = other_start + block.size;
            ensure!(
                end <= other_start || other_end <= addr,
                OverlapSnafu { line, id, other }
            );
        }
        Ok(())
    }
}

/// Checks the first `len` bytes of a payload against its fill pattern.
fn verify(line: usize, id: usize, block: LiveBlock, len: usize) -> Result<(), ReplayError> {
    let expected = pattern(id);
    let bytes = unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), len) };
    if let Some(offset) = bytes.iter().position(|&byte| byte != expected) {
        return CorruptedSnafu { line, id, offset }.fail();
    }
    Ok(())
}
