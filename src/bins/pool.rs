//! Single size-class chunk allocator.

use super::bitmap::ChunkBitmap;
use crate::defaults::ALIGNMENT;
use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentCounter, SegmentKind, SegmentTag};
use parking_lot::Mutex;
use std::sync::Arc;

/// A pool of `chunk_count` equal chunks of `chunk_size` bytes.
///
/// Requests are rounded up to whole chunks and served first-fit from a
/// [`ChunkBitmap`]. The pool only does bookkeeping: offsets it returns are
/// relative to the region of the batch that owns it, starting at
/// `base_offset`.
///
/// # Example
///
/// ```rust,ignore
/// use shmalloc::{ChunkPool, SegmentCounter};
///
/// let pool = ChunkPool::new(0, SegmentCounter::new(), 32, 10, 0)?;
/// let seg = pool.allocate(100)?;    // 4 chunks
/// assert_eq!(pool.chunk_left(), 6);
/// pool.free(&seg)?;
/// ```
pub struct ChunkPool {
    id: usize,
    chunk_size: usize,
    chunk_count: usize,
    base_offset: usize,
    counter: SegmentCounter,
    state: Mutex<PoolState>,
}

struct PoolState {
    chunks: ChunkBitmap,
    /// Cached `chunks.count_free()`.
    free: usize,
}

impl ChunkPool {
    /// Create a pool.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `chunk_size` or `chunk_count` is zero, or if
    /// `chunk_size` or `base_offset` is not a multiple of [`ALIGNMENT`].
    pub fn new(
        id: usize,
        counter: SegmentCounter,
        chunk_size: usize,
        chunk_count: usize,
        base_offset: usize,
    ) -> Result<Self> {
        if chunk_size == 0 || chunk_count == 0 {
            return Err(Error::InvalidConfig(format!(
                "pool {id}: chunk size and count must be non-zero"
            )));
        }
        if chunk_size % ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(format!(
                "pool {id}: chunk size {chunk_size} is not a multiple of {ALIGNMENT}"
            )));
        }
        if base_offset % ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(format!(
                "pool {id}: base offset {base_offset} is not a multiple of {ALIGNMENT}"
            )));
        }

        Ok(Self {
            id,
            chunk_size,
            chunk_count,
            base_offset,
            counter,
            state: Mutex::new(PoolState {
                chunks: ChunkBitmap::new(chunk_count),
                free: chunk_count,
            }),
        })
    }

    /// Allocate `nbytes`, rounded up to whole chunks.
    ///
    /// The segment id is drawn before the attempt, so a failed call still
    /// consumes one id.
    pub fn allocate(&self, nbytes: usize) -> Result<Segment> {
        let id = self.counter.next_id();
        if nbytes == 0 {
            return Err(Error::ZeroSize);
        }
        let run = self.chunks_for(nbytes);

        let mut state = self.state.lock();
        if state.free < run {
            return Err(Error::NoMemory { requested: nbytes });
        }
        let start = state
            .chunks
            .first_fit(run)
            .ok_or(Error::NoMemory { requested: nbytes })?;
        state.chunks.occupy(start, run);
        state.free -= run;
        debug_assert_eq!(state.free, state.chunks.count_free());
        drop(state);

        let offset = start * self.chunk_size + self.base_offset;
        tracing::trace!(
            "Pool {} allocated segment {} ({} bytes, {} chunks at offset {})",
            self.id,
            id,
            nbytes,
            run,
            offset
        );

        Ok(Segment::new(
            id,
            nbytes,
            Arc::from(""),
            SegmentKind::Static {
                batch_id: 0,
                bin_id: self.id,
                offset,
            },
        ))
    }

    /// Return a segment's chunks to the pool.
    pub fn free(&self, segment: &Segment) -> Result<()> {
        match *segment.kind() {
            SegmentKind::Static { bin_id, offset, .. } => {
                if bin_id != self.id {
                    return Err(Error::SegmentNotFound(segment.id()));
                }
                self.free_range(offset, segment.size())
            }
            _ => Err(Error::TypeMismatch {
                id: segment.id(),
                expected: SegmentTag::Static,
                actual: segment.tag(),
            }),
        }
    }

    /// Free the chunks covering `size` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// - `RangeError` if the run is not chunk-aligned or leaves the pool span
    /// - `DoubleFree` if any chunk of the run is already free; nothing changes
    pub fn free_range(&self, offset: usize, size: usize) -> Result<()> {
        let rel = offset
            .checked_sub(self.base_offset)
            .ok_or(Error::RangeError { offset, size })?;
        if rel % self.chunk_size != 0 {
            return Err(Error::RangeError { offset, size });
        }
        let start = rel / self.chunk_size;
        let run = self.chunks_for(size).max(1);
        if start >= self.chunk_count || run > self.chunk_count - start {
            return Err(Error::RangeError { offset, size });
        }

        let mut state = self.state.lock();
        if !state.chunks.all_occupied(start, run) {
            tracing::warn!(
                "Pool {}: double free of {} chunks at offset {}",
                self.id,
                run,
                offset
            );
            return Err(Error::DoubleFree { offset, size });
        }
        state.chunks.release(start, run);
        state.free += run;
        debug_assert_eq!(state.free, state.chunks.count_free());
        Ok(())
    }

    /// Mark every chunk free.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.chunks.reset();
        state.free = self.chunk_count;
    }

    /// Number of chunks `nbytes` occupies.
    #[inline]
    pub fn chunks_for(&self, nbytes: usize) -> usize {
        nbytes.div_ceil(self.chunk_size)
    }

    /// Bin id (declaration index within the batch).
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Free chunks right now.
    pub fn chunk_left(&self) -> usize {
        self.state.lock().free
    }

    #[inline]
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Bytes covered by this pool.
    #[inline]
    pub fn span(&self) -> usize {
        self.chunk_size * self.chunk_count
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("id", &self.id)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_count", &self.chunk_count)
            .field("base_offset", &self.base_offset)
            .field("chunk_left", &self.chunk_left())
            .finish()
    }
}
