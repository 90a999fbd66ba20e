//! A group of chunk pools sharing one shared-memory region.

use super::pool::ChunkPool;
use crate::config::BatchGeometry;
use crate::defaults::STATIC_OVERSIZE_FACTOR;
use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentCounter, SegmentKind, SegmentTag, static_region_name};
use crate::shm::SharedRegion;
use std::ptr::NonNull;
use std::sync::Arc;

/// Several [`ChunkPool`]s of different chunk sizes laid out back to back in
/// one region named `{manager}#batch{id}#statbin`.
///
/// Bin `i` of the geometry starts at the sum of the spans of bins `0..i`.
/// Requests are served by the pool that wastes the least padding: a perfect
/// fit first, then ascending remainder, falling through on `NoMemory`.
pub struct Batch {
    id: usize,
    manager: Arc<str>,
    /// Sorted by descending chunk size.
    pools: Vec<ChunkPool>,
    region: SharedRegion,
    total_bytes: usize,
    max_chunk_size: usize,
}

impl Batch {
    /// Build a batch and create its backing region.
    pub fn new(
        manager: Arc<str>,
        id: usize,
        counter: SegmentCounter,
        geometry: &BatchGeometry,
    ) -> Result<Self> {
        geometry.validate()?;

        let mut pools = Vec::with_capacity(geometry.len());
        let mut offset = 0;
        for (bin_id, (chunk_size, chunk_count)) in geometry.bins().enumerate() {
            pools.push(ChunkPool::new(
                bin_id,
                counter.clone(),
                chunk_size,
                chunk_count,
                offset,
            )?);
            offset += chunk_size * chunk_count;
        }
        let total_bytes = offset;
        pools.sort_by(|a, b| b.chunk_size().cmp(&a.chunk_size()));

        let region = SharedRegion::create(&static_region_name(&manager, id), total_bytes)?;

        tracing::debug!(
            "Created batch {} of manager {} ({} bins, {} bytes)",
            id,
            manager,
            pools.len(),
            total_bytes
        );

        Ok(Self {
            id,
            manager,
            max_chunk_size: geometry.max_chunk_size(),
            pools,
            region,
            total_bytes,
        })
    }

    /// Allocate `nbytes` from the best-fitting pool.
    ///
    /// # Errors
    ///
    /// - `OversizedRequest` above [`size_limit`](Self::size_limit)
    /// - `NoMemory` when no pool can take the request
    pub fn allocate(&self, nbytes: usize) -> Result<Segment> {
        let limit = self.size_limit();
        if nbytes > limit {
            return Err(Error::OversizedRequest {
                requested: nbytes,
                limit,
            });
        }

        let mut tried = vec![false; self.pools.len()];

        // Perfect fits waste nothing, but may be full.
        for (idx, pool) in self.pools.iter().enumerate() {
            if nbytes % pool.chunk_size() != 0 {
                continue;
            }
            tried[idx] = true;
            if let Some(segment) = self.try_pool(pool, nbytes)? {
                return Ok(segment);
            }
        }

        let mut order: Vec<usize> = (0..self.pools.len()).filter(|&i| !tried[i]).collect();
        order.sort_by_key(|&i| nbytes % self.pools[i].chunk_size());
        for idx in order {
            if let Some(segment) = self.try_pool(&self.pools[idx], nbytes)? {
                return Ok(segment);
            }
        }

        Err(Error::NoMemory { requested: nbytes })
    }

    fn try_pool(&self, pool: &ChunkPool, nbytes: usize) -> Result<Option<Segment>> {
        match pool.allocate(nbytes) {
            Ok(mut segment) => {
                segment.set_batch(self.id);
                segment.stamp(&self.manager);
                Ok(Some(segment))
            }
            Err(e) if e.is_no_memory() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Return a segment to the pool that produced it.
    pub fn free(&self, segment: &Segment) -> Result<()> {
        let bin_id = self.locate(segment)?;
        let pool = self
            .pool(bin_id)
            .ok_or(Error::SegmentNotFound(segment.id()))?;
        pool.free(segment)
    }

    /// Creator-side pointer to a segment's bytes.
    pub fn segment_ptr(&self, segment: &Segment) -> Result<NonNull<u8>> {
        self.locate(segment)?;
        self.region
            .ptr_at(segment.offset(), segment.size())
            .ok_or(Error::RangeError {
                offset: segment.offset(),
                size: segment.size(),
            })
    }

    /// Check the segment belongs here and return its bin id.
    fn locate(&self, segment: &Segment) -> Result<usize> {
        match *segment.kind() {
            SegmentKind::Static {
                batch_id, bin_id, ..
            } if batch_id == self.id => Ok(bin_id),
            SegmentKind::Static { .. } => Err(Error::SegmentNotFound(segment.id())),
            _ => Err(Error::TypeMismatch {
                id: segment.id(),
                expected: SegmentTag::Static,
                actual: segment.tag(),
            }),
        }
    }

    /// Pool with bin id `bin_id`.
    pub fn pool(&self, bin_id: usize) -> Option<&ChunkPool> {
        self.pools.iter().find(|p| p.id() == bin_id)
    }

    /// Pools in search order (descending chunk size).
    pub fn pools(&self) -> &[ChunkPool] {
        &self.pools
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn manager(&self) -> &str {
        &self.manager
    }

    #[inline]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[inline]
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Largest request this batch accepts.
    #[inline]
    pub fn size_limit(&self) -> usize {
        self.max_chunk_size * STATIC_OVERSIZE_FACTOR
    }

    /// Free chunks across all pools.
    pub fn chunk_left(&self) -> usize {
        self.pools.iter().map(ChunkPool::chunk_left).sum()
    }

    /// Mark every chunk of every pool free.
    pub fn clear(&self) {
        for pool in &self.pools {
            pool.clear();
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("manager", &self.manager)
            .field("bins", &self.pools.len())
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::KIB;
    use crate::shm::test_region_name;

    fn stepped_batch(counter: &SegmentCounter) -> Batch {
        let geometry = BatchGeometry::stepped(4 * KIB, 128 * KIB, 8 * KIB, 64).unwrap();
        Batch::new(
            Arc::from(test_region_name("batch")),
            0,
            counter.clone(),
            &geometry,
        )
        .unwrap()
    }

    #[test]
    fn test_batch_layout() {
        let geometry = BatchGeometry::new(vec![64, 256, 128], vec![4, 2, 8]).unwrap();
        let batch = Batch::new(
            Arc::from(test_region_name("batch-layout")),
            3,
            SegmentCounter::new(),
            &geometry,
        )
        .unwrap();

        assert_eq!(batch.total_bytes(), 64 * 4 + 256 * 2 + 128 * 8);
        assert_eq!(batch.region().len(), batch.total_bytes());
        assert!(batch.region().name().ends_with("#batch3#statbin"));

        // Offsets follow declaration order, search order is descending size.
        assert_eq!(batch.pool(0).unwrap().base_offset(), 0);
        assert_eq!(batch.pool(1).unwrap().base_offset(), 256);
        assert_eq!(batch.pool(2).unwrap().base_offset(), 768);
        let sizes: Vec<_> = batch.pools().iter().map(|p| p.chunk_size()).collect();
        assert_eq!(sizes, vec![256, 128, 64]);
    }

    #[test]
    fn test_batch_perfect_fit() {
        let counter = SegmentCounter::new();
        let batch = stepped_batch(&counter);

        let seg = batch.allocate(16 * KIB).unwrap();
        assert_eq!(seg.size(), 16 * KIB);
        assert_eq!(seg.static_location(), Some((0, 0)));
        assert_eq!(seg.id(), 0);
        assert_eq!(counter.issued(), 1);
        assert_eq!(seg.manager(), batch.manager());

        batch.free(&seg).unwrap();
    }

    #[test]
    fn test_batch_prefers_largest_perfect_fit() {
        let counter = SegmentCounter::new();
        let batch = stepped_batch(&counter);

        let a = batch.allocate(20 * KIB).unwrap();
        let b = batch.allocate(28 * KIB).unwrap();
        let c = batch.allocate(32 * KIB).unwrap();
        assert_eq!(a.static_location(), Some((0, 2)));
        assert_eq!(b.static_location(), Some((0, 3)));
        assert_eq!(c.static_location(), Some((0, 0)));
        assert!(a.id() < b.id() && b.id() < c.id());
    }

    #[test]
    fn test_batch_least_remainder_fallback() {
        let geometry = BatchGeometry::new(vec![64, 96], vec![2, 4]).unwrap();
        let batch = Batch::new(
            Arc::from(test_region_name("batch-fallback")),
            0,
            SegmentCounter::new(),
            &geometry,
        )
        .unwrap();

        // 70 % 96 = 70, 70 % 64 = 6: the 64-byte bin wastes less.
        let a = batch.allocate(70).unwrap();
        assert_eq!(a.static_location(), Some((0, 0)));
        // Both 64-byte chunks are taken; fall through to 96.
        let b = batch.allocate(70).unwrap();
        assert_eq!(b.static_location(), Some((0, 1)));

        // Perfect fit in a full bin falls through too.
        let c = batch.allocate(64).unwrap();
        assert_eq!(c.static_location(), Some((0, 1)));
    }

    #[test]
    fn test_batch_rejects_oversized() {
        let batch = stepped_batch(&SegmentCounter::new());
        let err = batch.allocate(9 * batch.max_chunk_size()).unwrap_err();
        assert!(matches!(err, Error::OversizedRequest { .. }));
        assert!(batch.allocate(batch.size_limit()).is_ok());
    }

    #[test]
    fn test_batch_exhaustion() {
        let geometry = BatchGeometry::new(vec![64], vec![2]).unwrap();
        let batch = Batch::new(
            Arc::from(test_region_name("batch-full")),
            0,
            SegmentCounter::new(),
            &geometry,
        )
        .unwrap();
        let a = batch.allocate(64).unwrap();
        let _b = batch.allocate(64).unwrap();
        assert!(batch.allocate(64).unwrap_err().is_no_memory());

        batch.free(&a).unwrap();
        assert_eq!(batch.chunk_left(), 1);
        assert!(batch.allocate(64).is_ok());
    }

    #[test]
    fn test_batch_free_foreign_segment() {
        let counter = SegmentCounter::new();
        let batch = stepped_batch(&counter);
        let mut seg = batch.allocate(4 * KIB).unwrap();
        seg.set_batch(7);
        assert!(matches!(batch.free(&seg), Err(Error::SegmentNotFound(_))));
        assert!(matches!(
            batch.segment_ptr(&seg),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_batch_segment_ptr_writes_region() {
        let batch = stepped_batch(&SegmentCounter::new());
        let seg = batch.allocate(100).unwrap();
        let ptr = batch.segment_ptr(&seg).unwrap();
        // SAFETY: segment_ptr covers seg.size() bytes of the mapping.
        unsafe { ptr.as_ptr().write_bytes(0xab, seg.size()) };
        assert_eq!(
            batch.region().read_at(seg.offset(), 4).unwrap(),
            vec![0xab; 4]
        );
    }
}
