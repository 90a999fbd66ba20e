//! One dedicated region per segment, for requests too large to pool.

use crate::error::{Error, Result};
use crate::segment::{
    Segment, SegmentCounter, SegmentId, SegmentKind, SegmentTag, ephemeral_region_name,
};
use crate::shm::SharedRegion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Allocates a fresh region `{manager}#instbin#seg{id}` for every request.
///
/// No size classes, no bitmap: the region is the segment. Freeing drops the
/// mapping and unlinks the name; processes that already attached keep their
/// mapping until they detach.
pub struct EphemeralPool {
    manager: Arc<str>,
    counter: SegmentCounter,
    regions: Mutex<HashMap<SegmentId, Arc<SharedRegion>>>,
}

impl EphemeralPool {
    pub fn new(manager: Arc<str>, counter: SegmentCounter) -> Self {
        Self {
            manager,
            counter,
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a dedicated region of `nbytes`.
    pub fn allocate(&self, nbytes: usize) -> Result<Segment> {
        let id = self.counter.next_id();
        if nbytes == 0 {
            return Err(Error::ZeroSize);
        }

        let region = SharedRegion::create(&ephemeral_region_name(&self.manager, id), nbytes)?;
        match self.regions.lock().entry(id) {
            Entry::Occupied(_) => {
                tracing::error!("Ephemeral segment {} issued twice", id);
                return Err(Error::DuplicatedKey(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(region));
            }
        }

        tracing::trace!("Ephemeral segment {} ({} bytes)", id, nbytes);
        Ok(Segment::new(
            id,
            nbytes,
            Arc::clone(&self.manager),
            SegmentKind::Ephemeral,
        ))
    }

    /// Drop the segment's region.
    pub fn free(&self, segment: &Segment) -> Result<()> {
        if segment.tag() != SegmentTag::Ephemeral {
            return Err(Error::TypeMismatch {
                id: segment.id(),
                expected: SegmentTag::Ephemeral,
                actual: segment.tag(),
            });
        }
        self.regions
            .lock()
            .remove(&segment.id())
            .map(drop)
            .ok_or(Error::SegmentNotFound(segment.id()))
    }

    /// Creator-side mapping of segment `id`.
    pub fn region(&self, id: SegmentId) -> Option<Arc<SharedRegion>> {
        self.regions.lock().get(&id).cloned()
    }

    /// Live ephemeral segments.
    pub fn segment_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Drop every region.
    pub fn clear(&self) {
        self.regions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_region_name;

    #[test]
    fn test_ephemeral_allocate_and_free() {
        let manager: Arc<str> = Arc::from(test_region_name("eph"));
        let counter = SegmentCounter::new();
        let pool = EphemeralPool::new(Arc::clone(&manager), counter.clone());

        let seg = pool.allocate(3000).unwrap();
        assert_eq!(seg.tag(), SegmentTag::Ephemeral);
        assert_eq!(seg.size(), 3000);
        assert_eq!(
            seg.region_name(),
            Some(format!("{}#instbin#seg{}", manager, seg.id()))
        );

        let region = pool.region(seg.id()).unwrap();
        assert_eq!(region.len(), 3000);
        region.write_at(0, b"payload").unwrap();

        // Another process attaches by name alone.
        let peer = SharedRegion::attach(&seg.region_name().unwrap()).unwrap();
        assert_eq!(peer.read_at(0, 7).unwrap(), b"payload");

        drop(region);
        pool.free(&seg).unwrap();
        assert_eq!(pool.segment_count(), 0);
        assert!(matches!(pool.free(&seg), Err(Error::SegmentNotFound(_))));
    }

    #[test]
    fn test_ephemeral_distinct_regions() {
        let pool = EphemeralPool::new(Arc::from(test_region_name("eph2")), SegmentCounter::new());
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(64).unwrap();
        assert_ne!(a.region_name(), b.region_name());
        assert_eq!(pool.segment_count(), 2);
        pool.clear();
        assert_eq!(pool.segment_count(), 0);
    }

    #[test]
    fn test_ephemeral_rejects_other_tiers() {
        let pool = EphemeralPool::new(Arc::from(test_region_name("eph3")), SegmentCounter::new());
        let seg = Segment::new(
            0,
            64,
            Arc::from("m"),
            SegmentKind::Static {
                batch_id: 0,
                bin_id: 0,
                offset: 0,
            },
        );
        assert!(matches!(pool.free(&seg), Err(Error::TypeMismatch { .. })));
        assert!(matches!(pool.allocate(0), Err(Error::ZeroSize)));
    }
}
