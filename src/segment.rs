//! Segment handles, the shared id counter and the cross-process descriptor.
//!
//! A [`Segment`] is what a tier hands back from `allocate`. It is only
//! meaningful inside the process that created it. To address the same memory
//! from another process, send its [`SegmentDescriptor`] and resolve it with a
//! [`SegmentManager`](crate::SegmentManager).

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Globally unique segment id within one router instance.
pub type SegmentId = u64;

/// Monotonic id source shared by every tier of one router.
///
/// Cloning shares the same counter. Ids are drawn before an allocation is
/// attempted, so a failed attempt still advances the counter.
#[derive(Clone, Debug, Default)]
pub struct SegmentCounter(Arc<AtomicU64>);

impl SegmentCounter {
    /// Create a counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next id.
    #[inline]
    pub fn next_id(&self) -> SegmentId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of ids issued so far.
    #[inline]
    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Which tier produced a segment.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum SegmentTag {
    /// Fixed chunks inside a batch region.
    Static = 1,
    /// Small-object cache channel.
    Cache = 2,
    /// One dedicated region per segment.
    Ephemeral = 3,
}

impl fmt::Display for SegmentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentTag::Static => "static",
            SegmentTag::Cache => "cache",
            SegmentTag::Ephemeral => "ephemeral",
        };
        f.write_str(name)
    }
}

/// Where a cache segment's bytes live.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum CacheLocator {
    /// Process-local pooled memory. Not attachable from elsewhere.
    Local,
    /// An exchange area of the handoff region.
    Area {
        /// Byte offset of the area's data within the handoff region.
        area_offset: usize,
        /// Byte offset of the area's signal word within the handoff region.
        signal_offset: usize,
    },
}

/// Tier-specific part of a segment.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum SegmentKind {
    /// Chunks of bin `bin_id` in batch `batch_id`, starting `offset` bytes into the batch region.
    Static {
        batch_id: usize,
        bin_id: usize,
        offset: usize,
    },
    /// Dedicated region named after the segment id.
    Ephemeral,
    /// Cache channel entry.
    Cache(CacheLocator),
}

impl SegmentKind {
    /// Tier tag of this kind.
    pub fn tag(&self) -> SegmentTag {
        match self {
            SegmentKind::Static { .. } => SegmentTag::Static,
            SegmentKind::Ephemeral => SegmentTag::Ephemeral,
            SegmentKind::Cache(_) => SegmentTag::Cache,
        }
    }

    /// Byte offset of the segment's data within its backing region.
    pub fn offset(&self) -> usize {
        match self {
            SegmentKind::Static { offset, .. } => *offset,
            SegmentKind::Cache(CacheLocator::Area { area_offset, .. }) => *area_offset,
            SegmentKind::Ephemeral | SegmentKind::Cache(CacheLocator::Local) => 0,
        }
    }

    /// Name of the backing region, or `None` for process-local cache memory.
    pub fn region_name(&self, manager: &str, id: SegmentId) -> Option<String> {
        match self {
            SegmentKind::Static { batch_id, .. } => Some(static_region_name(manager, *batch_id)),
            SegmentKind::Ephemeral => Some(ephemeral_region_name(manager, id)),
            SegmentKind::Cache(CacheLocator::Area { .. }) => Some(cache_region_name(manager)),
            SegmentKind::Cache(CacheLocator::Local) => None,
        }
    }
}

/// An allocated unit of memory.
///
/// Tier fields are fixed at creation. Freeing a segment changes the owning
/// tier's bookkeeping, never the segment value itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    id: SegmentId,
    size: usize,
    manager: Arc<str>,
    kind: SegmentKind,
}

impl Segment {
    pub(crate) fn new(id: SegmentId, size: usize, manager: Arc<str>, kind: SegmentKind) -> Self {
        Self {
            id,
            size,
            manager,
            kind,
        }
    }

    /// Attach the owning manager's name.
    pub(crate) fn stamp(&mut self, manager: &Arc<str>) {
        if *self.manager != **manager {
            self.manager = Arc::clone(manager);
        }
    }

    pub(crate) fn set_batch(&mut self, batch: usize) {
        if let SegmentKind::Static { batch_id, .. } = &mut self.kind {
            *batch_id = batch;
        }
    }

    pub(crate) fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Requested size in bytes (not rounded up to chunks).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name of the manager that owns the segment.
    #[inline]
    pub fn manager(&self) -> &str {
        &self.manager
    }

    #[inline]
    pub fn kind(&self) -> &SegmentKind {
        &self.kind
    }

    #[inline]
    pub fn tag(&self) -> SegmentTag {
        self.kind.tag()
    }

    /// Byte offset of the data within the backing region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.kind.offset()
    }

    /// `(batch_id, bin_id)` for static segments.
    pub fn static_location(&self) -> Option<(usize, usize)> {
        match self.kind {
            SegmentKind::Static {
                batch_id, bin_id, ..
            } => Some((batch_id, bin_id)),
            _ => None,
        }
    }

    /// Name of the backing shared-memory region, if it has one.
    pub fn region_name(&self) -> Option<String> {
        self.kind.region_name(&self.manager, self.id)
    }

    /// The handle to send to another process.
    pub fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor {
            manager: self.manager.to_string(),
            id: self.id,
            size: self.size,
            kind: self.kind,
        }
    }
}

/// Serializable, self-describing locator for a segment.
///
/// Carries everything another process needs to attach the backing region and
/// compute its own local pointer. Raw pointers never cross a process boundary.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct SegmentDescriptor {
    /// Name of the manager that created the segment.
    pub manager: String,
    /// Segment id.
    pub id: SegmentId,
    /// Size in bytes.
    pub size: usize,
    /// Tier tag plus locator fields.
    pub kind: SegmentKind,
}

impl SegmentDescriptor {
    #[inline]
    pub fn tag(&self) -> SegmentTag {
        self.kind.tag()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.kind.offset()
    }

    /// Name of the region this descriptor lives in, derived with the same
    /// scheme the owning tier used to create it.
    pub fn region_name(&self) -> Option<String> {
        self.kind.region_name(&self.manager, self.id)
    }

    /// Encode for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::InvalidDescriptor(e.to_string()))
    }

    /// Decode bytes produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // The archive must be read from an aligned buffer.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::InvalidDescriptor(e.to_string()))
    }
}

// =============================================================================
// Region naming
// =============================================================================

/// Region backing batch `batch_id` of `manager`.
pub fn static_region_name(manager: &str, batch_id: usize) -> String {
    format!("{manager}#batch{batch_id}#statbin")
}

/// Region dedicated to ephemeral segment `id` of `manager`.
pub fn ephemeral_region_name(manager: &str, id: SegmentId) -> String {
    format!("{manager}#instbin#seg{id}")
}

/// Handoff region of `manager`'s cache channel.
pub fn cache_region_name(manager: &str) -> String {
    format!("{manager}#cachbin")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_segment(id: SegmentId) -> Segment {
        Segment::new(
            id,
            4096,
            Arc::from("mgr"),
            SegmentKind::Static {
                batch_id: 2,
                bin_id: 5,
                offset: 8192,
            },
        )
    }

    #[test]
    fn test_counter_shared_between_clones() {
        let counter = SegmentCounter::new();
        let other = counter.clone();
        assert_eq!(counter.next_id(), 0);
        assert_eq!(other.next_id(), 1);
        assert_eq!(counter.next_id(), 2);
        assert_eq!(other.issued(), 3);
    }

    #[test]
    fn test_region_names() {
        assert_eq!(static_region_name("mgr", 0), "mgr#batch0#statbin");
        assert_eq!(ephemeral_region_name("mgr", 17), "mgr#instbin#seg17");
        assert_eq!(cache_region_name("mgr"), "mgr#cachbin");

        assert_eq!(
            static_segment(3).region_name().as_deref(),
            Some("mgr#batch2#statbin")
        );
        let local = Segment::new(
            4,
            10,
            Arc::from("mgr"),
            SegmentKind::Cache(CacheLocator::Local),
        );
        assert_eq!(local.region_name(), None);
    }

    #[test]
    fn test_descriptor_bytes() {
        let segment = static_segment(42);
        let desc = segment.descriptor();
        let bytes = desc.to_bytes().unwrap();
        let decoded = SegmentDescriptor::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, desc);
        assert_eq!(decoded.tag(), SegmentTag::Static);
        assert_eq!(decoded.offset(), 8192);
        assert_eq!(decoded.region_name().as_deref(), Some("mgr#batch2#statbin"));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_descriptor_beyond_4gib() {
        let desc = SegmentDescriptor {
            manager: "mgr".into(),
            id: 7,
            size: 5 << 30,
            kind: SegmentKind::Static {
                batch_id: 0,
                bin_id: 1,
                offset: 6 << 30,
            },
        };
        let decoded = SegmentDescriptor::from_bytes(&desc.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.size, 5 << 30);
        assert_eq!(decoded.offset(), 6 << 30);
    }

    #[test]
    fn test_descriptor_rejects_garbage() {
        assert!(matches!(
            SegmentDescriptor::from_bytes(&[0xff; 3]),
            Err(Error::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_stamp_replaces_manager() {
        let mut segment = Segment::new(1, 8, Arc::from(""), SegmentKind::Ephemeral);
        segment.stamp(&Arc::from("owner"));
        assert_eq!(segment.manager(), "owner");
        assert_eq!(segment.region_name().as_deref(), Some("owner#instbin#seg1"));
    }
}
