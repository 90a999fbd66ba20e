//! Cross-process segment manager.
//!
//! A consumer receives a [`SegmentDescriptor`] from a producer and registers
//! it here. The manager derives the backing region's name from the
//! descriptor, maps it once per process (reference counted by name) and
//! hands back local pointers. It never talks to the producing
//! [`PoolRouter`](crate::PoolRouter).

use crate::bins::HeapPool;
use crate::error::{Error, Result};
use crate::segment::{SegmentDescriptor, SegmentId, SegmentTag};
use crate::shm::SharedRegion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ptr::NonNull;
use std::sync::Arc;

/// A segment registered in this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalSegment {
    id: SegmentId,
    size: usize,
    tag: SegmentTag,
    offset: usize,
    region: Option<String>,
}

impl LocalSegment {
    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn tag(&self) -> SegmentTag {
        self.tag
    }

    /// Byte offset within the backing region (0 for local cache memory).
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Name of the attached region, `None` for cache segments.
    pub fn region_name(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

/// One mapping shared by every entry naming the same region.
struct AttachedRegion {
    region: Arc<SharedRegion>,
    attach_count: usize,
}

enum Backing {
    Mapped(Arc<SharedRegion>),
    /// Cache segments live in process-local pooled memory.
    Local(Vec<u8>),
}

struct RegistryEntry {
    segment: LocalSegment,
    backing: Backing,
}

impl RegistryEntry {
    fn pointer(&mut self) -> Result<NonNull<u8>> {
        match &mut self.backing {
            Backing::Mapped(region) => region
                .ptr_at(self.segment.offset, self.segment.size)
                .ok_or(Error::RangeError {
                    offset: self.segment.offset,
                    size: self.segment.size,
                }),
            Backing::Local(buf) => Ok(NonNull::from(buf.as_mut_slice()).cast()),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    regions: HashMap<String, AttachedRegion>,
    entries: HashMap<SegmentId, RegistryEntry>,
}

/// Per-process table of attached segments.
///
/// # Example
///
/// ```rust,ignore
/// use shmalloc::{SegmentDescriptor, SegmentManager};
///
/// let manager = SegmentManager::new("consumer");
/// let desc = SegmentDescriptor::from_bytes(&wire_bytes)?;
/// let local = manager.register(&desc)?;
/// let (ptr, len) = manager.bufferize_segment(&local)?;
/// // ... read len bytes at ptr ...
/// manager.unregister(local.id())?;
/// ```
pub struct SegmentManager {
    name: String,
    state: Mutex<RegistryState>,
    heap: HeapPool,
}

impl SegmentManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RegistryState::default()),
            heap: HeapPool::default(),
        }
    }

    /// Name of this manager, used only in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the segment `desc` describes and map its backing memory.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if `desc.id` is already registered
    /// - `NullptrSegment` for a descriptor naming no memory
    /// - `RegionUnavailable` if the backing region cannot be attached
    /// - `RangeError` if the segment does not fit the attached region
    /// - `NoMemory` if local memory for a cache segment is exhausted
    pub fn register(&self, desc: &SegmentDescriptor) -> Result<LocalSegment> {
        if desc.size == 0 || desc.manager.is_empty() {
            return Err(Error::NullptrSegment);
        }

        let mut state = self.state.lock();
        if state.entries.contains_key(&desc.id) {
            return Err(Error::AlreadyExists(desc.id));
        }

        let (segment, backing) = match desc.tag() {
            SegmentTag::Cache => {
                let buf = self.heap.acquire(desc.size)?;
                let segment = LocalSegment {
                    id: desc.id,
                    size: desc.size,
                    tag: SegmentTag::Cache,
                    offset: 0,
                    region: None,
                };
                (segment, Backing::Local(buf))
            }
            tag => {
                let name = desc.region_name().ok_or_else(|| {
                    Error::InvalidDescriptor(format!("segment {} names no region", desc.id))
                })?;
                let region = Self::attach_region(&mut state, &name)?;

                if region.ptr_at(desc.offset(), desc.size).is_none() {
                    Self::detach_region(&mut state, &name);
                    return Err(Error::RangeError {
                        offset: desc.offset(),
                        size: desc.size,
                    });
                }

                let segment = LocalSegment {
                    id: desc.id,
                    size: desc.size,
                    tag,
                    offset: desc.offset(),
                    region: Some(name),
                };
                (segment, Backing::Mapped(region))
            }
        };

        tracing::trace!(
            "Manager {} registered {} segment {} from {}",
            self.name,
            segment.tag,
            segment.id,
            desc.manager
        );
        state.entries.insert(
            desc.id,
            RegistryEntry {
                segment: segment.clone(),
                backing,
            },
        );
        Ok(segment)
    }

    fn attach_region(state: &mut RegistryState, name: &str) -> Result<Arc<SharedRegion>> {
        match state.regions.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                let attached = slot.get_mut();
                attached.attach_count += 1;
                Ok(Arc::clone(&attached.region))
            }
            Entry::Vacant(slot) => {
                let region = Arc::new(SharedRegion::attach(name)?);
                slot.insert(AttachedRegion {
                    region: Arc::clone(&region),
                    attach_count: 1,
                });
                Ok(region)
            }
        }
    }

    fn detach_region(state: &mut RegistryState, name: &str) {
        let Some(attached) = state.regions.get_mut(name) else {
            tracing::warn!("Detaching unknown region {}", name);
            return;
        };
        attached.attach_count -= 1;
        if attached.attach_count == 0 {
            state.regions.remove(name);
            tracing::debug!("Unmapped region {}", name);
        }
    }

    /// Drop the registration of `id`, unmapping its region when no other
    /// entry uses it.
    pub fn unregister(&self, id: SegmentId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .remove(&id)
            .ok_or(Error::SegmentNotFound(id))?;

        match entry.backing {
            Backing::Mapped(region) => {
                drop(region);
                if let Some(name) = entry.segment.region.as_deref() {
                    Self::detach_region(&mut state, name);
                }
            }
            Backing::Local(buf) => self.heap.recycle(buf),
        }

        tracing::trace!("Manager {} unregistered segment {}", self.name, id);
        Ok(())
    }

    /// Local pointer and size of registered segment `id`.
    ///
    /// The pointer stays valid until `id` is unregistered.
    pub fn bufferize(&self, id: SegmentId) -> Result<(NonNull<u8>, usize)> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(Error::SegmentNotFound(id))?;
        Ok((entry.pointer()?, entry.segment.size))
    }

    /// [`bufferize`](Self::bufferize) for a handle returned by
    /// [`register`](Self::register). A handle whose registration was dropped
    /// and replaced by another segment under the same id is `SegmentNotFound`.
    pub fn bufferize_segment(&self, segment: &LocalSegment) -> Result<(NonNull<u8>, usize)> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&segment.id)
            .filter(|entry| entry.segment == *segment)
            .ok_or(Error::SegmentNotFound(segment.id))?;
        Ok((entry.pointer()?, entry.segment.size))
    }

    /// Copy of registered segment `id`'s bytes.
    pub fn read(&self, id: SegmentId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let entry = state.entries.get(&id).ok_or(Error::SegmentNotFound(id))?;
        match &entry.backing {
            Backing::Mapped(region) => region.read_at(entry.segment.offset, entry.segment.size),
            Backing::Local(buf) => Ok(buf.clone()),
        }
    }

    /// Copy `data` into registered segment `id` at `offset`.
    pub fn write(&self, id: SegmentId, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(Error::SegmentNotFound(id))?;

        let size = entry.segment.size;
        if offset.checked_add(data.len()).is_none_or(|end| end > size) {
            return Err(Error::RangeError {
                offset,
                size: data.len(),
            });
        }

        match &mut entry.backing {
            Backing::Mapped(region) => region.write_at(entry.segment.offset + offset, data),
            Backing::Local(buf) => {
                buf[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, id: SegmentId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Registered segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Distinct regions currently mapped.
    pub fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Entries currently using region `name`, 0 if it is not mapped.
    pub fn attach_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .regions
            .get(name)
            .map_or(0, |attached| attached.attach_count)
    }
}

impl Drop for SegmentManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.entries.is_empty() {
            tracing::debug!(
                "Dropping segment manager {} with {} registered segments in {} regions",
                self.name,
                state.entries.len(),
                state.regions.len()
            );
        }
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("name", &self.name)
            .field("segments", &self.segment_count())
            .field("regions", &self.region_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchGeometry, ManagerConfig};
    use crate::defaults::KIB;
    use crate::router::PoolRouter;
    use crate::segment::{CacheLocator, SegmentKind};
    use crate::shm::test_region_name;

    fn router(prefix: &str) -> PoolRouter {
        let config = ManagerConfig::new(test_region_name(prefix))
            .with_thresholds(KIB, 64 * KIB)
            .with_geometry(BatchGeometry::uniform(vec![4 * KIB, 2 * KIB], 4));
        PoolRouter::new(config).unwrap()
    }

    #[test]
    fn test_register_static_shares_mapping() {
        let producer = router("registry-static");
        let a = producer.static_alloc(4 * KIB).unwrap();
        let b = producer.static_alloc(2 * KIB).unwrap();
        producer.write(b.id(), 0, b"second").unwrap();

        let manager = SegmentManager::new("consumer");
        let la = manager.register(&a.descriptor()).unwrap();
        let lb = manager.register(&b.descriptor()).unwrap();
        let name = la.region_name().unwrap().to_string();
        assert_eq!(lb.region_name(), Some(name.as_str()));
        assert_eq!(manager.region_count(), 1);
        assert_eq!(manager.attach_count(&name), 2);

        let (pa, _) = manager.bufferize(a.id()).unwrap();
        let (pb, len) = manager.bufferize_segment(&lb).unwrap();
        assert_eq!(len, 2 * KIB);
        assert_eq!(pb.as_ptr() as usize - pa.as_ptr() as usize, b.offset() - a.offset());
        assert_eq!(&manager.read(b.id()).unwrap()[..6], b"second");

        manager.unregister(a.id()).unwrap();
        assert_eq!(manager.attach_count(&name), 1);
        manager.unregister(b.id()).unwrap();
        assert_eq!(manager.region_count(), 0);
        assert!(matches!(
            manager.unregister(b.id()),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_register_duplicate() {
        let producer = router("registry-dup");
        let seg = producer.static_alloc(3 * KIB).unwrap();
        let manager = SegmentManager::new("consumer");
        manager.register(&seg.descriptor()).unwrap();
        assert!(matches!(
            manager.register(&seg.descriptor()),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(manager.attach_count(&seg.region_name().unwrap()), 1);
    }

    #[test]
    fn test_register_ephemeral_write_through() {
        let producer = router("registry-eph");
        let seg = producer.instant_alloc(100 * KIB).unwrap();
        let manager = SegmentManager::new("consumer");
        manager.register(&seg.descriptor()).unwrap();

        manager.write(seg.id(), 10, b"from consumer").unwrap();
        let bytes = producer.read(seg.id()).unwrap();
        assert_eq!(&bytes[10..23], b"from consumer");
        assert!(matches!(
            manager.write(seg.id(), 100 * KIB, b"x"),
            Err(Error::RangeError { .. })
        ));
    }

    #[test]
    fn test_register_cache_is_local() {
        let desc = SegmentDescriptor {
            manager: "producer".into(),
            id: 9,
            size: 800,
            kind: SegmentKind::Cache(CacheLocator::Local),
        };
        let manager = SegmentManager::new("consumer");
        let local = manager.register(&desc).unwrap();
        assert_eq!(local.region_name(), None);
        assert_eq!(manager.region_count(), 0);

        let (_, len) = manager.bufferize(9).unwrap();
        assert_eq!(len, 800);
        manager.write(9, 0, &[5; 800]).unwrap();
        assert!(manager.read(9).unwrap().iter().all(|&b| b == 5));
        manager.unregister(9).unwrap();
    }

    #[test]
    fn test_manager_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SegmentManager>();
        assert_send_sync::<LocalSegment>();
    }

    #[test]
    fn test_register_cache_huge_size() {
        let desc = SegmentDescriptor {
            manager: "producer".into(),
            id: 4,
            size: usize::MAX,
            kind: SegmentKind::Cache(CacheLocator::Local),
        };
        let manager = SegmentManager::new("consumer");
        assert!(matches!(
            manager.register(&desc),
            Err(Error::NoMemory { requested: usize::MAX })
        ));
        assert!(!manager.is_registered(4));
        assert_eq!(manager.segment_count(), 0);
    }

    #[test]
    fn test_register_missing_region() {
        let desc = SegmentDescriptor {
            manager: test_region_name("registry-missing"),
            id: 1,
            size: 64,
            kind: SegmentKind::Ephemeral,
        };
        let manager = SegmentManager::new("consumer");
        assert!(matches!(
            manager.register(&desc),
            Err(Error::RegionUnavailable { .. })
        ));
        assert_eq!(manager.region_count(), 0);
        assert!(!manager.is_registered(1));
    }

    #[test]
    fn test_register_out_of_range_rolls_back() {
        let producer = router("registry-range");
        let seg = producer.static_alloc(4 * KIB).unwrap();
        let mut desc = seg.descriptor();
        desc.size = 1 << 30;

        let manager = SegmentManager::new("consumer");
        assert!(matches!(
            manager.register(&desc),
            Err(Error::RangeError { .. })
        ));
        assert_eq!(manager.region_count(), 0);
    }

    #[test]
    fn test_register_empty_descriptor() {
        let desc = SegmentDescriptor {
            manager: "producer".into(),
            id: 3,
            size: 0,
            kind: SegmentKind::Ephemeral,
        };
        assert!(matches!(
            SegmentManager::new("consumer").register(&desc),
            Err(Error::NullptrSegment)
        ));
    }
}
