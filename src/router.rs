//! Top-level allocator facade and segment table.

use crate::bins::{Batch, CacheChannel, EphemeralPool};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentCounter, SegmentDescriptor, SegmentId, SegmentKind, SegmentTag};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

/// Routes allocations to the cache, static or ephemeral tier by size and
/// keeps the id → segment table used to free them.
///
/// All tiers draw ids from one [`SegmentCounter`], so an id alone is enough
/// to find the tier that must free it.
///
/// # Example
///
/// ```rust,ignore
/// use shmalloc::{ManagerConfig, PoolRouter};
///
/// let router = PoolRouter::new(ManagerConfig::new("producer"))?;
/// let seg = router.allocate(16 * 1024)?;        // static tier
/// router.write(seg.id(), 0, b"frame header")?;
/// let desc = seg.descriptor();                   // send this to a consumer
/// router.deallocate(seg.id())?;
/// ```
pub struct PoolRouter {
    name: Arc<str>,
    config: ManagerConfig,
    counter: SegmentCounter,
    /// Batch `i` has id `i`. Grown under the write lock.
    batches: RwLock<Vec<Batch>>,
    ephemeral: EphemeralPool,
    cache: CacheChannel,
    segments: Mutex<BTreeMap<SegmentId, Segment>>,
}

impl PoolRouter {
    /// Validate `config` and build every tier, including the first batch.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let name: Arc<str> = Arc::from(config.name.as_str());
        let counter = SegmentCounter::new();
        let first = Batch::new(Arc::clone(&name), 0, counter.clone(), &config.geometry)?;
        let cache = CacheChannel::new(
            Arc::clone(&name),
            counter.clone(),
            config.cache_mode,
            config.cache_capacity,
        )?;
        let ephemeral = EphemeralPool::new(Arc::clone(&name), counter.clone());

        tracing::debug!(
            "Created pool router {} (cache <= {} bytes, ephemeral >= {} bytes)",
            name,
            config.cache_threshold,
            config.instant_threshold
        );

        Ok(Self {
            name,
            config,
            counter,
            batches: RwLock::new(vec![first]),
            ephemeral,
            cache,
            segments: Mutex::new(BTreeMap::new()),
        })
    }

    /// Tier that [`allocate`](Self::allocate) picks for `nbytes`.
    pub fn classify(&self, nbytes: usize) -> SegmentTag {
        if nbytes <= self.config.cache_threshold {
            SegmentTag::Cache
        } else if nbytes >= self.config.instant_threshold {
            SegmentTag::Ephemeral
        } else {
            SegmentTag::Static
        }
    }

    /// Allocate `nbytes` from the tier its size selects.
    pub fn allocate(&self, nbytes: usize) -> Result<Segment> {
        match self.classify(nbytes) {
            SegmentTag::Cache => self.cache_malloc(nbytes),
            SegmentTag::Static => self.static_alloc(nbytes),
            SegmentTag::Ephemeral => self.instant_alloc(nbytes),
        }
    }

    /// Allocate from the static tier, growing it by one batch when every
    /// existing batch is full.
    pub fn static_alloc(&self, nbytes: usize) -> Result<Segment> {
        let seen = {
            let batches = self.batches.read();
            if let Some(segment) = Self::first_batch_fit(&batches, nbytes)? {
                drop(batches);
                return self.register(segment);
            }
            batches.len()
        };

        let segment = {
            let mut batches = self.batches.write();
            // Another caller may have grown the tier while we waited.
            if batches.len() == seen {
                let id = batches.len();
                let batch = Batch::new(
                    Arc::clone(&self.name),
                    id,
                    self.counter.clone(),
                    &self.config.geometry,
                )?;
                tracing::debug!("Manager {} grew static tier to {} batches", self.name, id + 1);
                batches.push(batch);
            }
            Self::first_batch_fit(&batches[seen..], nbytes)?
        };

        match segment {
            Some(segment) => self.register(segment),
            None => {
                tracing::error!(
                    "Manager {}: {} bytes unserviceable even by a fresh batch",
                    self.name,
                    nbytes
                );
                Err(Error::NoMemory { requested: nbytes })
            }
        }
    }

    /// First batch in creation order that takes the request.
    fn first_batch_fit(batches: &[Batch], nbytes: usize) -> Result<Option<Segment>> {
        for batch in batches {
            match batch.allocate(nbytes) {
                Ok(segment) => return Ok(Some(segment)),
                Err(e) if e.is_no_memory() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Allocate a dedicated region.
    pub fn instant_alloc(&self, nbytes: usize) -> Result<Segment> {
        let segment = self.ephemeral.allocate(nbytes)?;
        self.register(segment)
    }

    /// Allocate a zeroed cache entry.
    pub fn cache_malloc(&self, nbytes: usize) -> Result<Segment> {
        let segment = self.cache.malloc(nbytes)?;
        self.register(segment)
    }

    /// Copy `data` into a new cache entry.
    pub fn cache_store(&self, data: &[u8]) -> Result<Segment> {
        let segment = self.cache.store(data)?;
        self.register(segment)
    }

    /// New cache entry of `size` bytes written by `fill`.
    pub fn cache_store_with<F>(&self, size: usize, fill: F) -> Result<Segment>
    where
        F: FnOnce(&mut [u8]),
    {
        let segment = self.cache.store_with(size, fill)?;
        self.register(segment)
    }

    /// Copy of cache entry `id`.
    pub fn cache_retrieve(&self, id: SegmentId) -> Result<Vec<u8>> {
        self.expect_tier(id, SegmentTag::Cache)?;
        self.cache.retrieve(id)
    }

    /// Replace cache entry `id` with `data`.
    pub fn cache_set(&self, id: SegmentId, data: &[u8]) -> Result<()> {
        self.replace_cache_entry(id, data.len(), || self.cache.set(id, data))
    }

    /// Replace cache entry `id` with `size` bytes written by `fill`.
    pub fn cache_set_with<F>(&self, id: SegmentId, size: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        self.replace_cache_entry(id, size, || self.cache.set_with(id, size, fill))
    }

    /// Run `replace` and record the new size with the table locked throughout,
    /// so the table never disagrees with the stored buffer.
    fn replace_cache_entry(
        &self,
        id: SegmentId,
        size: usize,
        replace: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let mut table = self.segments.lock();
        let segment = table.get_mut(&id).ok_or(Error::SegmentNotFound(id))?;
        if segment.tag() != SegmentTag::Cache {
            return Err(Error::TypeMismatch {
                id,
                expected: SegmentTag::Cache,
                actual: segment.tag(),
            });
        }
        replace()?;
        *segment = segment.clone().with_size(size);
        Ok(())
    }

    /// Receive `nbytes` from a peer through the handoff region and record the
    /// result as a cache segment. See [`CacheChannel::async_malloc`].
    pub fn async_malloc<F>(&self, nbytes: usize, publish: F) -> Result<Segment>
    where
        F: FnOnce(&SegmentDescriptor),
    {
        let segment = self.cache.async_malloc(nbytes, publish)?;
        self.register(segment)
    }

    /// Send cache entry `id` to a peer through the handoff region.
    pub fn async_retrieve<F>(&self, id: SegmentId, publish: F) -> Result<Segment>
    where
        F: FnOnce(&SegmentDescriptor),
    {
        self.expect_tier(id, SegmentTag::Cache)?;
        self.cache.async_retrieve(id, publish)
    }

    /// Free segment `id` through whichever tier produced it.
    ///
    /// The table entry is removed only if the tier's free succeeds.
    pub fn deallocate(&self, id: SegmentId) -> Result<()> {
        self.release(id, None)
    }

    /// Free `id`, which must be a static segment.
    pub fn static_dealloc(&self, id: SegmentId) -> Result<()> {
        self.release(id, Some(SegmentTag::Static))
    }

    /// Free `id`, which must be an ephemeral segment.
    pub fn instant_dealloc(&self, id: SegmentId) -> Result<()> {
        self.release(id, Some(SegmentTag::Ephemeral))
    }

    /// Free `id`, which must be a cache segment.
    pub fn cache_dealloc(&self, id: SegmentId) -> Result<()> {
        self.release(id, Some(SegmentTag::Cache))
    }

    fn release(&self, id: SegmentId, expected: Option<SegmentTag>) -> Result<()> {
        let mut table = self.segments.lock();
        let segment = table.get(&id).ok_or(Error::SegmentNotFound(id))?;
        if let Some(expected) = expected {
            if segment.tag() != expected {
                return Err(Error::TypeMismatch {
                    id,
                    expected,
                    actual: segment.tag(),
                });
            }
        }
        self.free_in_tier(segment)?;
        table.remove(&id);
        tracing::trace!("Manager {} released segment {}", self.name, id);
        Ok(())
    }

    fn free_in_tier(&self, segment: &Segment) -> Result<()> {
        match *segment.kind() {
            SegmentKind::Static { batch_id, .. } => self
                .batches
                .read()
                .get(batch_id)
                .ok_or(Error::SegmentNotFound(segment.id()))?
                .free(segment),
            SegmentKind::Ephemeral => self.ephemeral.free(segment),
            SegmentKind::Cache(_) => self.cache.free_segment(segment),
        }
    }

    /// Stamp the manager name and record the segment, rolling the allocation
    /// back if the table refuses it.
    fn register(&self, mut segment: Segment) -> Result<Segment> {
        segment.stamp(&self.name);
        let id = segment.id();

        let inserted = match self.segments.lock().entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(segment.clone());
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::DuplicatedKey(id)),
        };

        if let Err(e) = inserted {
            tracing::error!("Manager {}: {}; rolling back allocation", self.name, e);
            if let Err(free_err) = self.free_in_tier(&segment) {
                tracing::error!(
                    "Manager {}: rollback of segment {} failed: {}",
                    self.name,
                    id,
                    free_err
                );
            }
            return Err(Error::RegistrationFailed(id));
        }

        tracing::trace!(
            "Manager {} registered {} segment {} ({} bytes)",
            self.name,
            segment.tag(),
            id,
            segment.size()
        );
        Ok(segment)
    }

    /// Look up segment `id`.
    pub fn get(&self, id: SegmentId) -> Result<Segment> {
        self.segments
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::SegmentNotFound(id))
    }

    fn expect_tier(&self, id: SegmentId, expected: SegmentTag) -> Result<Segment> {
        let segment = self.get(id)?;
        if segment.tag() != expected {
            return Err(Error::TypeMismatch {
                id,
                expected,
                actual: segment.tag(),
            });
        }
        Ok(segment)
    }

    // =========================================================================
    // Creator-side data access
    // =========================================================================

    /// Copy `data` into segment `id` at `offset`.
    pub fn write(&self, id: SegmentId, offset: usize, data: &[u8]) -> Result<()> {
        let segment = self.get(id)?;
        let end = offset.checked_add(data.len());
        if end.is_none_or(|end| end > segment.size()) {
            return Err(Error::RangeError {
                offset,
                size: data.len(),
            });
        }

        match *segment.kind() {
            SegmentKind::Static { batch_id, .. } => {
                let batches = self.batches.read();
                let batch = batches
                    .get(batch_id)
                    .ok_or(Error::SegmentNotFound(id))?;
                batch.region().write_at(segment.offset() + offset, data)
            }
            SegmentKind::Ephemeral => self
                .ephemeral
                .region(id)
                .ok_or(Error::SegmentNotFound(id))?
                .write_at(offset, data),
            // The stored buffer may have been replaced since the lookup.
            SegmentKind::Cache(_) => self.cache.with_mut(id, |buf| {
                let dst = buf
                    .get_mut(offset..offset + data.len())
                    .ok_or(Error::RangeError {
                        offset,
                        size: data.len(),
                    })?;
                dst.copy_from_slice(data);
                Ok(())
            })?,
        }
    }

    /// Copy of segment `id`'s bytes.
    pub fn read(&self, id: SegmentId) -> Result<Vec<u8>> {
        let segment = self.get(id)?;
        match *segment.kind() {
            SegmentKind::Static { batch_id, .. } => {
                let batches = self.batches.read();
                let batch = batches
                    .get(batch_id)
                    .ok_or(Error::SegmentNotFound(id))?;
                batch.region().read_at(segment.offset(), segment.size())
            }
            SegmentKind::Ephemeral => self
                .ephemeral
                .region(id)
                .ok_or(Error::SegmentNotFound(id))?
                .read_at(0, segment.size()),
            SegmentKind::Cache(_) => self.cache.retrieve(id),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Manager name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Live segments across all tiers.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    /// Ids issued so far, including those of failed attempts.
    pub fn issued_ids(&self) -> u64 {
        self.counter.issued()
    }

    /// Batches in the static tier.
    pub fn batch_count(&self) -> usize {
        self.batches.read().len()
    }

    /// Bins per batch.
    pub fn batch_bin_count(&self) -> usize {
        self.config.geometry.len()
    }

    /// Bytes of region per batch.
    pub fn batch_bin_size(&self) -> usize {
        self.config.geometry.total_bytes()
    }

    /// Free chunks across every batch.
    pub fn static_chunk_left(&self) -> usize {
        self.batches.read().iter().map(Batch::chunk_left).sum()
    }

    pub fn cache(&self) -> &CacheChannel {
        &self.cache
    }

    pub fn ephemeral(&self) -> &EphemeralPool {
        &self.ephemeral
    }
}

impl Drop for PoolRouter {
    fn drop(&mut self) {
        let live = self.segments.get_mut().len();
        if live > 0 {
            tracing::debug!(
                "Dropping pool router {} with {} live segments",
                self.name,
                live
            );
        }
    }
}

impl std::fmt::Debug for PoolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRouter")
            .field("name", &self.name)
            .field("batches", &self.batch_count())
            .field("segments", &self.segment_count())
            .finish()
    }
}
