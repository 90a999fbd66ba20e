//! Small-object cache channel.
//!
//! Two modes share one contract:
//!
//! - **Local**: bytes are copied into pooled process-local buffers
//!   ([`HeapPool`]) keyed by segment id. Nothing is visible to other
//!   processes.
//! - **Handoff**: the local store, plus a shared region of fixed exchange
//!   areas used to move one payload at a time to or from a peer process
//!   (see [`handoff`]).

pub mod handoff;
mod heap;

pub use handoff::{HandoffPeer, PendingHandoff};
pub use heap::{HeapPool, HeapStats};

use crate::config::CacheMode;
use crate::error::{Error, Result};
use crate::segment::{
    CacheLocator, Segment, SegmentCounter, SegmentDescriptor, SegmentId, SegmentKind, SegmentTag,
};
use handoff::HandoffRegion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Process-local store for small segments, optionally with a cross-process
/// handoff region.
///
/// # Example
///
/// ```rust,ignore
/// use shmalloc::{CacheChannel, SegmentCounter};
///
/// let cache = CacheChannel::local("demo".into(), SegmentCounter::new());
/// let seg = cache.store(b"hello")?;
/// assert_eq!(cache.retrieve(seg.id())?, b"hello");
/// cache.free(seg.id())?;
/// ```
pub struct CacheChannel {
    manager: Arc<str>,
    counter: SegmentCounter,
    heap: HeapPool,
    entries: Mutex<HashMap<SegmentId, Vec<u8>>>,
    handoff: Option<HandoffRegion>,
}

impl CacheChannel {
    /// Create a channel in `mode`. Handoff mode creates `{manager}#cachbin`.
    pub fn new(
        manager: Arc<str>,
        counter: SegmentCounter,
        mode: CacheMode,
        capacity: Option<usize>,
    ) -> Result<Self> {
        let handoff = match mode {
            CacheMode::Local => None,
            CacheMode::Handoff {
                area_count,
                area_size,
            } => Some(HandoffRegion::create(&manager, area_count, area_size)?),
        };
        Ok(Self {
            manager,
            counter,
            heap: HeapPool::new(capacity),
            entries: Mutex::new(HashMap::new()),
            handoff,
        })
    }

    /// Unbounded channel in local mode.
    pub fn local(manager: Arc<str>, counter: SegmentCounter) -> Self {
        Self {
            manager,
            counter,
            heap: HeapPool::default(),
            entries: Mutex::new(HashMap::new()),
            handoff: None,
        }
    }

    /// Allocate a zeroed entry of `size` bytes.
    pub fn malloc(&self, size: usize) -> Result<Segment> {
        self.store_with(size, |_| {})
    }

    /// Copy `data` into a new entry.
    pub fn store(&self, data: &[u8]) -> Result<Segment> {
        if data.is_empty() {
            // Still consumes an id, like every other allocate path.
            self.counter.next_id();
            return Err(Error::NullptrBuffer);
        }
        self.store_with(data.len(), |buf| buf.copy_from_slice(data))
    }

    /// Allocate `size` bytes and let `fill` write them.
    pub fn store_with<F>(&self, size: usize, fill: F) -> Result<Segment>
    where
        F: FnOnce(&mut [u8]),
    {
        let id = self.counter.next_id();
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let mut buf = self.heap.acquire(size)?;
        fill(buf.as_mut_slice());
        self.insert_local(id, buf)?;

        tracing::trace!("Cache stored segment {} ({} bytes)", id, size);
        Ok(Segment::new(
            id,
            size,
            Arc::clone(&self.manager),
            SegmentKind::Cache(CacheLocator::Local),
        ))
    }

    pub(crate) fn insert_local(&self, id: SegmentId, buf: Vec<u8>) -> Result<()> {
        match self.entries.lock().entry(id) {
            Entry::Occupied(_) => {
                tracing::error!("Cache segment {} issued twice", id);
                self.heap.recycle(buf);
                Err(Error::DuplicatedKey(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(buf);
                Ok(())
            }
        }
    }

    /// Copy of the bytes stored under `id`.
    pub fn retrieve(&self, id: SegmentId) -> Result<Vec<u8>> {
        self.with(id, <[u8]>::to_vec)
    }

    /// Borrow the bytes stored under `id`.
    pub fn with<R>(&self, id: SegmentId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let entries = self.entries.lock();
        let buf = entries.get(&id).ok_or(Error::SegmentNotFound(id))?;
        Ok(f(buf.as_slice()))
    }

    /// Mutably borrow the bytes stored under `id`. The size cannot change.
    pub fn with_mut<R>(&self, id: SegmentId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut entries = self.entries.lock();
        let buf = entries.get_mut(&id).ok_or(Error::SegmentNotFound(id))?;
        Ok(f(buf.as_mut_slice()))
    }

    /// Replace the bytes stored under `id`.
    pub fn set(&self, id: SegmentId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::NullptrBuffer);
        }
        self.set_with(id, data.len(), |buf| buf.copy_from_slice(data))
    }

    /// Replace the entry under `id` with `size` bytes written by `fill`.
    pub fn set_with<F>(&self, id: SegmentId, size: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        if !self.contains(id) {
            return Err(Error::SegmentNotFound(id));
        }

        let mut buf = self.heap.acquire(size)?;
        fill(buf.as_mut_slice());

        let old = match self.entries.lock().get_mut(&id) {
            Some(slot) => std::mem::replace(slot, buf),
            // Freed while we were filling.
            None => {
                self.heap.recycle(buf);
                return Err(Error::SegmentNotFound(id));
            }
        };
        self.heap.recycle(old);
        Ok(())
    }

    /// Drop the entry under `id`.
    pub fn free(&self, id: SegmentId) -> Result<()> {
        let buf = self
            .entries
            .lock()
            .remove(&id)
            .ok_or(Error::SegmentNotFound(id))?;
        self.heap.recycle(buf);
        Ok(())
    }

    /// [`free`](Self::free) after checking the segment is a cache segment.
    pub fn free_segment(&self, segment: &Segment) -> Result<()> {
        if segment.tag() != SegmentTag::Cache {
            return Err(Error::TypeMismatch {
                id: segment.id(),
                expected: SegmentTag::Cache,
                actual: segment.tag(),
            });
        }
        self.free(segment.id())
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Size of the entry under `id`.
    pub fn size_of(&self, id: SegmentId) -> Option<usize> {
        self.entries.lock().get(&id).map(Vec::len)
    }

    /// Entries currently stored.
    pub fn segment_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().map(|(_, buf)| buf).collect();
        for buf in drained {
            self.heap.recycle(buf);
        }
    }

    pub fn heap(&self) -> &HeapPool {
        &self.heap
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub(crate) fn manager_arc(&self) -> Arc<str> {
        Arc::clone(&self.manager)
    }

    pub fn is_handoff(&self) -> bool {
        self.handoff.is_some()
    }

    /// Number of exchange areas, in handoff mode.
    pub fn area_count(&self) -> Option<usize> {
        self.handoff.as_ref().map(|h| h.layout().area_count)
    }

    /// Bytes per exchange area, in handoff mode.
    pub fn area_size(&self) -> Option<usize> {
        self.handoff.as_ref().map(|h| h.layout().area_size)
    }

    /// Exchange areas currently reserved.
    pub fn busy_areas(&self) -> usize {
        self.handoff.as_ref().map_or(0, HandoffRegion::busy_areas)
    }

    // =========================================================================
    // Handoff
    // =========================================================================

    fn handoff_region(&self) -> Result<&HandoffRegion> {
        self.handoff.as_ref().ok_or(Error::HandoffDisabled)
    }

    /// Reserve an area for a peer to fill with `nbytes`.
    ///
    /// Blocks while every area is busy. The returned handle's descriptor is
    /// valid before any data has arrived.
    pub fn handoff_malloc(&self, nbytes: usize) -> Result<PendingHandoff<'_>> {
        let handoff = self.handoff_region()?;
        let id = self.counter.next_id();
        if nbytes == 0 {
            return Err(Error::ZeroSize);
        }
        if nbytes > handoff.layout().area_size {
            return Err(Error::NoMemory { requested: nbytes });
        }
        PendingHandoff::inbound(self, handoff, id, nbytes)
    }

    /// Copy the entry under `id` into an area for a peer to collect.
    pub fn handoff_retrieve(&self, id: SegmentId) -> Result<PendingHandoff<'_>> {
        let handoff = self.handoff_region()?;
        let size = self.size_of(id).ok_or(Error::SegmentNotFound(id))?;
        if size > handoff.layout().area_size {
            return Err(Error::NoMemory { requested: size });
        }
        // Copy out first: reserving may block and must not hold the entry lock.
        let data = self.retrieve(id)?;
        PendingHandoff::outbound(self, handoff, id, &data)
    }

    /// Receive `nbytes` from a peer.
    ///
    /// `publish` gets the descriptor before any data moves and must hand it
    /// to the peer. Returns once the peer has delivered and the bytes are
    /// stored locally under the segment's id.
    pub fn async_malloc<F>(&self, nbytes: usize, publish: F) -> Result<Segment>
    where
        F: FnOnce(&SegmentDescriptor),
    {
        let pending = self.handoff_malloc(nbytes)?;
        publish(&pending.descriptor());
        pending.wait()
    }

    /// Send the entry under `id` to a peer and wait until it has been
    /// collected.
    pub fn async_retrieve<F>(&self, id: SegmentId, publish: F) -> Result<Segment>
    where
        F: FnOnce(&SegmentDescriptor),
    {
        let pending = self.handoff_retrieve(id)?;
        publish(&pending.descriptor());
        pending.wait()
    }
}

impl std::fmt::Debug for CacheChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheChannel")
            .field("manager", &self.manager)
            .field("segments", &self.segment_count())
            .field("handoff", &self.is_handoff())
            .finish()
    }
}
