//! Cross-process copy-in/copy-out exchange over the cache region.
//!
//! The region `{manager}#cachbin` is laid out as:
//!
//! ```text
//! +----------------+-----------------+-----+-----------------+--------+-----+--------+
//! | RegionHeader   | AreaControl 0   | ... | AreaControl n-1 | area 0 | ... | area n-1|
//! | (64 bytes)     | (64 bytes each) |     |                 |        |     |        |
//! +----------------+-----------------+-----+-----------------+--------+-----+--------+
//! ```
//!
//! Each control block holds a lock word and a signal word. The lock word is
//! the area's mutex: taken by compare-and-swap when the owner reserves the
//! area and held for the whole cycle, so its value is the only occupancy
//! signal. The signal word plays the condition variable: it carries the cycle
//! state and both sides sleep on it with a process-shared futex.
//!
//! Inbound cycle (`handoff_malloc`): owner reserves, sets `AWAIT_DATA`,
//! publishes the descriptor; the peer moves it to `WRITING`, copies, sets
//! `DATA_READY`; the owner copies the bytes into local storage and releases.
//!
//! Outbound cycle (`handoff_retrieve`): owner reserves, copies local bytes in,
//! sets `AWAIT_CONSUME`, publishes; the peer moves it to `READING`, copies
//! out, sets `CONSUMED`; the owner releases.

use super::CacheChannel;
use crate::error::{Error, Result};
use crate::segment::{
    CacheLocator, Segment, SegmentDescriptor, SegmentId, SegmentKind, cache_region_name,
};
use crate::shm::SharedRegion;
use rustix::io::Errno;
use rustix::thread::futex;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// "shmcache" in ASCII.
const MAGIC: u64 = 0x7368_6d63_6163_6865;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

// Signal word states.
const IDLE: u32 = 0;
const AWAIT_DATA: u32 = 1;
const WRITING: u32 = 2;
const DATA_READY: u32 = 3;
const AWAIT_CONSUME: u32 = 4;
const READING: u32 = 5;
const CONSUMED: u32 = 6;

/// No segment occupies the area.
const NO_SEGMENT: u64 = u64::MAX;

#[repr(C, align(64))]
struct RegionHeader {
    magic: AtomicU64,
    area_count: AtomicU32,
    area_size: AtomicU32,
    /// Bumped on every area release. Reservers sleep on it when all areas are taken.
    release_seq: AtomicU32,
}

#[repr(C, align(64))]
struct AreaControl {
    lock: AtomicU32,
    signal: AtomicU32,
    len: AtomicU64,
    segment_id: AtomicU64,
}

impl AreaControl {
    /// Put the signal back to `state` after an aborted peer step and wake
    /// the owner, which may be waiting to cancel.
    fn revert(&self, state: u32) {
        self.signal.store(state, Ordering::Release);
        wake_all(&self.signal);
    }
}

/// Byte offsets of the handoff region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AreaLayout {
    pub area_count: usize,
    pub area_size: usize,
}

impl AreaLayout {
    fn control_offset(&self, area: usize) -> usize {
        size_of::<RegionHeader>() + area * size_of::<AreaControl>()
    }

    fn signal_offset(&self, area: usize) -> usize {
        self.control_offset(area) + offset_of!(AreaControl, signal)
    }

    fn data_start(&self) -> usize {
        self.control_offset(self.area_count)
            .next_multiple_of(align_of::<AreaControl>())
    }

    fn area_offset(&self, area: usize) -> usize {
        self.data_start() + area * self.area_size
    }

    fn total_bytes(&self) -> usize {
        self.area_offset(self.area_count)
    }

    /// Area whose data and signal word sit at these offsets.
    fn area_at(&self, area_offset: usize, signal_offset: usize) -> Option<usize> {
        let rel = area_offset.checked_sub(self.data_start())?;
        let area = rel / self.area_size;
        let exact = rel % self.area_size == 0 && area < self.area_count;
        (exact && self.signal_offset(area) == signal_offset).then_some(area)
    }

    fn locator(&self, area: usize) -> CacheLocator {
        CacheLocator::Area {
            area_offset: self.area_offset(area),
            signal_offset: self.signal_offset(area),
        }
    }
}

/// The mapped handoff region with typed access to its control words.
pub(crate) struct HandoffRegion {
    region: SharedRegion,
    layout: AreaLayout,
}

impl HandoffRegion {
    /// Create and initialize the region for `manager`.
    pub(crate) fn create(manager: &str, area_count: usize, area_size: usize) -> Result<Self> {
        let layout = AreaLayout {
            area_count,
            area_size,
        };
        let geometry = (u32::try_from(area_count), u32::try_from(area_size));
        let (Ok(count), Ok(size)) = geometry else {
            return Err(Error::InvalidConfig(format!(
                "handoff geometry {area_count} x {area_size} too large"
            )));
        };

        let region = SharedRegion::create(&cache_region_name(manager), layout.total_bytes())?;
        let this = Self { region, layout };

        let header = this.header();
        header.magic.store(0, Ordering::Relaxed);
        header.area_count.store(count, Ordering::Relaxed);
        header.area_size.store(size, Ordering::Relaxed);
        header.release_seq.store(0, Ordering::Relaxed);
        for area in 0..area_count {
            let ctl = this.control(area);
            ctl.lock.store(UNLOCKED, Ordering::Relaxed);
            ctl.signal.store(IDLE, Ordering::Relaxed);
            ctl.len.store(0, Ordering::Relaxed);
            ctl.segment_id.store(NO_SEGMENT, Ordering::Relaxed);
        }
        header.magic.store(MAGIC, Ordering::Release);

        tracing::debug!(
            "Created handoff region for {} ({} areas of {} bytes)",
            manager,
            area_count,
            area_size
        );
        Ok(this)
    }

    /// Attach the region created by `manager`'s cache channel.
    pub(crate) fn attach(manager: &str) -> Result<Self> {
        let region = SharedRegion::attach(&cache_region_name(manager))?;
        if region.len() < size_of::<RegionHeader>() {
            return Err(Error::InvalidDescriptor(format!(
                "handoff region of {manager} is truncated"
            )));
        }

        // SAFETY: the mapping is page aligned and at least one header long.
        let header = unsafe { &*region.as_ptr().as_ptr().cast::<RegionHeader>() };
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::InvalidDescriptor(format!(
                "region of {manager} is not an initialized handoff region"
            )));
        }
        let layout = AreaLayout {
            area_count: header.area_count.load(Ordering::Relaxed) as usize,
            area_size: header.area_size.load(Ordering::Relaxed) as usize,
        };
        if layout.area_count == 0 || layout.area_size == 0 || region.len() < layout.total_bytes()
        {
            return Err(Error::InvalidDescriptor(format!(
                "handoff region of {manager} has inconsistent geometry"
            )));
        }

        Ok(Self { region, layout })
    }

    pub(crate) fn layout(&self) -> AreaLayout {
        self.layout
    }

    fn header(&self) -> &RegionHeader {
        // SAFETY: offset 0 of a page-aligned mapping sized by the layout.
        unsafe { &*self.region.as_ptr().as_ptr().cast::<RegionHeader>() }
    }

    fn control(&self, area: usize) -> &AreaControl {
        debug_assert!(area < self.layout.area_count);
        // SAFETY: control blocks are 64-byte aligned and inside the mapping.
        unsafe {
            &*self
                .region
                .as_ptr()
                .as_ptr()
                .add(self.layout.control_offset(area))
                .cast::<AreaControl>()
        }
    }

    fn try_acquire(&self) -> Option<usize> {
        (0..self.layout.area_count).find(|&area| {
            self.control(area)
                .lock
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Take a free area, sleeping until one is released.
    fn acquire(&self) -> Result<usize> {
        let header = self.header();
        loop {
            let seq = header.release_seq.load(Ordering::Acquire);
            if let Some(area) = self.try_acquire() {
                return Ok(area);
            }
            tracing::trace!("All handoff areas busy, waiting for a release");
            wait_while(&header.release_seq, seq, None)?;
        }
    }

    fn release(&self, area: usize) {
        let ctl = self.control(area);
        ctl.segment_id.store(NO_SEGMENT, Ordering::Relaxed);
        ctl.len.store(0, Ordering::Relaxed);
        ctl.signal.store(IDLE, Ordering::Relaxed);
        ctl.lock.store(UNLOCKED, Ordering::Release);

        let header = self.header();
        header.release_seq.fetch_add(1, Ordering::Release);
        wake_all(&header.release_seq);
    }

    /// Areas currently reserved.
    pub(crate) fn busy_areas(&self) -> usize {
        (0..self.layout.area_count)
            .filter(|&area| self.control(area).lock.load(Ordering::Relaxed) == LOCKED)
            .count()
    }

    /// Area addressed by a descriptor, after checking it belongs to this region.
    fn locate(&self, desc: &SegmentDescriptor) -> Result<usize> {
        match desc.kind {
            SegmentKind::Cache(CacheLocator::Area {
                area_offset,
                signal_offset,
            }) => self
                .layout
                .area_at(area_offset, signal_offset)
                .ok_or_else(|| {
                    Error::InvalidDescriptor(format!(
                        "no handoff area at offset {area_offset} (signal {signal_offset})"
                    ))
                }),
            _ => Err(Error::InvalidDescriptor(format!(
                "segment {} is not a handoff segment",
                desc.id
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Peer writes, owner collects.
    Inbound,
    /// Owner wrote, peer collects.
    Outbound,
}

impl Direction {
    /// Signal state while the owner waits for the peer.
    fn waiting(self) -> u32 {
        match self {
            Direction::Inbound => AWAIT_DATA,
            Direction::Outbound => AWAIT_CONSUME,
        }
    }

    /// Signal state once the peer is done.
    fn done(self) -> u32 {
        match self {
            Direction::Inbound => DATA_READY,
            Direction::Outbound => CONSUMED,
        }
    }
}

/// A reserved handoff area whose descriptor has been issued but whose peer
/// has not finished yet.
///
/// Publish [`descriptor`](Self::descriptor) to the peer, then call
/// [`wait`](Self::wait). Dropping the handle before completion cancels the
/// cycle and frees the area.
#[must_use = "the area stays reserved until the handoff is waited on or dropped"]
pub struct PendingHandoff<'a> {
    channel: &'a CacheChannel,
    handoff: &'a HandoffRegion,
    area: usize,
    segment: Segment,
    direction: Direction,
    finished: bool,
}

impl<'a> PendingHandoff<'a> {
    /// Reserve an area for the peer to fill with `nbytes`.
    pub(super) fn inbound(
        channel: &'a CacheChannel,
        handoff: &'a HandoffRegion,
        id: SegmentId,
        nbytes: usize,
    ) -> Result<Self> {
        let area = handoff.acquire()?;
        let ctl = handoff.control(area);
        ctl.segment_id.store(id, Ordering::Relaxed);
        ctl.len.store(nbytes as u64, Ordering::Relaxed);
        ctl.signal.store(AWAIT_DATA, Ordering::Release);

        tracing::debug!("Handoff area {} reserved for inbound segment {}", area, id);
        Ok(Self::reserved(
            channel,
            handoff,
            area,
            id,
            nbytes,
            Direction::Inbound,
        ))
    }

    /// Reserve an area and copy `data` into it for the peer to collect.
    pub(super) fn outbound(
        channel: &'a CacheChannel,
        handoff: &'a HandoffRegion,
        id: SegmentId,
        data: &[u8],
    ) -> Result<Self> {
        let area = handoff.acquire()?;
        let layout = handoff.layout();
        if let Err(e) = handoff.region.write_at(layout.area_offset(area), data) {
            handoff.release(area);
            return Err(e);
        }
        let ctl = handoff.control(area);
        ctl.segment_id.store(id, Ordering::Relaxed);
        ctl.len.store(data.len() as u64, Ordering::Relaxed);
        ctl.signal.store(AWAIT_CONSUME, Ordering::Release);

        tracing::debug!("Handoff area {} loaded with outbound segment {}", area, id);
        Ok(Self::reserved(
            channel,
            handoff,
            area,
            id,
            data.len(),
            Direction::Outbound,
        ))
    }

    fn reserved(
        channel: &'a CacheChannel,
        handoff: &'a HandoffRegion,
        area: usize,
        id: SegmentId,
        size: usize,
        direction: Direction,
    ) -> Self {
        let segment = Segment::new(
            id,
            size,
            channel.manager_arc(),
            SegmentKind::Cache(handoff.layout().locator(area)),
        );
        Self {
            channel,
            handoff,
            area,
            segment,
            direction,
            finished: false,
        }
    }

    /// The handle to publish to the peer.
    pub fn descriptor(&self) -> SegmentDescriptor {
        self.segment.descriptor()
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Whether the peer has finished its side.
    pub fn is_signalled(&self) -> bool {
        self.handoff.control(self.area).signal.load(Ordering::Acquire) == self.direction.done()
    }

    /// Block until the peer finishes. No timeout.
    pub fn wait(self) -> Result<Segment> {
        self.wait_until(None)
    }

    /// Block until the peer finishes or `timeout` elapses.
    ///
    /// On timeout the cycle is cancelled and the area freed, unless the peer
    /// is already mid-copy, in which case the copy is allowed to finish.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Segment> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(mut self, deadline: Option<Instant>) -> Result<Segment> {
        let ctl = self.handoff.control(self.area);
        let waiting = self.direction.waiting();
        let done = self.direction.done();
        loop {
            let state = ctl.signal.load(Ordering::Acquire);
            if state == done {
                break;
            }
            if wait_while(&ctl.signal, state, deadline)? == Wake::TimedOut {
                let cancelled = ctl
                    .signal
                    .compare_exchange(waiting, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if cancelled {
                    tracing::warn!(
                        "Handoff of segment {} timed out in area {}",
                        self.segment.id(),
                        self.area
                    );
                    self.finish();
                    return Err(Error::HandoffTimeout(self.segment.id()));
                }
                // The peer is mid-copy: let it finish or abort, then re-check.
                let busy = ctl.signal.load(Ordering::Acquire);
                if busy != waiting && busy != done {
                    wait_while(&ctl.signal, busy, None)?;
                }
            }
        }

        if self.direction == Direction::Inbound {
            let len = ctl.len.load(Ordering::Acquire) as usize;
            let offset = self.handoff.layout().area_offset(self.area);
            let mut buf = self.channel.heap().acquire(len)?;
            let src = self
                .handoff
                .region
                .ptr_at(offset, len)
                .ok_or(Error::RangeError { offset, size: len })?;
            // SAFETY: the area is reserved by us and the peer has finished writing.
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), len);
            }
            self.channel.insert_local(self.segment.id(), buf)?;
            // The bytes now live in the local store, not the area.
            self.segment = Segment::new(
                self.segment.id(),
                len,
                self.channel.manager_arc(),
                SegmentKind::Cache(CacheLocator::Local),
            );
        }

        tracing::debug!(
            "Handoff of segment {} complete in area {}",
            self.segment.id(),
            self.area
        );
        self.finish();
        Ok(self.segment.clone())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.handoff.release(self.area);
        }
    }
}

impl Drop for PendingHandoff<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let ctl = self.handoff.control(self.area);
        let waiting = self.direction.waiting();
        let done = self.direction.done();
        loop {
            let state = ctl.signal.load(Ordering::Acquire);
            if state == done || state == IDLE {
                break;
            }
            if state == waiting {
                // Cancel; the peer can no longer claim the area.
                if ctl
                    .signal
                    .compare_exchange(waiting, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            // The peer is mid-copy; the area must not be reused under it.
            if wait_while(&ctl.signal, state, None).is_err() {
                break;
            }
        }
        tracing::debug!(
            "Handoff of segment {} abandoned in area {}",
            self.segment.id(),
            self.area
        );
        self.finish();
    }
}

impl std::fmt::Debug for PendingHandoff<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandoff")
            .field("area", &self.area)
            .field("segment", &self.segment.id())
            .field("direction", &self.direction)
            .finish()
    }
}

/// The other side of a handoff: attaches a manager's cache region by name
/// and serves descriptors published by its owner.
pub struct HandoffPeer {
    manager: String,
    region: HandoffRegion,
}

impl HandoffPeer {
    /// Attach the handoff region of `manager`.
    pub fn attach(manager: &str) -> Result<Self> {
        Ok(Self {
            manager: manager.to_string(),
            region: HandoffRegion::attach(manager)?,
        })
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn area_count(&self) -> usize {
        self.region.layout.area_count
    }

    pub fn area_size(&self) -> usize {
        self.region.layout.area_size
    }

    /// Copy `data` into the area an inbound descriptor points at and wake
    /// the owner.
    ///
    /// # Errors
    ///
    /// - `SegmentNotFound` if the area is not waiting for this segment
    /// - `RangeError` if `data` is larger than the descriptor's size
    pub fn deliver(&self, desc: &SegmentDescriptor, data: &[u8]) -> Result<()> {
        let area = self.claim(desc, AWAIT_DATA, WRITING)?;
        let ctl = self.region.control(area);
        let offset = self.region.layout.area_offset(area);

        let written = if data.len() > desc.size {
            Err(Error::RangeError {
                offset,
                size: data.len(),
            })
        } else {
            self.region.region.write_at(offset, data)
        };
        if let Err(e) = written {
            ctl.revert(AWAIT_DATA);
            return Err(e);
        }

        ctl.len.store(data.len() as u64, Ordering::Relaxed);
        ctl.signal.store(DATA_READY, Ordering::Release);
        wake_all(&ctl.signal);
        tracing::trace!("Delivered {} bytes for segment {}", data.len(), desc.id);
        Ok(())
    }

    /// Copy the bytes of an outbound descriptor out of its area and wake the
    /// owner.
    pub fn collect(&self, desc: &SegmentDescriptor) -> Result<Vec<u8>> {
        let area = self.claim(desc, AWAIT_CONSUME, READING)?;
        let ctl = self.region.control(area);
        let len = ctl.len.load(Ordering::Relaxed) as usize;

        let data = self
            .region
            .region
            .read_at(self.region.layout.area_offset(area), len);
        if data.is_err() {
            ctl.revert(AWAIT_CONSUME);
        } else {
            ctl.signal.store(CONSUMED, Ordering::Release);
            wake_all(&ctl.signal);
            tracing::trace!("Collected {} bytes of segment {}", len, desc.id);
        }
        data
    }

    /// Move the area's signal from `from` to `to` if it is serving `desc`.
    fn claim(&self, desc: &SegmentDescriptor, from: u32, to: u32) -> Result<usize> {
        if desc.manager != self.manager {
            return Err(Error::InvalidDescriptor(format!(
                "segment {} belongs to {}, not {}",
                desc.id, desc.manager, self.manager
            )));
        }
        let area = self.region.locate(desc)?;
        let ctl = self.region.control(area);
        if ctl
            .signal
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SegmentNotFound(desc.id));
        }
        if ctl.segment_id.load(Ordering::Relaxed) != desc.id {
            ctl.revert(from);
            return Err(Error::SegmentNotFound(desc.id));
        }
        Ok(area)
    }
}

impl std::fmt::Debug for HandoffPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffPeer")
            .field("manager", &self.manager)
            .field("layout", &self.region.layout)
            .finish()
    }
}

// =============================================================================
// Futex helpers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    /// The word changed or the sleep was interrupted; re-check it.
    Changed,
    TimedOut,
}

/// Sleep while `word == expected`, up to `deadline`.
fn wait_while(word: &AtomicU32, expected: u32, deadline: Option<Instant>) -> Result<Wake> {
    let timeout = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Wake::TimedOut);
            }
            Some(timespec(deadline - now))
        }
        None => None,
    };

    match futex::wait(word, futex::Flags::empty(), expected, timeout.as_ref()) {
        Ok(()) | Err(Errno::AGAIN) | Err(Errno::INTR) => Ok(Wake::Changed),
        Err(Errno::TIMEDOUT) => Ok(Wake::TimedOut),
        Err(e) => Err(e.into()),
    }
}

fn wake_all(word: &AtomicU32) {
    if let Err(e) = futex::wake(word, futex::Flags::empty(), i32::MAX as u32) {
        tracing::warn!("futex wake failed: {}", e);
    }
}

fn timespec(duration: Duration) -> futex::Timespec {
    futex::Timespec {
        tv_sec: duration.as_secs() as _,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::defaults::{AREA_COUNT, AREA_SIZE};
    use crate::segment::SegmentCounter;
    use crate::shm::test_region_name;
    use std::sync::{Arc, mpsc};
    use std::thread;

    #[test]
    fn test_layout_offsets() {
        let layout = AreaLayout {
            area_count: AREA_COUNT,
            area_size: AREA_SIZE,
        };
        assert_eq!(size_of::<RegionHeader>(), 64);
        assert_eq!(size_of::<AreaControl>(), 64);
        assert_eq!(layout.control_offset(0), 64);
        assert_eq!(layout.signal_offset(1), 128 + 4);
        assert_eq!(layout.data_start(), 64 + 8 * 64);
        assert_eq!(layout.area_offset(2), layout.data_start() + 2 * AREA_SIZE);
        assert_eq!(layout.total_bytes(), layout.data_start() + 8 * AREA_SIZE);

        assert_eq!(
            layout.area_at(layout.area_offset(3), layout.signal_offset(3)),
            Some(3)
        );
        assert_eq!(
            layout.area_at(layout.area_offset(3), layout.signal_offset(2)),
            None
        );
        assert_eq!(layout.area_at(layout.area_offset(3) + 8, 0), None);
        assert_eq!(layout.area_at(layout.total_bytes(), 0), None);
    }

    #[test]
    fn test_region_acquire_release() {
        let manager = test_region_name("handoff-region");
        let region = HandoffRegion::create(&manager, 2, 64).unwrap();

        let a = region.acquire().unwrap();
        let b = region.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(region.try_acquire(), None);
        assert_eq!(region.busy_areas(), 2);

        region.release(a);
        assert_eq!(region.try_acquire(), Some(a));
    }

    #[test]
    fn test_attach_reads_geometry() {
        let manager = test_region_name("handoff-attach");
        let _owner = HandoffRegion::create(&manager, 3, 256).unwrap();
        let peer = HandoffRegion::attach(&manager).unwrap();
        assert_eq!(
            peer.layout(),
            AreaLayout {
                area_count: 3,
                area_size: 256
            }
        );
    }

    #[test]
    fn test_attach_rejects_foreign_region() {
        let name = test_region_name("handoff-foreign");
        let _plain = SharedRegion::create(&cache_region_name(&name), 4096).unwrap();
        assert!(matches!(
            HandoffRegion::attach(&name),
            Err(Error::InvalidDescriptor(_))
        ));
    }

    fn handoff_channel(prefix: &str) -> CacheChannel {
        CacheChannel::new(
            Arc::from(test_region_name(prefix)),
            SegmentCounter::new(),
            CacheMode::handoff(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_drop_during_aborted_delivery() {
        let cache = handoff_channel("handoff-drop-abort");
        let pending = cache.handoff_malloc(8).unwrap();
        let ctl = cache.handoff.as_ref().unwrap().control(pending.area);

        // A peer has claimed the area and is copying.
        ctl.signal
            .compare_exchange(AWAIT_DATA, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                // The copy fails and the peer hands the area back.
                ctl.revert(AWAIT_DATA);
            });
            s.spawn(move || {
                drop(pending);
                tx.send(()).unwrap();
            });
            rx.recv_timeout(Duration::from_secs(5))
                .expect("drop must not hang on an aborted delivery");
        });
        assert_eq!(cache.busy_areas(), 0);
    }

    #[test]
    fn test_timeout_during_aborted_delivery() {
        let cache = handoff_channel("handoff-timeout-abort");
        let pending = cache.handoff_malloc(8).unwrap();
        let id = pending.segment().id();
        let ctl = cache.handoff.as_ref().unwrap().control(pending.area);
        ctl.signal
            .compare_exchange(AWAIT_DATA, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                ctl.revert(AWAIT_DATA);
            });
            let err = pending.wait_timeout(Duration::from_millis(10)).unwrap_err();
            assert!(matches!(err, Error::HandoffTimeout(got) if got == id));
        });
        assert_eq!(cache.busy_areas(), 0);
    }

    #[test]
    fn test_peer_overrun_keeps_area_claimable() {
        let cache = handoff_channel("handoff-overrun");
        let peer = HandoffPeer::attach(cache.manager()).unwrap();
        let pending = cache.handoff_malloc(4).unwrap();
        let desc = pending.descriptor();

        assert!(matches!(
            peer.deliver(&desc, b"too long"),
            Err(Error::RangeError { .. })
        ));
        drop(pending);
        assert_eq!(cache.busy_areas(), 0);
        assert!(matches!(
            peer.deliver(&desc, b"late"),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_wait_while_returns_on_mismatch() {
        let word = AtomicU32::new(5);
        assert_eq!(wait_while(&word, 4, None).unwrap(), Wake::Changed);
        let past = Instant::now() - Duration::from_millis(1);
        assert_eq!(wait_while(&word, 5, Some(past)).unwrap(), Wake::TimedOut);
    }
}
