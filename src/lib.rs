//! # shmalloc
//!
//! A multi-tier shared-memory allocator.
//!
//! Requests are routed by size to one of three tiers, all backed by named
//! POSIX shared memory so that another process can attach the same bytes:
//!
//! - **Cache**: small objects, pooled process-locally, or exchanged with a
//!   peer process through a fixed set of handoff areas
//! - **Static**: fixed-size chunks tracked by bitmaps inside batch regions,
//!   growing by whole batches on exhaustion
//! - **Ephemeral**: one dedicated region per large request
//!
//! Segments are identified by ids drawn from one counter, so freeing needs
//! only the id. A [`SegmentDescriptor`] is the serializable handle another
//! process hands to its own [`SegmentManager`] to obtain a local pointer.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmalloc::prelude::*;
//!
//! // Producer
//! let router = PoolRouter::new(ManagerConfig::new("camera"))?;
//! let seg = router.allocate(64 * 1024)?;
//! router.write(seg.id(), 0, &frame)?;
//! send(seg.descriptor().to_bytes()?);
//!
//! // Consumer, in another process
//! let manager = SegmentManager::new("encoder");
//! let local = manager.register(&SegmentDescriptor::from_bytes(&received)?)?;
//! let (ptr, len) = manager.bufferize_segment(&local)?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bins;
pub mod config;
pub mod defaults;
pub mod error;
pub mod registry;
pub mod router;
pub mod segment;
pub mod shm;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{BatchGeometry, CacheMode, ManagerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::registry::{LocalSegment, SegmentManager};
    pub use crate::router::PoolRouter;
    pub use crate::segment::{Segment, SegmentDescriptor, SegmentId, SegmentTag};
}

pub use bins::{
    Batch, CacheChannel, ChunkBitmap, ChunkPool, EphemeralPool, HandoffPeer, HeapPool, HeapStats,
    PendingHandoff,
};
pub use config::{BatchGeometry, CacheMode, ManagerConfig};
pub use error::{Error, Result};
pub use registry::{LocalSegment, SegmentManager};
pub use router::PoolRouter;
pub use segment::{
    CacheLocator, Segment, SegmentCounter, SegmentDescriptor, SegmentId, SegmentKind, SegmentTag,
};
pub use shm::SharedRegion;
