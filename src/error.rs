//! Error types for shmalloc.

use crate::segment::{SegmentId, SegmentTag};
use thiserror::Error;

/// Result type alias using shmalloc's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for allocator operations.
///
/// Every failure is reported to the immediate caller. Nothing here is fatal
/// to a [`PoolRouter`](crate::PoolRouter) except `InvalidConfig`, which is only
/// produced while constructing one.
#[derive(Error, Debug)]
pub enum Error {
    /// Capacity exhausted in the addressed pool or tier.
    #[error("out of memory: no room for {requested} bytes")]
    NoMemory {
        /// Bytes that were asked for.
        requested: usize,
    },

    /// No segment with this id is known to the component asked.
    #[error("segment {0} not found")]
    SegmentNotFound(SegmentId),

    /// The segment was addressed through the wrong tier.
    #[error("segment {id} belongs to the {actual} tier, not {expected}")]
    TypeMismatch {
        id: SegmentId,
        expected: SegmentTag,
        actual: SegmentTag,
    },

    /// A required source buffer was missing or empty.
    #[error("no source buffer supplied")]
    NullptrBuffer,

    /// A required segment was missing.
    #[error("no segment supplied")]
    NullptrSegment,

    /// Two segments were issued the same id.
    #[error("duplicated segment id {0}")]
    DuplicatedKey(SegmentId),

    /// Offset or size falls outside a pool's legal span.
    #[error("range [{offset}, {offset}+{size}) is outside the pool span")]
    RangeError { offset: usize, size: usize },

    /// Some chunk in the freed run is already free.
    #[error("double free of range [{offset}, {offset}+{size})")]
    DoubleFree { offset: usize, size: usize },

    /// A backing shared-memory region could not be created or attached.
    #[error("shared-memory region {name:?} unavailable: {source}")]
    RegionUnavailable {
        name: String,
        #[source]
        source: rustix::io::Errno,
    },

    /// Table insertion failed after a successful lower-level allocation.
    /// The allocation has already been rolled back.
    #[error("segment {0} could not be registered and was released")]
    RegistrationFailed(SegmentId),

    /// A segment with this id is already registered.
    #[error("segment {0} is already registered")]
    AlreadyExists(SegmentId),

    /// The request exceeds what the static tier will serve.
    #[error("{requested} bytes exceeds the static tier limit of {limit} bytes")]
    OversizedRequest { requested: usize, limit: usize },

    /// Zero-byte allocations are not served.
    #[error("zero-byte allocation requested")]
    ZeroSize,

    /// Construction-time misconfiguration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A descriptor could not be decoded or does not describe an attachable segment.
    #[error("invalid segment descriptor: {0}")]
    InvalidDescriptor(String),

    /// A handoff operation was requested on a channel in local mode.
    #[error("cache channel is not in handoff mode")]
    HandoffDisabled,

    /// The peer did not complete a handoff in time.
    #[error("handoff of segment {0} timed out")]
    HandoffTimeout(SegmentId),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this failure means "out of capacity here, try elsewhere".
    pub fn is_no_memory(&self) -> bool {
        matches!(self, Error::NoMemory { .. })
    }
}
