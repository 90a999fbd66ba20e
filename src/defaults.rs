//! Default geometry and configuration constants.
//!
//! Chunk sizes, thresholds and handoff area geometry used when a
//! [`ManagerConfig`](crate::ManagerConfig) does not override them.
//!
//! # Design Rationale
//!
//! The default batch favours many small chunks and few large ones:
//! - Sub-4KB bins absorb control messages and small records
//! - 8KB to 48KB bins cover typical packet and audio-buffer sizes
//! - The largest bins cap the static tier at 8 x 128KB = 1MB, which is
//!   also where the ephemeral tier takes over

// =============================================================================
// Units
// =============================================================================

/// One kibibyte.
pub const KIB: usize = 1024;

/// One mebibyte.
pub const MIB: usize = 1024 * KIB;

// =============================================================================
// Alignment
// =============================================================================

/// Chunk sizes, pool offsets and handoff areas are multiples of this.
pub const ALIGNMENT: usize = 8;

/// A batch rejects requests above `STATIC_OVERSIZE_FACTOR * max_chunk_size`.
pub const STATIC_OVERSIZE_FACTOR: usize = 8;

// =============================================================================
// Routing thresholds
// =============================================================================

/// Requests at or below this size go to the cache channel.
pub const CACHE_THRESHOLD: usize = KIB;

/// Requests at or above this size go to the ephemeral pool.
pub const INSTANT_THRESHOLD: usize = MIB;

// =============================================================================
// Default batch geometry
// =============================================================================

/// Chunk size of each bin in a default batch, in declaration order.
pub const CHUNK_SIZES: [usize; 14] = [
    512,
    KIB,
    2 * KIB,
    4 * KIB,
    8 * KIB,
    12 * KIB,
    16 * KIB,
    24 * KIB,
    32 * KIB,
    48 * KIB,
    64 * KIB,
    80 * KIB,
    96 * KIB,
    128 * KIB,
];

/// Chunk count of each bin in a default batch.
pub const CHUNK_COUNTS: [usize; 14] = [64, 64, 64, 64, 64, 64, 64, 64, 50, 50, 50, 50, 32, 32];

// =============================================================================
// Cache channel
// =============================================================================

/// Number of exchange areas in a handoff region.
pub const AREA_COUNT: usize = 8;

/// Size of each exchange area in bytes.
pub const AREA_SIZE: usize = KIB;

/// Largest buffer the local heap pool keeps for reuse.
pub const HEAP_MAX_POOLED: usize = MIB;

/// Smallest size class of the local heap pool.
pub const HEAP_MIN_CLASS: usize = 16;

/// Idle buffers retained per size class.
pub const HEAP_BUFFERS_PER_CLASS: usize = 32;
