//! Allocation tiers.
//!
//! - [`ChunkPool`] and [`Batch`]: the static tier, fixed chunks in a shared batch region
//! - [`EphemeralPool`]: one dedicated region per segment
//! - [`CacheChannel`]: small objects, locally pooled or handed off between processes

mod batch;
mod bitmap;
pub mod cache;
mod ephemeral;
mod pool;

pub use batch::Batch;
pub use bitmap::ChunkBitmap;
pub use cache::{CacheChannel, HandoffPeer, HeapPool, HeapStats, PendingHandoff};
pub use ephemeral::EphemeralPool;
pub use pool::ChunkPool;
