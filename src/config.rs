//! Manager configuration.

use crate::defaults;
use crate::error::{Error, Result};

/// Size-class layout of a batch: one bin per `(chunk_size, chunk_count)` pair.
///
/// Bin ids are declaration indices. A batch searches bins by descending
/// chunk size regardless of declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGeometry {
    chunk_sizes: Vec<usize>,
    chunk_counts: Vec<usize>,
}

impl Default for BatchGeometry {
    fn default() -> Self {
        Self {
            chunk_sizes: defaults::CHUNK_SIZES.to_vec(),
            chunk_counts: defaults::CHUNK_COUNTS.to_vec(),
        }
    }
}

impl BatchGeometry {
    /// Pair each chunk size with its count.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the arrays differ in length.
    pub fn new(chunk_sizes: Vec<usize>, chunk_counts: Vec<usize>) -> Result<Self> {
        if chunk_sizes.len() != chunk_counts.len() {
            return Err(Error::InvalidConfig(format!(
                "{} chunk sizes but {} chunk counts",
                chunk_sizes.len(),
                chunk_counts.len()
            )));
        }
        Ok(Self {
            chunk_sizes,
            chunk_counts,
        })
    }

    /// Every bin gets `chunk_count` chunks.
    pub fn uniform(chunk_sizes: Vec<usize>, chunk_count: usize) -> Self {
        let chunk_counts = vec![chunk_count; chunk_sizes.len()];
        Self {
            chunk_sizes,
            chunk_counts,
        }
    }

    /// Bins `min, min + step, ...`, `(max - min) / step` of them, each with
    /// `chunk_count` chunks.
    pub fn stepped(min: usize, max: usize, step: usize, chunk_count: usize) -> Result<Self> {
        if step == 0 || max <= min {
            return Err(Error::InvalidConfig(format!(
                "bad chunk size range {min}..{max} step {step}"
            )));
        }
        let sizes = (0..(max - min) / step).map(|i| min + i * step).collect();
        Ok(Self::uniform(sizes, chunk_count))
    }

    #[inline]
    pub fn chunk_sizes(&self) -> &[usize] {
        &self.chunk_sizes
    }

    #[inline]
    pub fn chunk_counts(&self) -> &[usize] {
        &self.chunk_counts
    }

    /// `(chunk_size, chunk_count)` per bin in declaration order.
    pub fn bins(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.chunk_sizes
            .iter()
            .copied()
            .zip(self.chunk_counts.iter().copied())
    }

    /// Number of bins.
    #[inline]
    pub fn len(&self) -> usize {
        self.chunk_sizes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunk_sizes.is_empty()
    }

    /// Largest chunk size, 0 when empty.
    pub fn max_chunk_size(&self) -> usize {
        self.chunk_sizes.iter().copied().max().unwrap_or(0)
    }

    /// Bytes of region one batch needs.
    pub fn total_bytes(&self) -> usize {
        self.bins().map(|(size, count)| size * count).sum()
    }

    /// Check the geometry is usable.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidConfig("batch geometry has no bins".into()));
        }
        if self.chunk_sizes.len() != self.chunk_counts.len() {
            return Err(Error::InvalidConfig(
                "chunk size and count arrays differ in length".into(),
            ));
        }
        for (bin, (size, count)) in self.bins().enumerate() {
            if size == 0 || size % defaults::ALIGNMENT != 0 {
                return Err(Error::InvalidConfig(format!(
                    "bin {bin}: chunk size {size} is not a positive multiple of {}",
                    defaults::ALIGNMENT
                )));
            }
            if count == 0 {
                return Err(Error::InvalidConfig(format!("bin {bin}: zero chunks")));
            }
        }
        Ok(())
    }
}

/// How the cache channel operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Process-local pooled store.
    #[default]
    Local,
    /// Local store plus a shared region of exchange areas for cross-process
    /// copy-in/copy-out.
    Handoff {
        /// Number of exchange areas.
        area_count: usize,
        /// Bytes per area.
        area_size: usize,
    },
}

impl CacheMode {
    /// Handoff mode with the default area geometry.
    pub fn handoff() -> Self {
        CacheMode::Handoff {
            area_count: defaults::AREA_COUNT,
            area_size: defaults::AREA_SIZE,
        }
    }
}

/// Configuration of one [`PoolRouter`](crate::PoolRouter).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Manager name. Prefix of every region name this manager creates.
    pub name: String,

    /// Requests at or below this size go to the cache channel.
    pub cache_threshold: usize,

    /// Requests at or above this size go to the ephemeral pool.
    pub instant_threshold: usize,

    /// Layout of every batch in the static tier.
    pub geometry: BatchGeometry,

    /// Cache channel operating mode.
    pub cache_mode: CacheMode,

    /// Byte cap for the cache channel's local store. `None` means unbounded.
    pub cache_capacity: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "shmalloc".to_string(),
            cache_threshold: defaults::CACHE_THRESHOLD,
            instant_threshold: defaults::INSTANT_THRESHOLD,
            geometry: BatchGeometry::default(),
            cache_mode: CacheMode::default(),
            cache_capacity: None,
        }
    }
}

impl ManagerConfig {
    /// Default configuration under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set both routing thresholds.
    pub fn with_thresholds(mut self, cache_threshold: usize, instant_threshold: usize) -> Self {
        self.cache_threshold = cache_threshold;
        self.instant_threshold = instant_threshold;
        self
    }

    /// Set the batch geometry.
    pub fn with_geometry(mut self, geometry: BatchGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Set the cache mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Cap the cache channel's local store.
    pub fn with_cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity = Some(bytes);
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "manager name {:?} must be non-empty and contain no '/'",
                self.name
            )));
        }
        if self.cache_threshold >= self.instant_threshold {
            return Err(Error::InvalidConfig(format!(
                "cache threshold {} must be below instant threshold {}",
                self.cache_threshold, self.instant_threshold
            )));
        }
        self.geometry.validate()?;
        if let CacheMode::Handoff {
            area_count,
            area_size,
        } = self.cache_mode
        {
            if area_count == 0 || area_size == 0 || area_size % defaults::ALIGNMENT != 0 {
                return Err(Error::InvalidConfig(format!(
                    "handoff areas {area_count} x {area_size} bytes are not usable"
                )));
            }
        }
        Ok(())
    }
}
