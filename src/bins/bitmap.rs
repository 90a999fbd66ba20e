//! Fixed-length chunk occupancy bitmap.

/// Bitmap tracking which chunks of a pool are free.
///
/// Each bit represents one chunk: 1 = free, 0 = occupied. The bitmap is a
/// plain owned value; callers serialize access (a [`ChunkPool`] keeps it
/// behind its lock).
///
/// # Performance
///
/// - `first_fit`: O(n/64) over fully-occupied words, O(n) bit steps otherwise
/// - `occupy` / `release`: O(run length)
///
/// [`ChunkPool`]: super::ChunkPool
#[derive(Clone, Debug)]
pub struct ChunkBitmap {
    /// 64-bit words, least significant bit first.
    words: Box<[u64]>,
    /// Number of chunks tracked (may be less than words.len() * 64).
    len: usize,
}

impl ChunkBitmap {
    /// Create a bitmap of `len` chunks, all free.
    pub fn new(len: usize) -> Self {
        let mut bitmap = Self {
            words: vec![0u64; len.div_ceil(64)].into_boxed_slice(),
            len,
        };
        bitmap.reset();
        bitmap
    }

    /// Mark every chunk free.
    pub fn reset(&mut self) {
        for word in self.words.iter_mut() {
            *word = u64::MAX;
        }
        let tail = self.len % 64;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
    }

    /// Number of chunks tracked.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether chunk `idx` is free. Out-of-range chunks are never free.
    #[inline]
    pub fn is_free(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Count free chunks.
    pub fn count_free(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Start of the first run of `run` consecutive free chunks.
    pub fn first_fit(&self, run: usize) -> Option<usize> {
        if run == 0 || run > self.len {
            return None;
        }

        let mut start = 0;
        let mut found = 0;
        let mut idx = 0;
        while idx < self.len {
            // Skip whole occupied words.
            if idx % 64 == 0 && self.words[idx / 64] == 0 {
                idx += 64;
                found = 0;
                start = idx;
                continue;
            }

            if self.is_free(idx) {
                if found == 0 {
                    start = idx;
                }
                found += 1;
                if found == run {
                    return Some(start);
                }
            } else {
                found = 0;
            }
            idx += 1;
        }

        None
    }

    /// Whether every chunk in `start..start + run` is occupied.
    pub fn all_occupied(&self, start: usize, run: usize) -> bool {
        (start..start + run).all(|idx| idx < self.len && !self.is_free(idx))
    }

    /// Mark `start..start + run` occupied.
    ///
    /// # Panics
    ///
    /// Panics if the run extends past the end of the bitmap.
    pub fn occupy(&mut self, start: usize, run: usize) {
        assert!(start + run <= self.len, "chunk run out of bounds");
        for idx in start..start + run {
            self.words[idx / 64] &= !(1u64 << (idx % 64));
        }
    }

    /// Mark `start..start + run` free.
    ///
    /// # Panics
    ///
    /// Panics if the run extends past the end of the bitmap.
    pub fn release(&mut self, start: usize, run: usize) {
        assert!(start + run <= self.len, "chunk run out of bounds");
        for idx in start..start + run {
            self.words[idx / 64] |= 1u64 << (idx % 64);
        }
    }
}
