//! Fast sample value lookup using hash table indexing.
//!
//! A 65536-bucket table gives O(1) average lookup of every position holding a
//! given 16-bit sample value. Stage-1 verification uses it to find candidate
//! alignments between a fresh raw fragment and older ones without scanning
//! every relative offset.
//!
//! The index stores positions relative to the start of the indexed vector, so
//! it stays valid when the owning fragment is re-based by a drift correction.

/// Number of buckets in the hash table (one per possible 16-bit value)
const NUM_BUCKETS: usize = 1 << 16;

/// End-of-chain marker.
const NONE: u32 = u32::MAX;

/// Value index over one fragment's samples.
#[derive(Debug, Clone)]
pub struct SortInfo {
    /// Most recent (highest) position for each value
    heads: Box<[u32]>,
    /// Next lower position holding the same value
    links: Vec<u32>,
}

impl SortInfo {
    /// Index `vector`.
    #[must_use]
    pub fn new(vector: &[i16]) -> Self {
        let mut heads = vec![NONE; NUM_BUCKETS].into_boxed_slice();
        let mut links = Vec::with_capacity(vector.len());
        for (idx, &sample) in vector.iter().enumerate() {
            let bucket = sample_to_bucket(sample);
            links.push(heads[bucket]);
            heads[bucket] = idx as u32;
        }
        Self { heads, links }
    }

    /// Number of indexed samples.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Positions in `[lo, hi)` holding `value`, highest first.
    #[must_use]
    pub fn candidates(&self, value: i16, lo: usize, hi: usize) -> Candidates<'_> {
        Candidates {
            links: &self.links,
            current: self.heads[sample_to_bucket(value)],
            lo,
            hi,
        }
    }
}

/// Convert a 16-bit sample value to a bucket index (0-65535).
#[inline]
fn sample_to_bucket(sample: i16) -> usize {
    (i32::from(sample) + 32768) as usize
}

/// Iterator over positions matching a sample value.
pub struct Candidates<'a> {
    links: &'a [u32],
    current: u32,
    lo: usize,
    hi: usize,
}

impl Iterator for Candidates<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.current != NONE {
            let idx = self.current as usize;
            if idx < self.lo {
                // chains run downward; nothing below lo can match
                self.current = NONE;
                return None;
            }
            self.current = self.links[idx];
            if idx < self.hi {
                return Some(idx);
            }
        }
        None
    }
}
