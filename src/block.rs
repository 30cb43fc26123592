//! Data block structures for caching and verification.
//!
//! All positions are absolute sample-word offsets on the disc, corrected by
//! the session's current drift estimate.

use crate::{cache::BlockHandle, constants::CD_FRAMEWORDS, isort::SortInfo, types::Lsn};

/// Raw CD read cache block.
///
/// One contiguous run of samples exactly as the drive returned it, plus a
/// value index for stage-1 matching.
#[derive(Debug)]
pub struct CBlock {
    /// Raw 16-bit audio samples
    pub vector: Vec<i16>,
    /// Absolute position in samples
    pub begin: i64,
    /// Last sector number covered by this block
    pub last_sector: Lsn,
    sort: SortInfo,
}

impl CBlock {
    /// Create a cache block from raw sector data.
    #[must_use]
    pub fn new(vector: Vec<i16>, begin: i64, last_sector: Lsn) -> Self {
        let sort = SortInfo::new(&vector);
        Self {
            vector,
            begin,
            last_sector,
            sort,
        }
    }

    /// Get the number of samples in this block.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.vector.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Get the ending position (exclusive) of this block.
    #[inline]
    #[must_use]
    pub fn end(&self) -> i64 {
        self.begin + self.vector.len() as i64
    }

    #[must_use]
    pub fn sort(&self) -> &SortInfo {
        &self.sort
    }
}

/// Verified data fragment.
///
/// A run of samples on which two independent raw reads agreed, waiting to be
/// merged into the root.
#[derive(Debug, Clone)]
pub struct VFragment {
    /// Verified 16-bit audio samples
    pub vector: Vec<i16>,
    /// Absolute position in samples
    pub begin: i64,
    /// Last sector covered by this fragment
    pub last_sector: Lsn,
    /// Raw block the samples were taken from
    pub one: Option<BlockHandle>,
    /// Stage-1 offset between the two reads that agreed on these samples
    pub offset: i64,
}

impl VFragment {
    /// Create a fragment from the `[start, end)` index range of `block`.
    #[must_use]
    pub fn from_block(block: &CBlock, handle: BlockHandle, start: usize, end: usize, offset: i64) -> Self {
        Self {
            vector: block.vector[start..end].to_vec(),
            begin: block.begin + start as i64,
            last_sector: block.last_sector,
            one: Some(handle),
            offset,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.vector.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Get the ending position (exclusive).
    #[inline]
    #[must_use]
    pub fn end(&self) -> i64 {
        self.begin + self.vector.len() as i64
    }

    /// Check if a position falls within this fragment.
    #[inline]
    #[must_use]
    pub fn contains(&self, pos: i64) -> bool {
        pos >= self.begin && pos < self.end()
    }
}

/// Root block containing the verified output data.
///
/// Grows at its end as fragments are merged and shrinks at its start as the
/// cache is trimmed. Samples before `returned_limit` have been handed to the
/// caller and are never edited again.
#[derive(Debug, Default)]
pub struct RootBlock {
    /// Verified audio samples ready for output
    pub vector: Vec<i16>,
    /// Starting position in samples
    pub begin: i64,
    /// Position up to which data has been returned
    pub returned_limit: i64,
    /// Last sector covered
    pub last_sector: Lsn,
    /// Silent stand-in for skipped frames, as `[begin, end)`
    pub skipped: Option<(i64, i64)>,
}

impl RootBlock {
    /// Create a new root block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.vector.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Get the ending position (exclusive).
    #[inline]
    #[must_use]
    pub fn end(&self) -> i64 {
        self.begin + self.vector.len() as i64
    }

    /// End of the verified samples; a skipped region at the tail is not
    /// counted.
    #[must_use]
    pub fn verified_end(&self) -> i64 {
        match self.skipped {
            Some((begin, end)) if end == self.end() => begin,
            _ => self.end(),
        }
    }

    /// Check if `[begin, end)` is present in the root.
    #[must_use]
    pub fn covers(&self, begin: i64, end: i64) -> bool {
        !self.is_empty() && begin >= self.begin && end <= self.end()
    }

    /// Replace the contents with a fresh run of samples.
    pub fn set(&mut self, vector: Vec<i16>, begin: i64, last_sector: Lsn) {
        self.vector = vector;
        self.begin = begin;
        self.last_sector = last_sector;
        self.returned_limit = begin;
        self.skipped = None;
    }

    /// Append samples at the end.
    pub fn append(&mut self, samples: &[i16]) {
        self.vector.extend_from_slice(samples);
    }

    /// Insert samples at absolute position `pos`.
    pub fn insert(&mut self, pos: i64, samples: &[i16]) {
        let at = (pos - self.begin) as usize;
        self.vector.splice(at..at, samples.iter().copied());
    }

    /// Remove `count` samples starting at absolute position `pos`.
    pub fn remove(&mut self, pos: i64, count: usize) {
        let at = (pos - self.begin) as usize;
        let end = (at + count).min(self.vector.len());
        self.vector.drain(at..end);
    }

    /// Drop everything from absolute position `pos` on.
    pub fn truncate_at(&mut self, pos: i64) {
        self.vector.truncate((pos - self.begin).max(0) as usize);
    }

    /// Drop everything before absolute position `pos`.
    pub fn remove_prefix(&mut self, pos: i64) {
        let count = ((pos - self.begin).max(0) as usize).min(self.vector.len());
        self.vector.drain(..count);
        self.begin += count as i64;
    }

    /// Clear the root block.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Extract a frame of audio data starting at the given position.
    ///
    /// Returns `CD_FRAMEWORDS` samples if available.
    #[must_use]
    pub fn extract_frame(&self, pos: i64) -> Option<&[i16]> {
        if !self.covers(pos, pos + CD_FRAMEWORDS as i64) {
            return None;
        }
        let start = (pos - self.begin) as usize;
        Some(&self.vector[start..start + CD_FRAMEWORDS])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cblock_creation() {
        let block = CBlock::new(vec![1i16, 2, 3, 4, 5], 100, 0);
        assert_eq!(block.len(), 5);
        assert_eq!(block.begin, 100);
        assert_eq!(block.end(), 105);
        assert_eq!(block.sort().len(), 5);
    }

    #[test]
    fn test_root_edits() {
        let mut root = RootBlock::new();
        assert!(root.extract_frame(0).is_none());

        root.set((0..10).collect(), 50, 0);
        assert_eq!(root.returned_limit, 50);
        root.insert(52, &[-1, -2]);
        assert_eq!(&root.vector[..5], &[0, 1, -1, -2, 2]);
        root.remove(52, 2);
        assert_eq!(root.vector, (0..10).collect::<Vec<i16>>());

        root.remove_prefix(53);
        assert_eq!(root.begin, 53);
        assert_eq!(root.vector[0], 3);
        root.truncate_at(55);
        assert_eq!(root.end(), 55);
        root.append(&[7, 8]);
        assert_eq!(root.end(), 57);

        root.skipped = Some((55, 57));
        assert_eq!(root.verified_end(), 55);
        root.append(&[9]);
        assert_eq!(root.verified_end(), 58);

        root.clear();
        assert!(root.is_empty());
        assert_eq!(root.skipped, None);
        assert_eq!(root.begin, 0);
    }

    #[test]
    fn test_root_extract_frame() {
        let mut root = RootBlock::new();
        root.set(vec![3; 2 * CD_FRAMEWORDS], 0, 1);
        assert_eq!(root.extract_frame(CD_FRAMEWORDS as i64).map(<[i16]>::len), Some(CD_FRAMEWORDS));
        assert!(root.extract_frame(CD_FRAMEWORDS as i64 + 1).is_none());
    }
}
