//! Overlap detection and dynamic adjustment.
//!
//! Two families of measurements feed the tracker. Stage 1 offsets (raw block
//! against raw block) describe how far apart repeated reads of the same audio
//! land, and size the search window (`dynoverlap`). Stage 2 offsets (verified
//! fragment against the root) reveal systematic drift, which is folded into
//! `dyndrift` and applied to every cached fragment at once.

use tracing::{debug, info};

use crate::{
    block::{CBlock, RootBlock, VFragment},
    cache::FragmentCache,
    constants::{
        MAX_DYNOVERLAP, MIN_SECTOR_EPSILON, MIN_WORDS_OVERLAP, MIN_WORDS_RIFT, MIN_WORDS_SEARCH,
        STATS_ADJUST_INTERVAL, STATS_DECAY_THRESHOLD,
    },
    gap::{overlap_forward, overlap_reverse},
    types::{ParanoiaCallback, Progress},
};

/// Running statistics of observed offsets for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetStats {
    /// Observations since the last decay
    pub offpoints: i64,
    /// Observations since the last adjustment
    pub newpoints: i64,
    /// Signed sum of offsets
    pub offaccum: i64,
    /// Sum of absolute offsets
    pub offdiff: i64,
    pub offmin: i64,
    pub offmax: i64,
    disabled: bool,
}

impl OffsetStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one observation.
    pub fn add(&mut self, value: i64) {
        if self.disabled {
            return;
        }
        self.offdiff += value.abs();
        self.offpoints += 1;
        self.newpoints += 1;
        self.offaccum += value;
        self.offmin = self.offmin.min(value);
        self.offmax = self.offmax.max(value);
    }

    /// Stop accepting observations for good.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Zero the accumulators, keeping the disabled state.
    pub fn reset(&mut self) {
        *self = Self {
            disabled: self.disabled,
            ..Self::default()
        };
    }
}

/// Which comparison an offset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Raw block against raw block
    Raw,
    /// Verified fragment against the root
    Root,
}

/// Dynamic overlap settings that adapt to drive behavior.
#[derive(Debug, Clone)]
pub struct DynamicOverlap {
    pub stage1: OffsetStats,
    pub stage2: OffsetStats,
    /// Current search width in samples
    dynoverlap: i64,
    /// Cumulative drift compensation in samples
    dyndrift: i64,
}

impl Default for DynamicOverlap {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicOverlap {
    /// Start wide open: no drive behavior has been observed yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stage1: OffsetStats::new(),
            stage2: OffsetStats::new(),
            dynoverlap: MAX_DYNOVERLAP,
            dyndrift: 0,
        }
    }

    #[must_use]
    pub fn dynoverlap(&self) -> i64 {
        self.dynoverlap
    }

    #[must_use]
    pub fn dyndrift(&self) -> i64 {
        self.dyndrift
    }

    /// Force the search width, clamped to the allowed range.
    pub fn set_dynoverlap(&mut self, words: i64) {
        self.dynoverlap = words.clamp(MIN_SECTOR_EPSILON, MAX_DYNOVERLAP);
    }

    /// Forget drift knowledge after a seek.
    pub fn reset_drift(&mut self) {
        self.dyndrift = 0;
        self.stage2.reset();
    }

    /// Record an observed offset and adjust settings when enough have
    /// accumulated.
    pub fn record(
        &mut self,
        stage: Stage,
        value: i64,
        cache: &mut FragmentCache,
        progress: &mut Progress<'_>,
    ) {
        let stats = match stage {
            Stage::Raw => &mut self.stage1,
            Stage::Root => &mut self.stage2,
        };
        if stats.is_disabled() {
            return;
        }
        stats.add(value);
        if stats.newpoints >= STATS_ADJUST_INTERVAL {
            self.adjust(cache, progress);
        }
    }

    fn adjust(&mut self, cache: &mut FragmentCache, progress: &mut Progress<'_>) {
        if self.stage2.offpoints >= STATS_ADJUST_INTERVAL {
            let mut av = self.stage2.offaccum / self.stage2.offpoints;
            if av.abs() > self.dynoverlap / 4 {
                av = av / MIN_SECTOR_EPSILON * MIN_SECTOR_EPSILON;
                progress.report(cache.root().end(), ParanoiaCallback::Drift);
                self.dyndrift += av;
                let released = cache.rebase(av, progress);
                info!(av, dyndrift = self.dyndrift, released, "drift correction");
                self.stage2.reset();
            }
        }

        if self.stage1.offpoints >= STATS_ADJUST_INTERVAL {
            let s = &mut self.stage1;
            let mut width = s.offdiff / s.offpoints * 3;
            width = width.max(-s.offmin * 3 / 2).max(s.offmax * 3 / 2);
            self.dynoverlap = width.clamp(MIN_SECTOR_EPSILON, MAX_DYNOVERLAP);
            progress.report(self.dynoverlap, ParanoiaCallback::Overlap);
            debug!(dynoverlap = self.dynoverlap, points = s.offpoints, "overlap adjusted");

            if s.offpoints > STATS_DECAY_THRESHOLD {
                s.offpoints = (s.offpoints as f64 / 1.2) as i64;
                s.offaccum = (s.offaccum as f64 / 1.2) as i64;
                s.offdiff = (s.offdiff as f64 / 1.2) as i64;
            }
            s.offmin = 0;
            s.offmax = 0;
            s.newpoints = 0;
        }
    }
}

/// A run of samples on which two raw blocks agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// First index of the run in the newer block
    pub start: usize,
    /// Index one past the run in the newer block
    pub end: usize,
    /// Position in the older block minus position in the newer one
    pub offset: i64,
}

/// Find every agreeing run between `new` and `old`, searching relative
/// offsets up to `dynoverlap` and preferring the one closest to zero.
///
/// No sync point is searched inside the index ranges of `new` listed in
/// `covered`, though a run found after one may extend back into it.
#[must_use]
pub fn find_runs(new: &CBlock, old: &CBlock, dynoverlap: i64, covered: &[(usize, usize)]) -> Vec<Run> {
    let mut runs = Vec::new();
    let search = MIN_WORDS_SEARCH as usize;
    if new.len() < search || old.len() < search {
        return runs;
    }

    let lo = (old.begin - dynoverlap - new.begin).max(0) as usize;
    let hi = ((old.end() + dynoverlap - new.begin).max(0) as usize).min(new.len() - search + 1);
    let step = MIN_WORDS_RIFT as usize;
    let mut floor = lo;
    let mut i = lo;

    while i < hi {
        if let Some(&(_, end)) = covered.iter().find(|&&(s, e)| i >= s && i < e) {
            i = end;
            continue;
        }

        let Some(j) = sync_point(new, old, i, dynoverlap) else {
            i += step;
            continue;
        };

        let back = overlap_reverse(&new.vector, &old.vector, i as i64, j as i64).max(0) as usize;
        let fwd = overlap_forward(&new.vector, &old.vector, i as i64, j as i64) as usize;
        let start = (i - back.min(i)).max(floor);
        let end = i + fwd;
        if end - start >= MIN_WORDS_OVERLAP as usize {
            runs.push(Run {
                start,
                end,
                offset: old.begin + j as i64 - (new.begin + i as i64),
            });
            floor = end;
            i = end;
        } else {
            i += step;
        }
    }
    runs
}

/// Index in `old` matching `new[i]` for at least `MIN_WORDS_SEARCH` samples.
fn sync_point(new: &CBlock, old: &CBlock, i: usize, dynoverlap: i64) -> Option<usize> {
    let search = MIN_WORDS_SEARCH;
    let abs = new.begin + i as i64;

    // zero offset first; it wins ties and is all a constant run can offer
    let j0 = abs - old.begin;
    if j0 >= 0
        && (j0 as usize) < old.len()
        && overlap_forward(&new.vector, &old.vector, i as i64, j0) >= search
    {
        return Some(j0 as usize);
    }
    if new.vector.get(i + 1) == Some(&new.vector[i]) {
        return None;
    }

    let lo = (abs - dynoverlap - old.begin).max(0) as usize;
    let hi = ((abs + dynoverlap + 1 - old.begin).max(0) as usize).min(old.len());
    old.sort()
        .candidates(new.vector[i], lo, hi)
        .filter(|&j| overlap_forward(&new.vector, &old.vector, i as i64, j as i64) >= search)
        .min_by_key(|&j| (old.begin + j as i64 - abs).abs())
}

/// Where a verified fragment lines up with the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Root position minus the fragment's claimed position
    pub offset: i64,
    /// Absolute root position where the agreeing window starts
    pub begin: i64,
}

/// Find `o` such that the fragment sample at absolute position `p` matches
/// the root sample at `p + o` for `MIN_WORDS_OVERLAP` samples.
///
/// The window sits at the start of the overlap so the merge can walk forward
/// across any rifts; when the head disagrees the root's tail is tried
/// instead. Offsets are tried outward from zero up to `dynoverlap`. Silence
/// standing in for skipped frames is never matched against.
#[must_use]
pub fn find_root_alignment(root: &RootBlock, frag: &VFragment, dynoverlap: i64) -> Option<Alignment> {
    let window = MIN_WORDS_OVERLAP;
    let verified_end = root.verified_end();
    if verified_end - root.begin < window || (frag.len() as i64) < window {
        return None;
    }

    let try_at = |offset: i64, tail: bool| {
        let begin = if tail {
            verified_end - window
        } else {
            (frag.begin + offset).max(root.begin)
        };
        let start = begin - offset - frag.begin;
        if begin + window > verified_end || start < 0 || start + window > frag.len() as i64 {
            return None;
        }
        let r = (begin - root.begin) as usize;
        let f = start as usize;
        let n = window as usize;
        (root.vector[r..r + n] == frag.vector[f..f + n]).then_some(Alignment { offset, begin })
    };

    [false, true].into_iter().find_map(|tail| {
        try_at(0, tail).or_else(|| (1..=dynoverlap).find_map(|d| try_at(d, tail).or_else(|| try_at(-d, tail))))
    })
}
