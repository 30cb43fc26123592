//! Gap and rift analysis algorithms.
//!
//! This module implements the analysis of discontinuities (rifts) between
//! two runs of audio that otherwise agree. Rifts occur due to:
//!
//! - Dropped samples (one read lacks data the other has)
//! - Stuttering (one read repeats data)
//! - Garbage (corrupted data between two agreeing regions)
//!
//! All offsets are indices into the slices passed in. Analysis results use a
//! sign convention: a positive `a`/`b` says that many samples must be skipped
//! in the *other* buffer to resync, a negative one says that many samples must
//! be removed from the buffer itself.

use crate::constants::MIN_WORDS_RIFT;

/// Count how many consecutive samples agree starting at the offsets.
///
/// The comparison includes `a[off_a]` / `b[off_b]` and stops at the first
/// mismatch or at the end of either buffer.
#[must_use]
pub fn overlap_forward(a: &[i16], b: &[i16], off_a: i64, off_b: i64) -> i64 {
    if off_a < 0 || off_b < 0 {
        return 0;
    }
    let a = a.get(off_a as usize..).unwrap_or_default();
    let b = b.get(off_b as usize..).unwrap_or_default();
    a.iter().zip(b).take_while(|(x, y)| x == y).count() as i64
}

/// Count how many samples agree *before* the offsets, given that the samples
/// at the offsets themselves agree.
///
/// Returns -1 if `a[off_a] != b[off_b]` (or either offset is out of range);
/// the run is open-ended toward index zero.
#[must_use]
pub fn overlap_reverse(a: &[i16], b: &[i16], off_a: i64, off_b: i64) -> i64 {
    if off_a < 0 || off_b < 0 || off_a as usize >= a.len() || off_b as usize >= b.len() {
        return -1;
    }
    let a = &a[..=off_a as usize];
    let b = &b[..=off_b as usize];
    let run = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count() as i64;
    run - 1
}

/// What separates two agreeing runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// The extra samples repeat data already present: remove them
    Stutter,
    /// The extra samples are genuine: the other side dropped them
    Gap,
}

/// Decide whether the `gap` samples of `a` at `off_a` duplicate the samples
/// of `b` at `off_b`.
///
/// A negative `off_a` is clamped to zero, shortening the comparison.
#[must_use]
pub fn stutter_or_gap(a: &[i16], b: &[i16], off_a: i64, off_b: i64, gap: i64) -> Divergence {
    let (mut a1, mut b1, mut gap) = (off_a, off_b, gap);
    if a1 < 0 {
        b1 -= a1;
        gap += a1;
        a1 = 0;
    }
    if gap <= 0 {
        return Divergence::Stutter;
    }
    let (a1, b1, gap) = (a1 as usize, b1 as usize, gap as usize);
    match (a.get(a1..a1 + gap), b.get(b1..b1 + gap)) {
        (Some(x), Some(y)) if x == y => Divergence::Stutter,
        _ => Divergence::Gap,
    }
}

/// Outcome of a rift analysis.
///
/// At most one field is non-zero:
/// - `a > 0`: skip `a` samples of `b` to resync (A dropped them)
/// - `b > 0`: skip `b` samples of `a` to resync (B dropped them)
/// - `a < 0`: remove `-a` samples from A (A stuttered)
/// - `b < 0`: remove `-b` samples from B (B stuttered)
/// - `c > 0`: both sides carry `c` samples of disagreeing data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiftMatch {
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

impl RiftMatch {
    /// No resync point was found.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.a == 0 && self.b == 0 && self.c == 0
    }
}

/// Analyze a rift that starts at `off_a` / `off_b` and extends forward.
#[must_use]
pub fn analyze_rift_forward(a: &[i16], b: &[i16], off_a: i64, off_b: i64) -> RiftMatch {
    let apast = a.len() as i64 - off_a;
    let bpast = b.len() as i64 - off_b;
    let mut m = RiftMatch::default();

    let mut i = 0;
    loop {
        if i < bpast && overlap_forward(a, b, off_a, off_b + i) >= MIN_WORDS_RIFT {
            m.a = i;
            break;
        }
        if i < apast {
            if overlap_forward(a, b, off_a + i, off_b) >= MIN_WORDS_RIFT {
                m.b = i;
                break;
            }
            if i < bpast && overlap_forward(a, b, off_a + i, off_b + i) >= MIN_WORDS_RIFT {
                m.c = i;
                break;
            }
        } else if i >= bpast {
            break;
        }
        i += 1;
    }

    if m.is_none() || m.c != 0 {
        return m;
    }
    if m.a != 0 {
        if stutter_or_gap(a, b, off_a - m.a, off_b, m.a) == Divergence::Stutter {
            m.b = -m.a;
            m.a = 0;
        }
    } else if stutter_or_gap(b, a, off_b - m.b, off_a, m.b) == Divergence::Stutter {
        m.a = -m.b;
        m.b = 0;
    }
    m
}

/// Analyze a rift that ends at `off_a` / `off_b` and extends backward.
#[must_use]
pub fn analyze_rift_reverse(a: &[i16], b: &[i16], off_a: i64, off_b: i64) -> RiftMatch {
    let apast = off_a + 1;
    let bpast = off_b + 1;
    let mut m = RiftMatch::default();

    let mut i = 0;
    loop {
        if i < bpast && overlap_reverse(a, b, off_a, off_b - i) >= MIN_WORDS_RIFT {
            m.a = i;
            break;
        }
        if i < apast {
            if overlap_reverse(a, b, off_a - i, off_b) >= MIN_WORDS_RIFT {
                m.b = i;
                break;
            }
            if i < bpast && overlap_reverse(a, b, off_a - i, off_b - i) >= MIN_WORDS_RIFT {
                m.c = i;
                break;
            }
        } else if i >= bpast {
            break;
        }
        i += 1;
    }

    if m.is_none() || m.c != 0 {
        return m;
    }
    if m.a != 0 {
        if stutter_or_gap(a, b, off_a + 1, off_b - m.a + 1, m.a) == Divergence::Stutter {
            m.b = -m.a;
            m.a = 0;
        }
    } else if stutter_or_gap(b, a, off_b + 1, off_a - m.b + 1, m.b) == Divergence::Stutter {
        m.a = -m.b;
        m.b = 0;
    }
    m
}

/// Check whether the rift region is a constant run on each side.
///
/// Looks at up to `MIN_WORDS_RIFT` samples after each offset. Returns
/// `(match_a, match_b)` where -1 means the run stays constant for the whole
/// window and 0 means the signal changes within it.
#[must_use]
pub fn analyze_rift_silence_forward(a: &[i16], b: &[i16], off_a: i64, off_b: i64) -> (i64, i64) {
    (constant_run(a, off_a), constant_run(b, off_b))
}

fn constant_run(v: &[i16], off: i64) -> i64 {
    if off < 0 {
        return 0;
    }
    let end = (v.len() as i64).min(off + MIN_WORDS_RIFT) as usize;
    let start = (off + 1) as usize;
    if start >= end {
        return -1;
    }
    if v[start - 1..end].windows(2).any(|w| w[0] != w[1]) {
        0
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::synth_sample;

    fn signal(range: std::ops::Range<usize>) -> Vec<i16> {
        range.map(synth_sample).collect()
    }

    #[test]
    fn test_overlap_forward() {
        let a = vec![1i16, 2, 3, 4, 5, 6];
        let b = vec![1i16, 2, 3, 9, 9, 9];
        assert_eq!(overlap_forward(&a, &b, 0, 0), 3);
        assert_eq!(overlap_forward(&a, &b, 3, 3), 0);
        assert_eq!(overlap_forward(&a, &b, 6, 0), 0);
    }

    #[test]
    fn test_overlap_reverse() {
        let a = vec![9i16, 9, 1, 2, 3, 4];
        let c = vec![0i16, 0, 1, 2, 3, 4];
        assert_eq!(overlap_reverse(&a, &a, 5, 5), 5);
        assert_eq!(overlap_reverse(&a, &c, 5, 5), 3);
        assert_eq!(overlap_reverse(&a, &c, 1, 1), -1);
    }

    #[test]
    fn test_stutter_or_gap() {
        let a = vec![1i16, 2, 3, 4];
        assert_eq!(stutter_or_gap(&a, &a, 1, 1, 2), Divergence::Stutter);
        assert_eq!(stutter_or_gap(&a, &a, 0, 1, 2), Divergence::Gap);
        // leading part before zero is ignored
        assert_eq!(stutter_or_gap(&a, &[7, 1, 2], -1, 0, 3), Divergence::Stutter);
    }

    #[test]
    fn test_rift_forward_stutter_in_b() {
        let a = signal(0..100);
        let b: Vec<i16> = [signal(0..50), signal(40..50), signal(50..100)].concat();
        let m = analyze_rift_forward(&a, &b, 50, 50);
        assert_eq!(m, RiftMatch { a: 0, b: -10, c: 0 });
    }

    #[test]
    fn test_rift_forward_dropped_from_b() {
        let a = signal(0..100);
        let b: Vec<i16> = [signal(0..50), signal(60..100)].concat();
        let m = analyze_rift_forward(&a, &b, 50, 50);
        assert_eq!(m, RiftMatch { a: 0, b: 10, c: 0 });

        // and the mirror image
        let m = analyze_rift_forward(&b, &a, 50, 50);
        assert_eq!(m, RiftMatch { a: 10, b: 0, c: 0 });
    }

    #[test]
    fn test_rift_forward_garbage() {
        let a = signal(0..100);
        let mut b = a.clone();
        for (k, s) in b[50..55].iter_mut().enumerate() {
            *s = !*s ^ k as i16;
        }
        let m = analyze_rift_forward(&a, &b, 50, 50);
        assert_eq!(m, RiftMatch { a: 0, b: 0, c: 5 });
    }

    #[test]
    fn test_rift_reverse_stutter_in_b() {
        let a = signal(0..100);
        let b: Vec<i16> = [signal(0..50), signal(40..100)].concat();
        let m = analyze_rift_reverse(&a, &b, 39, 49);
        assert_eq!(m, RiftMatch { a: 0, b: -10, c: 0 });
    }

    #[test]
    fn test_rift_unresolvable() {
        let a = signal(0..40);
        let b = signal(1000..1040);
        assert!(analyze_rift_forward(&a, &b, 0, 0).is_none());
        assert!(analyze_rift_reverse(&a, &b, 39, 39).is_none());
    }

    #[test]
    fn test_rift_silence() {
        let mut a = vec![0i16; 40];
        a[39] = 5;
        let mut b = vec![0i16; 40];
        b[20] = 5;
        assert_eq!(analyze_rift_silence_forward(&a, &b, 10, 10), (-1, 0));
        assert_eq!(analyze_rift_silence_forward(&a, &a, 39, 39), (-1, -1));
    }
}
