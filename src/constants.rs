//! Constants used throughout the library.
//!
//! Sizes are expressed either in bytes (`*_RAW`) or in 16-bit sample words.

/// CD frame size in bytes (2352 bytes per sector)
pub const CD_FRAMESIZE_RAW: usize = 2352;

/// Number of 16-bit samples per CD frame (2352 / 2 = 1176)
pub const CD_FRAMEWORDS: usize = CD_FRAMESIZE_RAW / 2;

/// Minimum overlap in 16-bit words (~1.5ms at 44.1kHz)
pub const MIN_WORDS_OVERLAP: i64 = 64;

/// Minimum length of an agreeing run that counts as a sync point
pub const MIN_WORDS_SEARCH: i64 = 64;

/// Minimum rift size in 16-bit words (~0.4ms)
pub const MIN_WORDS_RIFT: i64 = 16;

/// Maximum sector overlap (32 sectors, ~835ms)
pub const MAX_SECTOR_OVERLAP: i64 = 32;

/// Minimum sector epsilon in words (~2.9ms)
pub const MIN_SECTOR_EPSILON: i64 = 128;

/// Upper bound of the adaptive search width, in words.
pub const MAX_DYNOVERLAP: i64 = MAX_SECTOR_OVERLAP * CD_FRAMEWORDS as i64;

/// Retry cap of the low-level sector reader.
pub const MAX_RETRIES: i32 = 8;

/// Default number of sectors requested from the source in one call.
pub const DEFAULT_NSECTORS: usize = 8;

/// Default number of sectors read per raw fragment.
pub const DEFAULT_READAHEAD: usize = 150;

/// Default number of fruitless fragment reads before a frame is skipped.
pub const DEFAULT_SESSION_RETRIES: i32 = 20;

/// Observations per statistics stage between adjustments.
pub const STATS_ADJUST_INTERVAL: i64 = 10;

/// Stage-1 sample count above which the running totals are decayed.
pub const STATS_DECAY_THRESHOLD: i64 = 600;

/// Track number reported for the lead-out.
pub const LEADOUT_TRACK: u8 = 0xAA;
