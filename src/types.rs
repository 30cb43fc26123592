//! Core type definitions.

use bitflags::bitflags;

use crate::constants::LEADOUT_TRACK;

/// Logical Sector Number - absolute sector position on disc
pub type Lsn = i32;

/// Track number (1-99, or 0xAA for lead-out)
pub type TrackNum = u8;

bitflags! {
    /// Paranoia mode flags.
    ///
    /// A session verifies frames when `VERIFY` or `OVERLAP` is set and reads
    /// each sector once otherwise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct ParanoiaMode: i32 {
        /// One plain read per frame; unreadable sectors become silence
        const DISABLE = 0x00;
        /// Compare every raw read against the others before use
        const VERIFY = 0x01;
        /// Accepted for compatibility; changes nothing
        const FRAGMENT = 0x02;
        /// Read overlapping blocks and stitch them onto the root; implies
        /// the same verified path as `VERIFY`
        const OVERLAP = 0x04;
        /// Accepted for compatibility; changes nothing
        const SCRATCH = 0x08;
        /// Repair dropped and duplicated samples found while merging;
        /// without it any rift drops the fragment for a re-read
        const REPAIR = 0x10;
        /// Fail with `SectorSkip` instead of skipping an unverifiable frame
        const NEVERSKIP = 0x20;
        /// All bits, `NEVERSKIP` included; a new session starts in this
        /// mode with skipping still enabled until `set_mode` is called
        const FULL = 0xFF;
    }
}

impl Default for ParanoiaMode {
    fn default() -> Self {
        ParanoiaMode::FULL
    }
}

bitflags! {
    /// Fault-injection flags understood by the drive layer.
    ///
    /// The two low bits select a [`JitterBadness`]; the remaining bits
    /// toggle individual behaviours.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TestFlags: u32 {
        const JITTER_SMALL = 0x01;
        const JITTER_LARGE = 0x02;
        const JITTER_MASSIVE = 0x03;
        /// Jitter every read instead of one in ten
        const ALWAYS_JITTER = 0x04;
        /// Request one sector less than asked
        const UNDERRUN = 0x40;
    }
}

impl TestFlags {
    /// Jitter severity selected by the low two bits.
    #[must_use]
    pub fn jitter(self) -> JitterBadness {
        match self.bits() & 0x3 {
            1 => JitterBadness::Small,
            2 => JitterBadness::Large,
            3 => JitterBadness::Massive,
            _ => JitterBadness::None,
        }
    }
}

/// Severity class of synthetic jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterBadness {
    #[default]
    None,
    Small,
    Large,
    Massive,
}

impl JitterBadness {
    /// Multiplier applied to the random byte shift.
    #[must_use]
    pub fn coefficient(self) -> i64 {
        match self {
            JitterBadness::None => 0,
            JitterBadness::Small => 4,
            JitterBadness::Large => 32,
            JitterBadness::Massive => 128,
        }
    }
}

/// Callback event types reported during reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum ParanoiaCallback {
    /// Raw read of a fragment
    Read = 0,
    /// Verified data merged into the root
    Verify = 1,
    /// Fixed edge jitter
    FixupEdge = 2,
    /// Fixed atom jitter
    FixupAtom = 3,
    /// Unresolvable divergence (scratch)
    Scratch = 4,
    /// Skip exhausted retry
    Skip = 6,
    /// Drift detected and corrected
    Drift = 7,
    /// Dynamic overlap adjust
    Overlap = 9,
    /// Fixed dropped bytes
    FixupDropped = 10,
    /// Fixed duplicate bytes
    FixupDuped = 11,
    /// Hard read error
    ReadError = 12,
    /// Bad cache management
    CacheError = 13,
}

impl ParanoiaCallback {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ParanoiaCallback::Read => "read",
            ParanoiaCallback::Verify => "verify",
            ParanoiaCallback::FixupEdge => "fixup_edge",
            ParanoiaCallback::FixupAtom => "fixup_atom",
            ParanoiaCallback::Scratch => "scratch",
            ParanoiaCallback::Skip => "skip",
            ParanoiaCallback::Drift => "drift",
            ParanoiaCallback::Overlap => "overlap",
            ParanoiaCallback::FixupDropped => "fixup_dropped",
            ParanoiaCallback::FixupDuped => "fixup_duped",
            ParanoiaCallback::ReadError => "read_error",
            ParanoiaCallback::CacheError => "cache_error",
        }
    }
}

/// Caller-supplied progress callback: `(position_or_magnitude, event)`.
pub type CallbackFn<'a> = &'a mut dyn FnMut(i64, ParanoiaCallback);

/// Optional progress sink threaded through one read.
///
/// An absent callback makes every report a no-op.
pub struct Progress<'a> {
    callback: Option<CallbackFn<'a>>,
}

impl<'a> Progress<'a> {
    pub fn new(callback: Option<CallbackFn<'a>>) -> Self {
        Self { callback }
    }

    /// A sink that discards every event.
    pub fn silent() -> Self {
        Self { callback: None }
    }

    pub fn report(&mut self, position: i64, event: ParanoiaCallback) {
        tracing::trace!(position, event = event.as_str(), "paranoia event");
        if let Some(cb) = self.callback.as_mut() {
            cb(position, event);
        }
    }
}

/// Message destination options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageDest {
    /// Discard messages
    #[default]
    ForgetIt,
    /// Emit messages through the logging layer
    PrintIt,
    /// Log messages to a buffer drained by the caller
    LogIt,
}

/// Table of Contents entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TocEntry {
    /// Track number
    pub track: TrackNum,
    /// Start sector (LSN)
    pub start_sector: Lsn,
    /// Whether the track carries CD-DA audio
    pub audio: bool,
}

/// Disc table of contents as reported by a sector source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toc {
    /// Tracks in disc order
    pub tracks: Vec<TocEntry>,
    /// First sector of the lead-out
    pub leadout: Lsn,
}

impl Toc {
    /// Number of tracks, excluding the lead-out.
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Entry for the lead-out pseudo-track.
    #[must_use]
    pub fn leadout_entry(&self) -> TocEntry {
        TocEntry {
            track: LEADOUT_TRACK,
            start_sector: self.leadout,
            audio: false,
        }
    }
}
