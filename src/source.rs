//! Sector source abstraction.
//!
//! The extraction core never talks to hardware directly. Device backends
//! (ioctl, SCSI pass-through, CAM, ...) implement [`SectorSource`] and are
//! handed to [`CdromDrive::open`](crate::CdromDrive::open). [`MemoryDisc`] is
//! an in-memory implementation with fault injection, used by the tests.

use std::collections::HashSet;

use crate::{
    constants::CD_FRAMESIZE_RAW,
    error::{Result, TransportError},
    types::{Lsn, Toc, TocEntry},
};

/// Raw access to a CD-DA capable device.
///
/// Every operation may fail independently; callers must not assume that a
/// successful `read_toc` implies readable sectors or vice versa.
pub trait SectorSource {
    /// Read `sectors` raw 2352-byte sectors starting at `begin` into `buffer`.
    ///
    /// `buffer` holds at least `sectors * CD_FRAMESIZE_RAW` bytes. Returns the
    /// number of sectors actually transferred.
    fn read_audio(&mut self, buffer: &mut [u8], begin: Lsn, sectors: usize) -> Result<usize>;

    /// Set the drive speed multiplier.
    fn set_speed(&mut self, speed: i32) -> Result<()>;

    /// Switch the drive in or out of CDDA read mode.
    fn enable_cdda(&mut self, enable: bool) -> Result<()>;

    /// Read the table of contents.
    fn read_toc(&mut self) -> Result<Toc>;

    /// Whether repeating a failed read can succeed.
    fn supports_retry(&self) -> bool {
        true
    }
}

/// Deterministic, non-silent test signal for word `index` of the disc.
#[must_use]
pub fn synth_sample(index: usize) -> i16 {
    let mut x = (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 29;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 32;
    (x >> 16) as u16 as i16
}

/// In-memory disc used in place of a real drive.
#[derive(Debug, Clone)]
pub struct MemoryDisc {
    /// Little-endian sample bytes, sector 0 first
    data: Vec<u8>,
    toc: Toc,
    /// Sectors that fail every read touching them
    bad_sectors: HashSet<Lsn>,
    /// Number of upcoming reads that fail regardless of position
    pending_failures: usize,
    /// Cap on sectors transferred per call (short reads)
    max_transfer: Option<usize>,
    retry_supported: bool,
    toc_error: bool,
    speed: Option<i32>,
    cdda_enabled: bool,
    read_calls: usize,
}

impl MemoryDisc {
    /// A single-track audio disc of `sectors` sectors of synthetic signal.
    #[must_use]
    pub fn new(sectors: usize) -> Self {
        let samples: Vec<i16> = (0..sectors * CD_FRAMESIZE_RAW / 2).map(synth_sample).collect();
        Self::from_samples(&samples)
    }

    /// A single-track audio disc holding `samples` (padded to whole sectors).
    #[must_use]
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let sectors = data.len().div_ceil(CD_FRAMESIZE_RAW);
        data.resize(sectors * CD_FRAMESIZE_RAW, 0);
        let toc = Toc {
            tracks: vec![TocEntry {
                track: 1,
                start_sector: 0,
                audio: true,
            }],
            leadout: sectors as Lsn,
        };
        Self {
            data,
            toc,
            bad_sectors: HashSet::new(),
            pending_failures: 0,
            max_transfer: None,
            retry_supported: true,
            toc_error: false,
            speed: None,
            cdda_enabled: false,
            read_calls: 0,
        }
    }

    /// Replace the table of contents.
    #[must_use]
    pub fn with_toc(mut self, toc: Toc) -> Self {
        self.toc = toc;
        self
    }

    /// Number of sectors on the disc.
    #[must_use]
    pub fn sectors(&self) -> usize {
        self.data.len() / CD_FRAMESIZE_RAW
    }

    /// Ground-truth samples of `count` sectors starting at `begin`.
    #[must_use]
    pub fn samples(&self, begin: Lsn, count: usize) -> Vec<i16> {
        let start = begin as usize * CD_FRAMESIZE_RAW;
        let end = (start + count * CD_FRAMESIZE_RAW).min(self.data.len());
        self.data[start..end]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Ground-truth bytes of the whole disc.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the samples of sectors `[begin, begin + count)` with zeros.
    pub fn silence(&mut self, begin: Lsn, count: usize) {
        let start = begin as usize * CD_FRAMESIZE_RAW;
        let end = (start + count * CD_FRAMESIZE_RAW).min(self.data.len());
        self.data[start..end].fill(0);
    }

    /// Make every read touching `lsn` fail.
    pub fn mark_bad(&mut self, lsn: Lsn) {
        self.bad_sectors.insert(lsn);
    }

    /// Make the next `count` reads fail.
    pub fn fail_next(&mut self, count: usize) {
        self.pending_failures = count;
    }

    /// Transfer at most `sectors` per call.
    pub fn limit_transfer(&mut self, sectors: usize) {
        self.max_transfer = Some(sectors.max(1));
    }

    pub fn set_retry_supported(&mut self, supported: bool) {
        self.retry_supported = supported;
    }

    /// Make `read_toc` fail.
    pub fn fail_toc(&mut self) {
        self.toc_error = true;
    }

    /// Number of `read_audio` calls served so far, failed ones included.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.read_calls
    }

    #[must_use]
    pub fn speed(&self) -> Option<i32> {
        self.speed
    }

    #[must_use]
    pub fn cdda_enabled(&self) -> bool {
        self.cdda_enabled
    }
}

impl SectorSource for MemoryDisc {
    fn read_audio(&mut self, buffer: &mut [u8], begin: Lsn, sectors: usize) -> Result<usize> {
        self.read_calls += 1;

        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(TransportError::Medium.into());
        }
        if begin < 0 || begin as usize + sectors > self.sectors() {
            return Err(TransportError::Illegal.into());
        }

        let count = self.max_transfer.map_or(sectors, |max| sectors.min(max));
        let end = begin + count as Lsn;
        if (begin..end).any(|lsn| self.bad_sectors.contains(&lsn)) {
            return Err(TransportError::Medium.into());
        }

        let start = begin as usize * CD_FRAMESIZE_RAW;
        let len = count * CD_FRAMESIZE_RAW;
        buffer[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(count)
    }

    fn set_speed(&mut self, speed: i32) -> Result<()> {
        self.speed = Some(speed);
        Ok(())
    }

    fn enable_cdda(&mut self, enable: bool) -> Result<()> {
        self.cdda_enabled = enable;
        Ok(())
    }

    fn read_toc(&mut self) -> Result<Toc> {
        if self.toc_error {
            return Err(TransportError::NotReady.into());
        }
        Ok(self.toc.clone())
    }

    fn supports_retry(&self) -> bool {
        self.retry_supported
    }
}
