//! CDDA drive interface.
//!
//! [`CdromDrive`] wraps a [`SectorSource`] and turns its unreliable reads into
//! something the paranoia layer can work with: bounded retries that shrink the
//! batch on repeated failure, a per-call sector cap, and optional synthetic
//! jitter for exercising the verification engine without flaky hardware.

use std::fmt;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::{
    constants::{CD_FRAMESIZE_RAW, DEFAULT_NSECTORS, MAX_RETRIES},
    error::{Error, Result},
    source::SectorSource,
    types::{JitterBadness, Lsn, MessageDest, TestFlags, Toc, TrackNum},
};

/// CD-ROM drive handle.
///
/// Represents an opened drive with methods for reading audio data and
/// querying disc information.
pub struct CdromDrive<S: SectorSource> {
    source: S,
    /// Whether the drive is open
    opened: bool,
    /// Maximum number of sectors requested from the source at once
    nsectors: usize,
    /// Fault-injection flags
    test_flags: TestFlags,
    /// Whether failed reads are retried at all
    error_retry: bool,
    /// Table of contents read at open time
    toc: Toc,
    /// First audio sector
    audio_first_sector: Lsn,
    /// Last audio sector
    audio_last_sector: Lsn,
    /// Error destination
    error_dest: MessageDest,
    /// Message destination
    message_dest: MessageDest,
    errors: String,
    messages: String,
    rng: StdRng,
}

impl<S: SectorSource> fmt::Debug for CdromDrive<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdromDrive")
            .field("opened", &self.opened)
            .field("nsectors", &self.nsectors)
            .field("test_flags", &self.test_flags)
            .field("tracks", &self.toc.track_count())
            .field("audio_first_sector", &self.audio_first_sector)
            .field("audio_last_sector", &self.audio_last_sector)
            .finish_non_exhaustive()
    }
}

impl<S: SectorSource> CdromDrive<S> {
    /// Open a drive on top of `source`.
    ///
    /// Reads the table of contents, then checks that the disc has at least
    /// one audio track and that a CDDA read in the middle of an audio track
    /// succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::TocReadError`] if the TOC cannot be read or is empty
    /// - [`Error::NoAudioTracks`] if no track carries audio
    /// - [`Error::NoDataRead`] if no audio track could be read
    pub fn open(source: S) -> Result<Self> {
        Self::open_with(source, MessageDest::ForgetIt)
    }

    /// Open a drive, routing diagnostics to `message_dest` from the start.
    ///
    /// # Errors
    ///
    /// Same as [`CdromDrive::open`].
    pub fn open_with(mut source: S, message_dest: MessageDest) -> Result<Self> {
        let toc = source
            .read_toc()
            .map_err(|err| Error::TocReadError(err.to_string()))?;
        if toc.tracks.is_empty() {
            return Err(Error::TocReadError("disc reports no tracks".to_string()));
        }

        let mut drive = Self {
            source,
            opened: false,
            nsectors: DEFAULT_NSECTORS,
            test_flags: TestFlags::empty(),
            error_retry: true,
            toc,
            audio_first_sector: 0,
            audio_last_sector: 0,
            error_dest: message_dest,
            message_dest,
            errors: String::new(),
            messages: String::new(),
            rng: StdRng::from_entropy(),
        };
        drive.scan_audio_range();
        drive.verify_read_command()?;
        drive.opened = true;
        debug!(
            first = drive.audio_first_sector,
            last = drive.audio_last_sector,
            tracks = drive.toc.track_count(),
            "drive opened"
        );
        Ok(drive)
    }

    /// Reseed the jitter generator, making injected jitter reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Close the drive. Further reads fail with [`Error::DeviceNotOpen`].
    pub fn close(&mut self) {
        if self.opened {
            if let Err(err) = self.source.enable_cdda(false) {
                self.note_error(&format!("Unable to leave CDDA mode: {err}"));
            }
        }
        self.opened = false;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Consume the drive and hand back its sector source.
    pub fn into_source(self) -> S {
        self.source
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn scan_audio_range(&mut self) {
        let mut first = None;
        let mut last = 0;
        for entry in self.toc.tracks.iter().filter(|t| t.audio) {
            first.get_or_insert(entry.start_sector);
            if let Ok(end) = self.track_last_sector(entry.track) {
                last = last.max(end);
            }
        }
        self.audio_first_sector = first.unwrap_or(0);
        self.audio_last_sector = last;
    }

    /// Put the drive into CDDA mode and check a read actually works.
    fn verify_read_command(&mut self) -> Result<()> {
        if let Err(err) = self.source.enable_cdda(true) {
            self.note_error(&format!("Unable to enter CDDA mode: {err}"));
        }

        let mut buffer = vec![0u8; CD_FRAMESIZE_RAW];
        let mut audio = false;
        let tracks: Vec<TrackNum> = self
            .toc
            .tracks
            .iter()
            .filter(|t| t.audio)
            .map(|t| t.track)
            .collect();

        for track in tracks {
            audio = true;
            let first = self.track_first_sector(track)?;
            let last = self.track_last_sector(track)?;
            let sector = first + (last - first) / 2;
            match self.source.read_audio(&mut buffer, sector, 1) {
                Ok(n) if n > 0 => {
                    self.note_message(&format!(
                        "Verified CDDA read in track {track} at sector {sector}"
                    ));
                    return Ok(());
                }
                Ok(_) => self.note_error(&format!("Empty read in track {track} at sector {sector}")),
                Err(err) => self.note_error(&format!(
                    "Read of track {track} at sector {sector} failed: {err}"
                )),
            }
        }

        if let Err(err) = self.source.enable_cdda(false) {
            self.note_error(&format!("Unable to leave CDDA mode: {err}"));
        }
        if audio {
            self.note_error("Unable to read any data from the drive");
            Err(Error::NoDataRead)
        } else {
            self.note_error("No audio tracks found on disc");
            Err(Error::NoAudioTracks)
        }
    }

    /// Read raw audio sectors into `buffer`.
    ///
    /// At most `nsectors` sectors are requested per call (one less with the
    /// `UNDERRUN` test flag). Returns the number of sectors read, which may
    /// be fewer than asked for; callers loop.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotOpen`] if the drive was closed
    /// - [`Error::SectorSkip`] when a single sector stays unreadable
    /// - [`Error::UnknownReadError`] when the retry budget is exhausted
    /// - [`Error::ReadNoRetry`] when retrying is not possible
    pub fn read_audio(&mut self, buffer: &mut [u8], begin: Lsn, sectors: usize) -> Result<usize> {
        if !self.opened {
            return Err(Error::DeviceNotOpen);
        }

        let mut sectors = sectors
            .min(self.nsectors)
            .min(buffer.len() / CD_FRAMESIZE_RAW);
        if self.test_flags.contains(TestFlags::UNDERRUN) && sectors > 1 {
            sectors -= 1;
        }
        if sectors == 0 {
            return Ok(0);
        }

        if self.test_flags.jitter() == JitterBadness::None {
            self.read_blocks(buffer, begin, sectors)
        } else {
            self.jitter_read(buffer, begin, sectors)
        }
    }

    /// Bounded retry loop around the source.
    fn read_blocks(&mut self, buffer: &mut [u8], begin: Lsn, sectors: usize) -> Result<usize> {
        let mut retry_count: i32 = 0;
        let mut count = sectors;

        loop {
            let err = match self
                .source
                .read_audio(&mut buffer[..count * CD_FRAMESIZE_RAW], begin, count)
            {
                Ok(read) => return Ok(read),
                Err(err) => err,
            };

            if !self.error_retry || !self.source.supports_retry() {
                self.note_error(&format!("Read of sector {begin} failed: {err}"));
                return Err(Error::ReadNoRetry(begin));
            }
            if count == 1 && retry_count > MAX_RETRIES - 1 {
                warn!(sector = begin, retry_count, "giving up on sector");
                self.note_error(&format!("Skipping unreadable sector {begin}"));
                return Err(Error::SectorSkip(begin, retry_count));
            }
            if retry_count > 4 && count > 1 {
                count = count * 3 / 4;
                debug!(sector = begin, count, "shrinking read batch");
            }
            retry_count += 1;
            if retry_count > MAX_RETRIES {
                self.note_error(&format!(
                    "Unrecoverable error reading {count} sectors at {begin}: {err}"
                ));
                return Err(Error::UnknownReadError(begin));
            }
            debug!(sector = begin, retry_count, error = %err, "retrying read");
        }
    }

    /// Read with a randomly drawn byte shift, simulating a jittery drive.
    fn jitter_read(&mut self, buffer: &mut [u8], begin: Lsn, sectors: usize) -> Result<usize> {
        let always = self.test_flags.contains(TestFlags::ALWAYS_JITTER);
        if !always && self.rng.gen::<f64>() <= 0.9 {
            return self.read_blocks(buffer, begin, sectors);
        }

        let u: f64 = self.rng.gen();
        let spread = ((u - 0.5) * CD_FRAMESIZE_RAW as f64 / 8.0) as i64;
        let jitter = self.test_flags.jitter().coefficient() * spread;
        self.jitter_read_shifted(buffer, begin, sectors, jitter)
    }

    /// Read `sectors` sectors as if the drive had landed `jitter` bytes off.
    pub(crate) fn jitter_read_shifted(
        &mut self,
        buffer: &mut [u8],
        begin: Lsn,
        sectors: usize,
        jitter: i64,
    ) -> Result<usize> {
        let raw = CD_FRAMESIZE_RAW as i64;
        let mut jsec = jitter / raw;
        let mut offset = if jitter >= 0 {
            jitter % raw
        } else {
            jsec -= 1;
            raw - (-jitter % raw)
        };

        let shifted = i64::from(begin) + jsec;
        let (read_begin, read_sectors) =
            if shifted > 0 && shifted + sectors as i64 + 1 <= i64::from(self.toc.leadout) {
                (shifted as Lsn, sectors + 1)
            } else {
                offset = 0;
                (begin, sectors)
            };
        trace!(sector = begin, jitter, read_begin, offset, "injecting jitter");

        let mut scratch = vec![0u8; read_sectors * CD_FRAMESIZE_RAW];
        let read = self.read_blocks(&mut scratch, read_begin, read_sectors)?;

        // a short transfer only yields the whole sectors it holds past the shift
        let start = offset as usize;
        let whole = ((read * CD_FRAMESIZE_RAW).saturating_sub(start) / CD_FRAMESIZE_RAW).min(sectors);
        let len = whole * CD_FRAMESIZE_RAW;
        buffer[..len].copy_from_slice(&scratch[start..start + len]);
        Ok(whole)
    }

    /// Set drive speed.
    ///
    /// # Errors
    ///
    /// Returns the source's error if it rejects the request.
    pub fn set_speed(&mut self, speed: i32) -> Result<()> {
        self.source.set_speed(speed).inspect_err(|err| {
            warn!(speed, error = %err, "speed change rejected");
        })
    }

    /// Cap the number of sectors requested per source call (at least one).
    pub fn set_nsectors(&mut self, nsectors: usize) {
        self.nsectors = nsectors.max(1);
    }

    #[must_use]
    pub fn nsectors(&self) -> usize {
        self.nsectors
    }

    pub fn set_test_flags(&mut self, flags: TestFlags) {
        self.test_flags = flags;
    }

    #[must_use]
    pub fn test_flags(&self) -> TestFlags {
        self.test_flags
    }

    /// Enable or disable retrying of failed reads.
    pub fn set_error_retry(&mut self, retry: bool) {
        self.error_retry = retry;
    }

    /// Set verbose output options.
    pub fn set_verbose(&mut self, error_dest: MessageDest, message_dest: MessageDest) {
        self.error_dest = error_dest;
        self.message_dest = message_dest;
    }

    fn note_error(&mut self, text: &str) {
        match self.error_dest {
            MessageDest::ForgetIt => {}
            MessageDest::PrintIt => warn!("{text}"),
            MessageDest::LogIt => {
                self.errors.push_str(text);
                self.errors.push('\n');
            }
        }
    }

    fn note_message(&mut self, text: &str) {
        match self.message_dest {
            MessageDest::ForgetIt => {}
            MessageDest::PrintIt => info!("{text}"),
            MessageDest::LogIt => {
                self.messages.push_str(text);
                self.messages.push('\n');
            }
        }
    }

    /// Drain the accumulated error log.
    pub fn errors(&mut self) -> Option<String> {
        (!self.errors.is_empty()).then(|| std::mem::take(&mut self.errors))
    }

    /// Drain the accumulated message log.
    pub fn messages(&mut self) -> Option<String> {
        (!self.messages.is_empty()).then(|| std::mem::take(&mut self.messages))
    }

    #[must_use]
    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    /// Get the number of tracks.
    #[must_use]
    pub fn track_count(&self) -> TrackNum {
        self.toc.track_count() as TrackNum
    }

    fn track_index(&self, track: TrackNum) -> Result<usize> {
        self.toc
            .tracks
            .iter()
            .position(|t| t.track == track)
            .ok_or(Error::InvalidTrack(track))
    }

    /// Get the first sector of a track.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTrack`] if the disc has no such track.
    pub fn track_first_sector(&self, track: TrackNum) -> Result<Lsn> {
        let idx = self.track_index(track)?;
        Ok(self.toc.tracks[idx].start_sector)
    }

    /// Get the last sector of a track: the sector before the next track,
    /// or before the lead-out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTrack`] if the disc has no such track.
    pub fn track_last_sector(&self, track: TrackNum) -> Result<Lsn> {
        let idx = self.track_index(track)?;
        let next = self
            .toc
            .tracks
            .get(idx + 1)
            .map_or(self.toc.leadout, |t| t.start_sector);
        Ok(next - 1)
    }

    /// Check if a track is audio.
    #[must_use]
    pub fn track_is_audio(&self, track: TrackNum) -> bool {
        self.track_index(track)
            .map(|idx| self.toc.tracks[idx].audio)
            .unwrap_or(false)
    }

    /// Get the track containing a given sector.
    #[must_use]
    pub fn sector_get_track(&self, lsn: Lsn) -> Option<TrackNum> {
        if lsn < 0 || lsn >= self.toc.leadout {
            return None;
        }
        self.toc
            .tracks
            .iter()
            .rev()
            .find(|t| lsn >= t.start_sector)
            .map(|t| t.track)
    }

    /// Get first audio sector on disc.
    #[must_use]
    pub fn disc_first_sector(&self) -> Lsn {
        self.audio_first_sector
    }

    /// Get last audio sector on disc.
    #[must_use]
    pub fn disc_last_sector(&self) -> Lsn {
        self.audio_last_sector
    }
}
