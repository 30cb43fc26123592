//! Core paranoia state machine for verified CD audio reading.
//!
//! Every frame handed to the caller has been read at least twice and agreed
//! upon (stage 1), then stitched onto the root (stage 2), where dropped or
//! duplicated samples are repaired and jitter is measured.

use std::io::SeekFrom;

use tracing::{debug, trace, warn};

use crate::{
    block::{CBlock, VFragment},
    cache::{BlockHandle, FragmentCache, FragmentHandle},
    cdda::CdromDrive,
    constants::{
        CD_FRAMESIZE_RAW, CD_FRAMEWORDS, DEFAULT_READAHEAD, DEFAULT_SESSION_RETRIES, MIN_WORDS_RIFT,
    },
    error::{Error, Result},
    gap::{analyze_rift_forward, analyze_rift_silence_forward, overlap_forward},
    overlap::{find_root_alignment, find_runs, Alignment, DynamicOverlap, Run, Stage},
    source::SectorSource,
    types::{CallbackFn, Lsn, ParanoiaCallback, ParanoiaMode, Progress},
};

/// Rift repairs attempted on one fragment before it is given up on.
const MAX_RIFT_FIXES: usize = 32;

const FRAME: i64 = CD_FRAMEWORDS as i64;

/// Main paranoia state machine.
///
/// Owns the drive for the duration of the session; [`Paranoia::close`] hands
/// it back.
pub struct Paranoia<S: SectorSource> {
    drive: CdromDrive<S>,
    /// Raw blocks, verified fragments and the root
    cache: FragmentCache,
    /// Adaptive search width and drift compensation
    overlap: DynamicOverlap,
    mode: ParanoiaMode,
    /// Current read position (in samples)
    cursor: i64,
    /// First sector of the reading range
    first_sector: Lsn,
    /// Last sector of the reading range
    last_sector: Lsn,
    /// Enable skipping on failure
    enable_skip: bool,
    /// Sectors read per raw block
    readahead: usize,
    /// Default fruitless reads before a frame is skipped
    max_retries: i32,
    /// Output buffer for the current frame
    output: Vec<i16>,
    /// Last sector the drive reported as unreadable
    bad_sector: Option<Lsn>,
}

impl<S: SectorSource> Paranoia<S> {
    /// Start a session on an opened drive, positioned at the first sector.
    #[must_use]
    pub fn open(drive: CdromDrive<S>) -> Self {
        let first_sector = drive.disc_first_sector();
        let last_sector = drive.disc_last_sector();
        debug!(first_sector, last_sector, "paranoia session opened");

        Self {
            drive,
            cache: FragmentCache::new(),
            overlap: DynamicOverlap::new(),
            mode: ParanoiaMode::FULL,
            cursor: i64::from(first_sector) * FRAME,
            first_sector,
            last_sector,
            enable_skip: true,
            readahead: DEFAULT_READAHEAD,
            max_retries: DEFAULT_SESSION_RETRIES,
            output: vec![0; CD_FRAMEWORDS],
            bad_sector: None,
        }
    }

    /// End the session and return the drive.
    #[must_use]
    pub fn close(self) -> CdromDrive<S> {
        self.drive
    }

    /// Set the paranoia mode.
    pub fn set_mode(&mut self, mode: ParanoiaMode) {
        self.mode = mode;
        self.enable_skip = !mode.contains(ParanoiaMode::NEVERSKIP);
    }

    /// Get the current paranoia mode.
    #[must_use]
    pub fn mode(&self) -> ParanoiaMode {
        self.mode
    }

    /// Fix the search width to `sectors` sectors and stop adapting it.
    pub fn set_overlap(&mut self, sectors: i64) {
        self.overlap.set_dynoverlap(sectors * FRAME);
        self.overlap.stage1.disable();
    }

    /// Number of sectors read per raw block.
    pub fn set_readahead(&mut self, sectors: usize) {
        self.readahead = sectors.max(1);
    }

    #[must_use]
    pub fn readahead(&self) -> usize {
        self.readahead
    }

    /// Fruitless reads tolerated by [`Paranoia::read`] before skipping.
    pub fn set_max_retries(&mut self, retries: i32) {
        self.max_retries = retries;
    }

    /// Restrict reading to `[start, end]`, clamped to the disc.
    pub fn set_range(&mut self, start: Lsn, end: Lsn) {
        self.first_sector = start.max(self.drive.disc_first_sector());
        self.last_sector = end.min(self.drive.disc_last_sector());

        let sector = self.cursor_sector();
        if sector < self.first_sector || sector > self.last_sector {
            self.cursor = i64::from(self.first_sector) * FRAME;
        }
    }

    /// Move the cursor; offsets are in sectors.
    ///
    /// `Start` is an absolute sector, `End` is relative to the last sector.
    /// The target is clamped to the reading range. All cached data and drift
    /// knowledge is dropped.
    pub fn seek(&mut self, pos: SeekFrom) -> Lsn {
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::Current(n) => i64::from(self.cursor_sector()).saturating_add(n),
            SeekFrom::End(n) => i64::from(self.last_sector).saturating_add(n),
        };
        let sector = target.clamp(i64::from(self.first_sector), i64::from(self.last_sector)) as Lsn;

        self.cursor = i64::from(sector) * FRAME;
        self.cache.reset_all();
        self.overlap.reset_drift();
        self.bad_sector = None;
        debug!(sector, "seek");
        sector
    }

    /// Read the next frame of verified audio.
    ///
    /// Returns `CD_FRAMEWORDS` samples valid until the next call.
    ///
    /// # Errors
    ///
    /// See [`Paranoia::read_limited`].
    pub fn read(&mut self, callback: Option<CallbackFn<'_>>) -> Result<&[i16]> {
        let max_retries = self.max_retries;
        self.read_limited(callback, max_retries)
    }

    /// Read the next frame, skipping it after `max_retries` fruitless reads.
    ///
    /// # Errors
    ///
    /// - [`Error::UnaddressableSector`] past the end of the reading range
    /// - [`Error::SectorSkip`] when the frame cannot be verified and
    ///   skipping is disabled
    /// - [`Error::DeviceNotOpen`] if the drive was closed underneath
    pub fn read_limited(&mut self, callback: Option<CallbackFn<'_>>, max_retries: i32) -> Result<&[i16]> {
        let mut progress = Progress::new(callback);
        let sector = self.cursor_sector();
        if sector > self.last_sector {
            return Err(Error::UnaddressableSector(sector));
        }

        if self.mode.intersects(ParanoiaMode::VERIFY | ParanoiaMode::OVERLAP) {
            self.read_verified(self.cursor, max_retries, &mut progress)?;
        } else {
            self.read_direct(sector, &mut progress)?;
        }

        self.cursor += FRAME;
        Ok(&self.output)
    }

    /// Single unverified read, as a plain ripper would do it.
    fn read_direct(&mut self, sector: Lsn, progress: &mut Progress<'_>) -> Result<()> {
        let mut buf = vec![0u8; CD_FRAMESIZE_RAW];
        progress.report(self.cursor, ParanoiaCallback::Read);
        match self.drive.read_audio(&mut buf, sector, 1) {
            Ok(1) => {
                decode_samples(&buf, &mut self.output);
                Ok(())
            }
            Ok(_) if self.enable_skip => self.fill_silence(sector, progress),
            Ok(_) => Err(Error::NoDataRead),
            Err(err) if self.enable_skip && !matches!(err, Error::DeviceNotOpen) => {
                debug!(sector, error = %err, "direct read failed");
                self.fill_silence(sector, progress)
            }
            Err(err) => Err(err),
        }
    }

    fn fill_silence(&mut self, sector: Lsn, progress: &mut Progress<'_>) -> Result<()> {
        warn!(sector, "skipping unreadable sector");
        progress.report(self.cursor, ParanoiaCallback::Skip);
        self.output.fill(0);
        Ok(())
    }

    fn read_verified(&mut self, begin: i64, max_retries: i32, progress: &mut Progress<'_>) -> Result<()> {
        let end = begin + FRAME;
        self.cache.trim(begin, end);

        let mut retries = 0;
        let mut last_end = self.cache.root().end();
        loop {
            if self.copy_frame(begin) {
                return Ok(());
            }
            // past half the budget, any position the reads agreed on may
            // seed the root
            let relaxed = retries * 2 >= max_retries;
            self.merge_fragments(begin, relaxed, progress);
            if self.copy_frame(begin) {
                return Ok(());
            }

            if let Some(handle) = self.read_block(begin, progress)? {
                self.verify_block(handle, progress);
                self.merge_fragments(begin, relaxed, progress);
            }

            let root_end = self.cache.root().end();
            if root_end > last_end {
                last_end = root_end;
                retries = 0;
            } else {
                retries += 1;
                trace!(begin, retries, "fruitless read");
            }
            if retries >= max_retries && !self.copy_frame(begin) {
                return self.skip_frame(begin, max_retries, progress);
            }
        }
    }

    /// Copy the frame at `begin` out of the root if it is there.
    fn copy_frame(&mut self, begin: i64) -> bool {
        let root = self.cache.root_mut();
        let Some(frame) = root.extract_frame(begin) else {
            return false;
        };
        self.output.copy_from_slice(frame);
        root.returned_limit = root.returned_limit.max(begin + FRAME);
        true
    }

    /// Give up on verifying the frame at `begin`.
    ///
    /// Whatever verified audio the root holds up to the frame's end is kept;
    /// the rest of the frame becomes silence, recorded in `root.skipped` so
    /// later fragments align against the audio before it.
    fn skip_frame(&mut self, begin: i64, max_retries: i32, progress: &mut Progress<'_>) -> Result<()> {
        let sector = (begin / FRAME) as Lsn;
        if !self.enable_skip {
            return Err(Error::SectorSkip(sector, max_retries));
        }

        let end = begin + FRAME;
        warn!(sector, "skipping unverifiable frame");
        progress.report(begin, ParanoiaCallback::Skip);

        let root = self.cache.root_mut();
        if root.is_empty() || root.begin > begin || root.end() < begin {
            root.set(vec![0; CD_FRAMEWORDS], begin, sector);
            root.skipped = Some((begin, end));
        } else {
            let fill = root.verified_end().max(begin);
            let start = match root.skipped {
                Some((start, skip_end)) if skip_end == root.end() && start <= fill => start,
                _ => fill,
            };
            root.truncate_at(fill);
            root.vector.resize((end - root.begin) as usize, 0);
            root.last_sector = sector;
            root.skipped = Some((start, end));
        }
        self.copy_frame(begin);
        Ok(())
    }

    /// Read one raw block starting `dynoverlap` before the root's end.
    ///
    /// Returns `None` when nothing could be read.
    fn read_block(&mut self, begin: i64, progress: &mut Progress<'_>) -> Result<Option<BlockHandle>> {
        let dynoverlap = self.overlap.dynoverlap();
        let dyndrift = self.overlap.dyndrift();
        let root = self.cache.root();
        let anchor = if root.is_empty() { begin } else { root.end() };

        let mut sector = ((anchor - dynoverlap + dyndrift).div_euclid(FRAME) as Lsn).max(self.first_sector);
        let target = (begin / FRAME) as Lsn;
        if let Some(bad) = self.bad_sector {
            if bad >= sector && bad < target {
                sector = bad + 1;
            }
        }
        if sector > self.last_sector {
            return Ok(None);
        }
        let count = self.readahead.min((self.last_sector - sector + 1) as usize);

        let mut buf = vec![0u8; count * CD_FRAMESIZE_RAW];
        let mut read = 0;
        let mut single = false;
        while read < count {
            let lsn = sector + read as Lsn;
            let want = if single { 1 } else { count - read };
            match self.drive.read_audio(&mut buf[read * CD_FRAMESIZE_RAW..], lsn, want) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(Error::DeviceNotOpen) => return Err(Error::DeviceNotOpen),
                Err(err) if single || err.is_skip() => {
                    warn!(sector = lsn, error = %err, "unreadable sector");
                    progress.report(i64::from(lsn) * FRAME - dyndrift, ParanoiaCallback::ReadError);
                    self.bad_sector = Some(lsn);
                    break;
                }
                Err(err) => {
                    debug!(sector = lsn, error = %err, "batch read failed, reading sector by sector");
                    progress.report(i64::from(lsn) * FRAME - dyndrift, ParanoiaCallback::ReadError);
                    single = true;
                }
            }
        }
        if read == 0 {
            return Ok(None);
        }

        let mut samples = vec![0; read * CD_FRAMEWORDS];
        decode_samples(&buf[..read * CD_FRAMESIZE_RAW], &mut samples);
        let block_begin = i64::from(sector) * FRAME - dyndrift;
        progress.report(block_begin, ParanoiaCallback::Read);
        trace!(sector, read, "raw block");

        let block = CBlock::new(samples, block_begin, sector + read as Lsn - 1);
        Ok(Some(self.cache.insert_block(block)))
    }

    /// Stage 1: verify a fresh block against every older one it overlaps.
    ///
    /// Samples that some older block holds at the same position are taken
    /// first. The rest of the block is then searched at an offset against
    /// each older block on its own, so a shift inside one read never leaks
    /// into the runs found against another.
    fn verify_block(&mut self, handle: BlockHandle, progress: &mut Progress<'_>) {
        let dynoverlap = self.overlap.dynoverlap();
        let Some(new) = self.cache.block(handle) else {
            return;
        };
        let olds: Vec<&CBlock> = self
            .cache
            .blocks()
            .filter(|&(h, old)| {
                h != handle && old.end() + dynoverlap > new.begin && old.begin - dynoverlap < new.end()
            })
            .map(|(_, old)| old)
            .collect();

        let in_place: Vec<(usize, usize)> = olds
            .iter()
            .flat_map(|old| find_runs(new, old, 0, &[]))
            .map(|run| (run.start, run.end))
            .collect();
        let mut offsets = vec![0; in_place.len()];
        let covered = merge_ranges(in_place);

        let mut runs: Vec<Run> = covered
            .iter()
            .map(|&(start, end)| Run { start, end, offset: 0 })
            .collect();
        for old in &olds {
            for run in find_runs(new, old, dynoverlap, &covered) {
                offsets.push(run.offset);
                runs.push(run);
            }
        }
        runs.sort_by_key(|run| (run.start, run.end));
        let fragments: Vec<VFragment> = runs
            .iter()
            .map(|run| VFragment::from_block(new, handle, run.start, run.end, run.offset))
            .collect();

        for fragment in fragments {
            trace!(begin = fragment.begin, len = fragment.len(), offset = fragment.offset, "verified");
            self.cache.insert_fragment(fragment);
        }
        for offset in offsets {
            self.overlap.record(Stage::Raw, offset, &mut self.cache, progress);
        }
    }

    /// Stage 2: grow the root from verified fragments.
    fn merge_fragments(&mut self, begin: i64, relaxed: bool, progress: &mut Progress<'_>) {
        if self.cache.root().is_empty() && !self.init_root(begin, relaxed, progress) {
            return;
        }
        loop {
            let mut grew = false;
            for h in self.cache.fragment_handles() {
                grew |= self.merge_fragment(h, progress);
            }
            if !grew {
                break;
            }
        }
    }

    /// Seed an empty root with a fragment holding `begin`.
    ///
    /// Only a fragment whose reads agreed in place qualifies, unless
    /// `relaxed`, in which case one found at an offset is taken as well.
    fn init_root(&mut self, begin: i64, relaxed: bool, progress: &mut Progress<'_>) -> bool {
        let mut seed = None;
        for (h, v) in self.cache.fragments().filter(|(_, v)| v.contains(begin)) {
            if v.offset == 0 {
                seed = Some(h);
                break;
            }
            if relaxed && seed.is_none() {
                seed = Some(h);
            }
        }
        let Some(h) = seed else {
            return false;
        };
        let Some(fragment) = self.cache.remove_fragment(h) else {
            return false;
        };
        debug!(begin = fragment.begin, len = fragment.len(), "root started");
        progress.report(fragment.begin, ParanoiaCallback::Verify);
        self.cache
            .root_mut()
            .set(fragment.vector, fragment.begin, fragment.last_sector);
        true
    }

    /// Merge one fragment into the root, repairing rifts along the way.
    ///
    /// Returns true if the root grew. Fragments that carry nothing new, or
    /// that cannot be reconciled, are released.
    fn merge_fragment(&mut self, h: FragmentHandle, progress: &mut Progress<'_>) -> bool {
        let dynoverlap = self.overlap.dynoverlap();
        let Some(frag) = self.cache.fragment(h) else {
            return false;
        };
        let root = self.cache.root();
        if frag.end() < root.begin {
            self.cache.remove_fragment(h);
            return false;
        }

        // past silence at the root's tail only a fragment read in place
        // can continue, and only at its claimed position
        let root_end = root.end();
        let in_place = frag.offset == 0;
        let resumes_skip =
            in_place && root.skipped.is_some_and(|(_, end)| end == root_end) && frag.contains(root_end);

        let align = match find_root_alignment(root, frag, dynoverlap) {
            // an offset run carries one read's jitter; only in-place
            // agreement measures drift
            Some(align) if !in_place => align,
            Some(align) => {
                let drift = self.overlap.dyndrift();
                self.overlap
                    .record(Stage::Root, -align.offset, &mut self.cache, progress);
                let Some(frag) = self.cache.fragment(h) else {
                    return false;
                };
                if drift == self.overlap.dyndrift() {
                    align
                } else {
                    match find_root_alignment(self.cache.root(), frag, self.overlap.dynoverlap()) {
                        Some(align) => align,
                        None => return false,
                    }
                }
            }
            None if resumes_skip => Alignment { offset: 0, begin: root_end },
            None => return false,
        };
        let Some(frag) = self.cache.fragment(h) else {
            return false;
        };

        let fbegin = frag.begin + align.offset;
        if fbegin + frag.len() as i64 <= self.cache.root().end() {
            self.cache.remove_fragment(h);
            return false;
        }
        let mut samples = frag.vector.clone();
        let last_sector = frag.last_sector;

        let mut k = align.begin;
        let mut fixes = 0;
        loop {
            let root = self.cache.root();
            k += overlap_forward(&root.vector, &samples, k - root.begin, k - fbegin);
            if let Some((skip_begin, skip_end)) = root.skipped {
                if (skip_begin..skip_end).contains(&k) {
                    k = skip_end;
                }
            }
            if k >= root.end() {
                break;
            }
            if k - fbegin >= samples.len() as i64 {
                self.cache.remove_fragment(h);
                return false;
            }
            fixes += 1;
            if fixes > MAX_RIFT_FIXES || !self.repair_rift(k, fbegin, &mut samples, progress) {
                debug!(pos = k, "unreconcilable rift");
                progress.report(k, ParanoiaCallback::Scratch);
                self.cache.remove_fragment(h);
                return false;
            }
        }

        let root = self.cache.root_mut();
        let old_end = root.end();
        let at = (old_end - fbegin) as usize;
        let grew = at < samples.len();
        if grew {
            root.append(&samples[at..]);
            root.last_sector = last_sector;
            progress.report(old_end, ParanoiaCallback::Verify);
        }
        self.cache.remove_fragment(h);
        grew
    }

    /// Resolve the disagreement at absolute position `k` between the root and
    /// `samples` (a fragment starting at `fbegin`).
    ///
    /// The root is only edited at or after its returned limit. Returns false
    /// if the rift cannot be repaired.
    fn repair_rift(&mut self, k: i64, fbegin: i64, samples: &mut Vec<i16>, progress: &mut Progress<'_>) -> bool {
        if !self.mode.contains(ParanoiaMode::REPAIR) {
            return false;
        }
        let root = self.cache.root_mut();
        let editable = k >= root.returned_limit;
        let ri = k - root.begin;
        let fi = k - fbegin;

        // too close to the root's end to resync; trust the longer read
        if root.end() - k < MIN_WORDS_RIFT {
            if !editable {
                return false;
            }
            root.truncate_at(k);
            progress.report(k, ParanoiaCallback::FixupEdge);
            return true;
        }

        if analyze_rift_silence_forward(&root.vector, samples, ri, fi) == (-1, -1) {
            if !editable {
                return false;
            }
            root.truncate_at(k);
            progress.report(k, ParanoiaCallback::FixupAtom);
            return true;
        }

        let m = analyze_rift_forward(&root.vector, samples, ri, fi);
        let (fi, ri) = (fi as usize, ri as usize);
        if m.is_none() || m.c != 0 {
            return false;
        }
        if m.a > 0 {
            if !editable {
                return false;
            }
            let dropped = samples[fi..fi + m.a as usize].to_vec();
            root.insert(k, &dropped);
            progress.report(k, ParanoiaCallback::FixupDropped);
        } else if m.a < 0 {
            if !editable {
                return false;
            }
            root.remove(k, (-m.a) as usize);
            progress.report(k, ParanoiaCallback::FixupDuped);
        } else if m.b > 0 {
            let dropped = &root.vector[ri..ri + m.b as usize];
            samples.splice(fi..fi, dropped.iter().copied());
            progress.report(k, ParanoiaCallback::FixupDropped);
        } else {
            samples.drain(fi..fi + (-m.b) as usize);
            progress.report(k, ParanoiaCallback::FixupDuped);
        }
        true
    }

    /// Get a reference to the underlying drive.
    #[must_use]
    pub fn drive(&self) -> &CdromDrive<S> {
        &self.drive
    }

    /// Get a mutable reference to the underlying drive.
    pub fn drive_mut(&mut self) -> &mut CdromDrive<S> {
        &mut self.drive
    }

    /// Current search width and drift state.
    #[must_use]
    pub fn overlap(&self) -> &DynamicOverlap {
        &self.overlap
    }

    /// Get the current cursor position in samples.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Get the current cursor position in sectors.
    #[must_use]
    pub fn cursor_sector(&self) -> Lsn {
        self.cursor.div_euclid(FRAME) as Lsn
    }

    /// Get the number of fragments currently tracked.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.cache.fragment_count()
    }

    /// Create an iterator over the remaining frames.
    #[must_use]
    pub fn iter(&mut self) -> ParanoiaIter<'_, S> {
        ParanoiaIter { paranoia: self }
    }
}

/// Sort index ranges and join the ones that overlap or touch.
fn merge_ranges(mut ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn decode_samples(bytes: &[u8], out: &mut [i16]) {
    for (s, b) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *s = i16::from_le_bytes([b[0], b[1]]);
    }
}

/// Iterator over paranoia-read frames.
pub struct ParanoiaIter<'a, S: SectorSource> {
    paranoia: &'a mut Paranoia<S>,
}

impl<S: SectorSource> Iterator for ParanoiaIter<'_, S> {
    type Item = Result<Vec<i16>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.paranoia.cursor_sector() > self.paranoia.last_sector {
            return None;
        }
        Some(self.paranoia.read(None).map(<[i16]>::to_vec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{MAX_DYNOVERLAP, MIN_SECTOR_EPSILON},
        source::{synth_sample, MemoryDisc},
        types::TestFlags,
    };

    fn session(disc: MemoryDisc) -> Paranoia<MemoryDisc> {
        Paranoia::open(CdromDrive::open(disc).unwrap())
    }

    fn signal(range: std::ops::Range<usize>) -> Vec<i16> {
        range.map(synth_sample).collect()
    }

    fn fragment(vector: Vec<i16>, begin: i64) -> VFragment {
        VFragment { vector, begin, last_sector: 0, one: None, offset: 0 }
    }

    #[test]
    fn test_paranoia_defaults() {
        let paranoia = session(MemoryDisc::new(10));
        assert_eq!(paranoia.mode(), ParanoiaMode::FULL);
        assert_eq!(paranoia.cursor_sector(), 0);
        assert_eq!(paranoia.readahead(), DEFAULT_READAHEAD);
        assert_eq!(paranoia.overlap().dynoverlap(), MAX_DYNOVERLAP);
    }

    #[test]
    fn test_paranoia_mode_set() {
        let mut paranoia = session(MemoryDisc::new(10));
        paranoia.set_mode(ParanoiaMode::DISABLE);
        assert_eq!(paranoia.mode(), ParanoiaMode::DISABLE);
        assert!(paranoia.enable_skip);

        paranoia.set_mode(ParanoiaMode::FULL | ParanoiaMode::NEVERSKIP);
        assert!(!paranoia.enable_skip);

        // FULL carries the NEVERSKIP bit
        paranoia.set_mode(ParanoiaMode::FULL);
        assert!(!paranoia.enable_skip);
        paranoia.set_mode(ParanoiaMode::FULL - ParanoiaMode::NEVERSKIP);
        assert!(paranoia.enable_skip);
    }

    #[test]
    fn test_paranoia_seek() {
        let mut paranoia = session(MemoryDisc::new(100));
        assert_eq!(paranoia.seek(SeekFrom::Start(50)), 50);
        assert_eq!(paranoia.cursor_sector(), 50);
        assert_eq!(paranoia.seek(SeekFrom::Current(-10)), 40);
        assert_eq!(paranoia.seek(SeekFrom::End(0)), 99);
        assert_eq!(paranoia.seek(SeekFrom::Start(1000)), 99);
        assert_eq!(paranoia.seek(SeekFrom::Current(-1000)), 0);
    }

    #[test]
    fn test_set_range_and_overlap() {
        let mut paranoia = session(MemoryDisc::new(100));
        paranoia.seek(SeekFrom::Start(90));
        paranoia.set_range(10, 200);
        assert_eq!(paranoia.cursor_sector(), 90);
        paranoia.set_range(10, 50);
        assert_eq!(paranoia.cursor_sector(), 10);
        assert_eq!(paranoia.seek(SeekFrom::End(5)), 50);

        paranoia.set_overlap(2);
        assert_eq!(paranoia.overlap().dynoverlap(), 2 * FRAME);
        assert!(paranoia.overlap().stage1.is_disabled());
    }

    #[test]
    fn test_paranoia_read_disabled() {
        let disc = MemoryDisc::new(10);
        let expected = disc.samples(3, 1);
        let mut paranoia = session(disc);
        paranoia.set_mode(ParanoiaMode::DISABLE);
        paranoia.seek(SeekFrom::Start(3));

        let mut reads = 0;
        let mut cb = |_: i64, ev: ParanoiaCallback| {
            if ev == ParanoiaCallback::Read {
                reads += 1;
            }
        };
        let frame = paranoia.read(Some(&mut cb)).unwrap();
        assert_eq!(frame, &expected[..]);
        assert_eq!(reads, 1);
        assert_eq!(paranoia.cursor_sector(), 4);
    }

    #[test]
    fn test_read_disabled_skips_bad_sector() {
        let mut disc = MemoryDisc::new(10);
        disc.mark_bad(0);
        let mut paranoia = session(disc);
        paranoia.set_mode(ParanoiaMode::DISABLE);
        let frame = paranoia.read(None).unwrap();
        assert!(frame.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_verified_read_converges() {
        let disc = MemoryDisc::new(50);
        let expected = disc.samples(0, 50);
        let mut paranoia = session(disc);

        let mut events = Vec::new();
        for sector in 0..50 {
            let mut cb = |pos: i64, ev: ParanoiaCallback| events.push((pos, ev));
            let frame = paranoia.read(Some(&mut cb)).unwrap();
            let at = sector * CD_FRAMEWORDS;
            assert_eq!(frame, &expected[at..at + CD_FRAMEWORDS], "sector {sector}");
        }
        assert!(events.iter().any(|&(_, ev)| ev == ParanoiaCallback::Verify));
        assert!(!events.iter().any(|&(_, ev)| ev == ParanoiaCallback::Skip));
        assert!(matches!(paranoia.read(None), Err(Error::UnaddressableSector(50))));
    }

    #[test]
    fn test_bad_sector_is_skipped() {
        let mut disc = MemoryDisc::new(30);
        disc.mark_bad(10);
        let expected = disc.samples(0, 30);
        let mut paranoia = session(disc);

        let mut skips = Vec::new();
        let mut frames = Vec::new();
        for _ in 0..30 {
            let mut cb = |pos: i64, ev: ParanoiaCallback| {
                if ev == ParanoiaCallback::Skip {
                    skips.push(pos);
                }
            };
            frames.push(paranoia.read(Some(&mut cb)).unwrap().to_vec());
        }

        assert_eq!(skips, vec![10 * FRAME]);
        assert!(frames[10].iter().all(|&s| s == 0));
        assert_eq!(frames[9], &expected[9 * CD_FRAMEWORDS..10 * CD_FRAMEWORDS]);
        assert_eq!(frames[11], &expected[11 * CD_FRAMEWORDS..12 * CD_FRAMEWORDS]);
        assert_eq!(frames[29], &expected[29 * CD_FRAMEWORDS..]);
    }

    #[test]
    fn test_neverskip_returns_error() {
        let mut disc = MemoryDisc::new(10);
        disc.mark_bad(0);
        let mut paranoia = session(disc);
        paranoia.set_mode(ParanoiaMode::FULL | ParanoiaMode::NEVERSKIP);

        let err = paranoia.read_limited(None, 3).unwrap_err();
        assert!(matches!(err, Error::SectorSkip(0, 3)));
        assert_eq!(paranoia.cursor_sector(), 0);
    }

    #[test]
    fn test_static_window_statistics() {
        let mut paranoia = session(MemoryDisc::new(50));
        paranoia.set_readahead(50);

        let mut adjustments = Vec::new();
        let mut points = Vec::new();
        for _ in 0..10 {
            paranoia.seek(SeekFrom::Start(0));
            let mut cb = |pos: i64, ev: ParanoiaCallback| {
                if ev == ParanoiaCallback::Overlap {
                    adjustments.push(pos);
                }
            };
            paranoia.read(Some(&mut cb)).unwrap();
            points.push(paranoia.overlap().stage1.offpoints);
        }

        assert_eq!(points, (1..=10).collect::<Vec<i64>>());
        assert_eq!(adjustments, vec![MIN_SECTOR_EPSILON]);
        assert_eq!(paranoia.overlap().dynoverlap(), MIN_SECTOR_EPSILON);
        assert_eq!(paranoia.overlap().dyndrift(), 0);
    }

    /// Read a whole jittery disc, checking every frame that was not skipped
    /// against the disc's samples. Returns the number of skipped frames.
    fn read_jittered(sectors: usize, readahead: usize, flags: TestFlags, seed: u64) -> usize {
        let disc = MemoryDisc::new(sectors);
        let expected = disc.samples(0, sectors);
        let mut drive = CdromDrive::open(disc).unwrap().with_seed(seed);
        drive.set_test_flags(flags);
        let mut paranoia = Paranoia::open(drive);
        paranoia.set_readahead(readahead);

        let mut skips = 0;
        for sector in 0..sectors {
            let mut skipped = false;
            let mut cb = |_: i64, ev: ParanoiaCallback| skipped |= ev == ParanoiaCallback::Skip;
            let frame = paranoia.read(Some(&mut cb)).unwrap().to_vec();
            if skipped {
                skips += 1;
                continue;
            }
            let at = sector * CD_FRAMEWORDS;
            assert!(
                frame == expected[at..at + CD_FRAMEWORDS],
                "{flags:?} seed {seed}: sector {sector} differs from the disc"
            );
        }
        assert!(paranoia.read(None).is_err());
        skips
    }

    #[test]
    fn test_small_jitter_matches_disc() {
        for seed in 1..=4 {
            assert_eq!(read_jittered(60, 40, TestFlags::JITTER_SMALL, seed), 0, "seed {seed}");
        }
        for seed in [1, 7] {
            let skips = read_jittered(300, DEFAULT_READAHEAD, TestFlags::JITTER_SMALL, seed);
            assert_eq!(skips, 0, "seed {seed}");
        }
    }

    #[test]
    fn test_small_always_jitter_matches_disc() {
        for seed in 1..=3 {
            read_jittered(60, 40, TestFlags::JITTER_SMALL | TestFlags::ALWAYS_JITTER, seed);
        }
    }

    #[test]
    fn test_large_jitter_matches_disc() {
        for seed in 1..=3 {
            read_jittered(60, 40, TestFlags::JITTER_LARGE, seed);
        }
    }

    #[test]
    fn test_large_always_jitter_matches_disc() {
        for seed in 1..=3 {
            read_jittered(60, 40, TestFlags::JITTER_LARGE | TestFlags::ALWAYS_JITTER, seed);
        }
    }

    #[test]
    fn test_verify_prefers_in_place_agreement() {
        let mut paranoia = session(MemoryDisc::new(4));
        // this read landed 30 samples late
        paranoia.cache.insert_block(CBlock::new(signal(30..4030), 0, 3));
        paranoia.cache.insert_block(CBlock::new(signal(0..4000), 0, 3));
        let h = paranoia.cache.insert_block(CBlock::new(signal(0..4000), 0, 3));

        paranoia.verify_block(h, &mut Progress::silent());
        let fragments: Vec<(i64, usize, i64)> = paranoia
            .cache
            .fragments()
            .map(|(_, v)| (v.begin, v.len(), v.offset))
            .collect();
        assert_eq!(fragments, vec![(0, 4000, 0)]);
        assert_eq!(paranoia.overlap().stage1.offpoints, 1);
    }

    #[test]
    fn test_verify_searches_offsets_outside_in_place_runs() {
        let mut paranoia = session(MemoryDisc::new(4));
        paranoia.cache.insert_block(CBlock::new(signal(0..2000), 0, 3));
        paranoia.cache.insert_block(CBlock::new(signal(2030..4030), 2000, 3));
        let h = paranoia.cache.insert_block(CBlock::new(signal(0..4000), 0, 3));

        paranoia.verify_block(h, &mut Progress::silent());
        let fragments: Vec<(i64, i64)> = paranoia.cache.fragments().map(|(_, v)| (v.begin, v.offset)).collect();
        assert_eq!(fragments, vec![(0, 0), (2030, -30)]);
        assert_eq!(paranoia.overlap().stage1.offpoints, 2);
    }

    #[test]
    fn test_root_seeded_from_in_place_fragment() {
        let mut paranoia = session(MemoryDisc::new(4));
        let shifted = VFragment { offset: 40, ..fragment(signal(0..2000), 0) };
        paranoia.cache.insert_fragment(shifted.clone());
        assert!(!paranoia.init_root(100, false, &mut Progress::silent()));

        paranoia.cache.insert_fragment(fragment(signal(50..2050), 50));
        assert!(paranoia.init_root(100, false, &mut Progress::silent()));
        assert_eq!(paranoia.cache.root().begin, 50);

        paranoia.cache.reset_all();
        paranoia.cache.insert_fragment(shifted);
        assert!(paranoia.init_root(100, true, &mut Progress::silent()));
        assert_eq!(paranoia.cache.root().begin, 0);
    }

    #[test]
    fn test_merge_repairs_dropped_samples() {
        let mut paranoia = session(MemoryDisc::new(4));
        let root: Vec<i16> = [signal(0..600), signal(610..1000)].concat();
        paranoia.cache.root_mut().set(root, 0, 0);
        let h = paranoia.cache.insert_fragment(fragment(signal(200..2000), 200));

        let mut events = Vec::new();
        let mut cb = |pos: i64, ev: ParanoiaCallback| events.push((pos, ev));
        let mut progress = Progress::new(Some(&mut cb));
        assert!(paranoia.merge_fragment(h, &mut progress));
        drop(progress);

        assert_eq!(paranoia.cache.root().vector, signal(0..2000));
        assert_eq!(paranoia.fragment_count(), 0);
        assert_eq!(
            events,
            vec![(600, ParanoiaCallback::FixupDropped), (1000, ParanoiaCallback::Verify)]
        );
    }

    #[test]
    fn test_merge_removes_duplicated_samples() {
        let mut paranoia = session(MemoryDisc::new(4));
        let root: Vec<i16> = [signal(0..600), signal(590..1000)].concat();
        paranoia.cache.root_mut().set(root, 0, 0);
        let h = paranoia.cache.insert_fragment(fragment(signal(200..2000), 200));

        let mut events = Vec::new();
        let mut cb = |pos: i64, ev: ParanoiaCallback| events.push((pos, ev));
        let mut progress = Progress::new(Some(&mut cb));
        assert!(paranoia.merge_fragment(h, &mut progress));
        drop(progress);

        assert_eq!(paranoia.cache.root().vector, signal(0..2000));
        assert_eq!(events[0], (600, ParanoiaCallback::FixupDuped));
    }

    #[test]
    fn test_merge_repairs_fragment_side() {
        // the fragment, not the root, lost ten samples
        let mut paranoia = session(MemoryDisc::new(4));
        paranoia.cache.root_mut().set(signal(0..1000), 0, 0);
        let frag: Vec<i16> = [signal(200..600), signal(610..2000)].concat();
        let h = paranoia.cache.insert_fragment(fragment(frag, 200));

        let mut progress = Progress::silent();
        assert!(paranoia.merge_fragment(h, &mut progress));
        assert_eq!(paranoia.cache.root().vector, signal(0..2000));
    }

    #[test]
    fn test_merge_refuses_returned_edits() {
        let mut paranoia = session(MemoryDisc::new(4));
        let root: Vec<i16> = [signal(0..600), signal(610..1000)].concat();
        paranoia.cache.root_mut().set(root.clone(), 0, 0);
        paranoia.cache.root_mut().returned_limit = 800;
        let h = paranoia.cache.insert_fragment(fragment(signal(200..2000), 200));

        let mut scratches = 0;
        let mut cb = |_: i64, ev: ParanoiaCallback| {
            if ev == ParanoiaCallback::Scratch {
                scratches += 1;
            }
        };
        let mut progress = Progress::new(Some(&mut cb));
        assert!(!paranoia.merge_fragment(h, &mut progress));
        drop(progress);

        assert_eq!(scratches, 1);
        assert_eq!(paranoia.cache.root().vector, root);
        assert_eq!(paranoia.fragment_count(), 0);
    }

    #[test]
    fn test_skip_keeps_verified_audio() {
        let mut paranoia = session(MemoryDisc::new(4));
        paranoia.cache.root_mut().set(signal(0..1500), 0, 1);

        let mut skips = Vec::new();
        let mut cb = |pos: i64, ev: ParanoiaCallback| skips.push((pos, ev));
        let mut progress = Progress::new(Some(&mut cb));
        paranoia.skip_frame(FRAME, 20, &mut progress).unwrap();
        assert_eq!(paranoia.output[..1500 - CD_FRAMEWORDS], signal(CD_FRAMEWORDS..1500)[..]);
        assert!(paranoia.output[1500 - CD_FRAMEWORDS..].iter().all(|&s| s == 0));
        assert_eq!(paranoia.cache.root().skipped, Some((1500, 2 * FRAME)));

        paranoia.skip_frame(2 * FRAME, 20, &mut progress).unwrap();
        drop(progress);
        assert!(paranoia.output.iter().all(|&s| s == 0));
        let root = paranoia.cache.root();
        assert_eq!(root.skipped, Some((1500, 3 * FRAME)));
        assert_eq!(root.verified_end(), 1500);
        assert_eq!(skips, vec![(FRAME, ParanoiaCallback::Skip), (2 * FRAME, ParanoiaCallback::Skip)]);
    }

    #[test]
    fn test_merge_steps_over_skipped_frame() {
        let mut paranoia = session(MemoryDisc::new(4));
        let root = paranoia.cache.root_mut();
        root.set([signal(0..2000), vec![0; CD_FRAMEWORDS]].concat(), 0, 1);
        root.skipped = Some((2000, 2000 + FRAME));
        let h = paranoia.cache.insert_fragment(fragment(signal(1500..5000), 1500));

        assert!(paranoia.merge_fragment(h, &mut Progress::silent()));
        let root = paranoia.cache.root();
        assert_eq!(root.end(), 5000);
        assert_eq!(root.vector[..2000], signal(0..2000)[..]);
        assert!(root.vector[2000..2000 + CD_FRAMEWORDS].iter().all(|&s| s == 0));
        assert_eq!(root.vector[2000 + CD_FRAMEWORDS..], signal(2000 + CD_FRAMEWORDS..5000)[..]);
        assert_eq!(root.verified_end(), 5000);
        assert_eq!(paranoia.overlap().stage2.offpoints, 1);
    }

    #[test]
    fn test_merge_after_skip_realigns() {
        // the fragment landed 20 samples early; the audio before the skipped
        // frame puts it back in place
        let mut paranoia = session(MemoryDisc::new(4));
        let root = paranoia.cache.root_mut();
        root.set([signal(0..2000), vec![0; CD_FRAMEWORDS]].concat(), 0, 1);
        root.skipped = Some((2000, 2000 + FRAME));
        let h = paranoia.cache.insert_fragment(fragment(signal(1500..5000), 1480));

        assert!(paranoia.merge_fragment(h, &mut Progress::silent()));
        let root = paranoia.cache.root();
        assert_eq!(root.end(), 5000);
        assert_eq!(root.vector[2000 + CD_FRAMEWORDS..], signal(2000 + CD_FRAMEWORDS..5000)[..]);
    }

    #[test]
    fn test_merge_after_leading_skip() {
        let mut paranoia = session(MemoryDisc::new(4));
        let root = paranoia.cache.root_mut();
        root.set(vec![0; CD_FRAMEWORDS], 0, 0);
        root.skipped = Some((0, FRAME));

        // only a fragment the reads agreed on in place may follow silence
        let shifted = VFragment { offset: 12, ..fragment(signal(1000..3000), 1000) };
        let h = paranoia.cache.insert_fragment(shifted);
        assert!(!paranoia.merge_fragment(h, &mut Progress::silent()));
        assert_eq!(paranoia.fragment_count(), 1);
        paranoia.cache.remove_fragment(h);

        let h = paranoia.cache.insert_fragment(fragment(signal(1000..3000), 1000));
        assert!(paranoia.merge_fragment(h, &mut Progress::silent()));
        let root = paranoia.cache.root();
        assert_eq!(root.end(), 3000);
        assert_eq!(root.vector[CD_FRAMEWORDS..], signal(CD_FRAMEWORDS..3000)[..]);
        assert_eq!(root.skipped, Some((0, FRAME)));
        assert_eq!(paranoia.overlap().stage2.offpoints, 0);
    }

    #[test]
    fn test_offset_fragment_not_counted_as_drift() {
        let mut paranoia = session(MemoryDisc::new(4));
        paranoia.cache.root_mut().set(signal(0..2000), 0, 0);
        let frag = VFragment { offset: 30, ..fragment(signal(1000..3000), 1000) };
        let h = paranoia.cache.insert_fragment(frag);

        assert!(paranoia.merge_fragment(h, &mut Progress::silent()));
        assert_eq!(paranoia.cache.root().vector, signal(0..3000));
        assert_eq!(paranoia.overlap().stage2.offpoints, 0);
    }

    #[test]
    fn test_redundant_fragment_released() {
        let mut paranoia = session(MemoryDisc::new(4));
        paranoia.cache.root_mut().set(signal(0..2000), 0, 0);
        let h = paranoia.cache.insert_fragment(fragment(signal(500..1500), 500));

        assert!(!paranoia.merge_fragment(h, &mut Progress::silent()));
        assert_eq!(paranoia.fragment_count(), 0);
        assert_eq!(paranoia.overlap().stage2.offpoints, 1);
    }
}
