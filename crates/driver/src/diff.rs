//! Differential framebuffer encoding.
//!
//! A [`DiffBuffer`] compresses the delta between the canonical mirror and
//! a new (possibly rotated) framebuffer into an opaque byte arena, as a
//! sequence of `(write, skip)` pixel-count pairs over the canonical
//! row-major address space. The producer makes a single pass; the
//! consumer replays the stream strictly in order as write-runs
//! `(x, y, len)`, clipped on the fly against the panel's refresh scanline
//! so the upload never writes closer than [`MIN_SCANLINE_SPACE`] lines
//! ahead of the scan.
//!
//! The arena never overflows hard: when space runs out the remainder of
//! the delta collapses into a single "write everything left" run, so a
//! diff degrades toward a full redraw instead of failing.
//!
//! [`DummyDiff`] speaks the same consumer protocol but covers the whole
//! screen without comparing a single pixel — it is what full redraws and
//! unbuffered updates stream from.

use crate::rotation::{copy_rotated, Rotation};
use crate::stats::Sample;
use crate::{NB_PIXELS, TFT_HEIGHT, TFT_WIDTH};

/// Minimum clearance, in scanlines, kept between a run's row and the
/// refresh scanline before the run is released.
pub const MIN_SCANLINE_SPACE: u32 = 8;

/// Upper bound, in whole scanlines, on a single released run.
pub const MAX_SEGMENT_LINES: u32 = 120;

/// `instant_scanline` value that disables scan pacing entirely.
pub(crate) const UNPACED: u32 = u32::MAX;

/// Smallest arena the encoder will accept.
pub const MIN_BUFFER_SIZE: usize = 16;

const PADDING: usize = 8;
const TAG_END: u32 = (1 << 22) - 1;
const TAG_WRITE_ALL: u32 = (1 << 22) - 2;

const WIDTH: u32 = TFT_WIDTH as u32;
const HEIGHT: u32 = TFT_HEIGHT as u32;

/// One step of the consumer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiffRead {
    /// Upload `len` pixels starting at canonical `(x, y)` now.
    Run {
        /// Canonical start column.
        x: u32,
        /// Canonical start row.
        y: u32,
        /// Pixel count. Spans whole rows only when `x == 0`; a run
        /// starting mid-row never crosses the row end.
        len: u32,
    },
    /// The next run sits too close behind the scan; re-read once the
    /// scanline has passed `scanline` (always above the instant passed
    /// in).
    Wait {
        /// Scanline to wait for.
        scanline: u32,
    },
    /// Stream exhausted.
    End,
}

// Old-framebuffer access for the encoder: reading always, writing only
// when the mirror copy rides along. Monomorphizes the scan loop per
// variant.
trait OldFb {
    fn at(&self, i: usize) -> u16;
    fn store(&mut self, i: usize, v: u16);
}

struct OldRead<'a>(&'a [u16]);

impl OldFb for OldRead<'_> {
    #[inline(always)]
    fn at(&self, i: usize) -> u16 {
        self.0[i]
    }
    #[inline(always)]
    fn store(&mut self, _i: usize, _v: u16) {}
}

struct OldCopy<'a>(&'a mut [u16]);

impl OldFb for OldCopy<'_> {
    #[inline(always)]
    fn at(&self, i: usize) -> u16 {
        self.0[i]
    }
    #[inline(always)]
    fn store(&mut self, i: usize, v: u16) {
        self.0[i] = v;
    }
}

/// A reusable diff between two framebuffers, stored in a caller-provided
/// byte arena.
///
/// Each `compute` call overwrites the previous content. 1 KiB is small
/// but workable; 5–10 KiB absorbs typical animation deltas without
/// overflowing. An arena below [`MIN_BUFFER_SIZE`] yields a buffer that
/// only ever produces empty diffs.
pub struct DiffBuffer<'a> {
    buf: &'a mut [u8],
    cap: usize,
    posw: usize,
    posr: usize,

    r_x: u32,
    r_y: u32,
    r_len: u32,
    r_cont: bool,
    off: u32,

    overflows: u32,
    size_stats: Sample,
    time_stats: Sample,
}

impl<'a> DiffBuffer<'a> {
    /// Wrap a byte arena.
    pub fn new(buf: &'a mut [u8]) -> DiffBuffer<'a> {
        let cap = if buf.len() >= MIN_BUFFER_SIZE {
            buf.len() - PADDING
        } else {
            0
        };
        let mut d = DiffBuffer {
            buf,
            cap,
            posw: 0,
            posr: 0,
            r_x: 0,
            r_y: 0,
            r_len: 0,
            r_cont: false,
            off: 0,
            overflows: 0,
            size_stats: Sample::new(),
            time_stats: Sample::new(),
        };
        if d.usable() {
            d.write_encoded(TAG_END);
        }
        d.init_read();
        d
    }

    fn usable(&self) -> bool {
        self.cap > 0
    }

    /// Bytes used by the current diff (the whole arena when overflowed).
    pub fn size(&self) -> usize {
        if self.posw >= self.cap {
            self.cap + PADDING
        } else {
            self.posw
        }
    }

    // ── Producer ─────────────────────────────────────────────────────────

    /// Diff `new` (laid out for `rotation`) against the canonical `old`
    /// without touching `old`.
    ///
    /// `compare_mask` selects the color bits that participate in the
    /// comparison; `0` and `0xFFFF` both mean exact. Two changed spans on
    /// a row merge when separated by at most `gap` unchanged pixels.
    pub fn compute(
        &mut self,
        old: &[u16],
        new: &[u16],
        rotation: Rotation,
        gap: u32,
        compare_mask: u16,
    ) {
        debug_assert!(old.len() >= NB_PIXELS && new.len() >= NB_PIXELS);
        self.posw = 0;
        if !self.usable() {
            self.finish_compute(false);
            return;
        }
        let overflow = self.dispatch(&mut OldRead(old), new, rotation, gap, compare_mask);
        self.finish_compute(overflow);
    }

    /// Like [`Self::compute`], but also copies `new` over `old` in the
    /// same pass, so `old` ends up holding the canonical image of `new`.
    ///
    /// Only pixels that differ are stored back: pixels equal under the
    /// mask keep their old value, which keeps `old` byte-identical to the
    /// panel content the diff will produce.
    pub fn compute_with_copy(
        &mut self,
        old: &mut [u16],
        new: &[u16],
        rotation: Rotation,
        gap: u32,
        compare_mask: u16,
    ) {
        debug_assert!(old.len() >= NB_PIXELS && new.len() >= NB_PIXELS);
        self.posw = 0;
        if !self.usable() {
            copy_rotated(old, new, rotation);
            self.finish_compute(false);
            return;
        }
        let overflow = self.dispatch(&mut OldCopy(old), new, rotation, gap, compare_mask);
        if overflow {
            // the riding copy stopped at the overflow point
            copy_rotated(old, new, rotation);
        }
        self.finish_compute(overflow);
    }

    fn dispatch<O: OldFb>(
        &mut self,
        old: &mut O,
        new: &[u16],
        rotation: Rotation,
        gap: u32,
        mask: u16,
    ) -> bool {
        let exact = mask == 0 || mask == 0xFFFF;
        match rotation {
            Rotation::Portrait => self.scan_pairs(old, new, 0..NB_PIXELS, gap, mask, exact),
            Rotation::Landscape => {
                let walk = (0..TFT_HEIGHT)
                    .flat_map(|i| (0..TFT_WIDTH).rev().map(move |j| i + TFT_HEIGHT * j));
                self.scan_pairs(old, new, walk, gap, mask, exact)
            }
            Rotation::PortraitFlipped => {
                self.scan_pairs(old, new, (0..NB_PIXELS).rev(), gap, mask, exact)
            }
            Rotation::LandscapeFlipped => {
                let walk = (0..TFT_HEIGHT)
                    .rev()
                    .flat_map(|i| (0..TFT_WIDTH).map(move |j| i + TFT_HEIGHT * j));
                self.scan_pairs(old, new, walk, gap, mask, exact)
            }
        }
    }

    /// The single-pass encoder. Returns true when the arena overflowed
    /// and the tail collapsed into a write-all marker.
    fn scan_pairs<O: OldFb>(
        &mut self,
        old: &mut O,
        new: &[u16],
        walk: impl Iterator<Item = usize>,
        gap: u32,
        mask: u16,
        exact: bool,
    ) -> bool {
        let mut cgap: u32 = 0; // unchanged pixels since the last changed one
        let mut pos: u32 = 0; // canonical offset where the open chunk began
        let mut n: u32 = 0; // canonical offset of the current pixel
        for ind in walk {
            let ov = old.at(n as usize);
            let nv = new[ind];
            let differs = if exact {
                ov != nv
            } else {
                (ov ^ nv) & mask != 0
            };
            if differs {
                old.store(n as usize, nv);
                if cgap > gap {
                    if !self.write_chunk(n - pos - cgap, cgap) {
                        return true;
                    }
                    pos = n;
                }
                cgap = 0;
            } else {
                cgap += 1;
            }
            n += 1;
        }
        let total = NB_PIXELS as u32;
        if total - pos - cgap != 0 {
            return !self.write_chunk(total - pos - cgap, cgap);
        }
        false
    }

    fn finish_compute(&mut self, overflow: bool) {
        if self.usable() {
            self.write_encoded(TAG_END);
        }
        self.size_stats.push(self.size() as i32);
        if overflow {
            self.overflows += 1;
        }
        self.init_read();
    }

    /// Append a `(write, skip)` chunk; on exhaustion write the collapse
    /// marker instead and report failure.
    fn write_chunk(&mut self, nb_write: u32, nb_skip: u32) -> bool {
        if self.posw >= self.cap {
            self.write_encoded(TAG_WRITE_ALL);
            return false;
        }
        self.write_encoded(nb_write);
        self.write_encoded(nb_skip);
        true
    }

    /// Values below 2^22, 1 to 3 bytes, length in the low bits.
    fn write_encoded(&mut self, val: u32) {
        debug_assert!(val < (1 << 22));
        if val <= 127 {
            self.buf[self.posw] = (val << 1) as u8; // bit0 = 0: one byte
            self.posw += 1;
        } else if val <= 16_383 {
            self.buf[self.posw] = (((val & 63) << 2) | 1) as u8; // 01: two bytes
            self.buf[self.posw + 1] = ((val >> 6) & 255) as u8;
            self.posw += 2;
        } else {
            self.buf[self.posw] = (((val & 63) << 2) | 3) as u8; // 11: three bytes
            self.buf[self.posw + 1] = ((val >> 6) & 255) as u8;
            self.buf[self.posw + 2] = ((val >> 14) & 255) as u8;
            self.posw += 3;
        }
    }

    fn read_encoded(&mut self) -> u32 {
        let b = self.buf[self.posr];
        self.posr += 1;
        match b & 3 {
            1 => {
                let mut r = u32::from(b >> 2);
                r += u32::from(self.buf[self.posr]) << 6;
                self.posr += 1;
                r
            }
            3 => {
                let mut r = u32::from(b >> 2);
                r += u32::from(self.buf[self.posr]) << 6;
                r += u32::from(self.buf[self.posr + 1]) << 14;
                self.posr += 2;
                r
            }
            _ => u32::from(b >> 1),
        }
    }

    // ── Consumer ─────────────────────────────────────────────────────────

    /// Rewind the read cursor to the start of the stream.
    pub fn init_read(&mut self) {
        self.r_cont = false;
        self.posr = 0;
        self.off = 0;
    }

    /// Next consumer step, paced by the current `instant_scanline`
    /// (pass a value ≥ 320 to disable pacing).
    pub fn read(&mut self, instant_scanline: u32) -> DiffRead {
        if self.posw == 0 {
            return DiffRead::End;
        }
        if !self.r_cont {
            let mut nb_write;
            let mut nb_skip;
            loop {
                nb_write = self.read_encoded();
                if nb_write == TAG_END {
                    return DiffRead::End;
                }
                if nb_write == TAG_WRITE_ALL {
                    let total = NB_PIXELS as u32;
                    if self.off >= total {
                        return DiffRead::End;
                    }
                    nb_write = total - self.off;
                    nb_skip = 0;
                } else {
                    nb_skip = self.read_encoded();
                }
                if nb_write > 0 {
                    break;
                }
                self.off += nb_skip;
            }
            self.r_y = self.off / WIDTH;
            self.r_x = self.off % WIDTH;
            self.off += nb_skip + nb_write;
            self.r_len = nb_write;
            self.r_cont = true;
        }

        let x = self.r_x;
        let y = self.r_y;
        if instant_scanline < HEIGHT && y + MIN_SCANLINE_SPACE > instant_scanline {
            return DiffRead::Wait {
                scanline: (y + MIN_SCANLINE_SPACE).min(HEIGHT),
            };
        }
        if x > 0 {
            // a mid-row start is clipped at the row end
            if x + self.r_len <= WIDTH {
                let len = self.r_len;
                self.r_cont = false;
                return DiffRead::Run { x, y, len };
            }
            let len = WIDTH - x;
            self.r_len -= len;
            self.r_x = 0;
            self.r_y += 1;
            return DiffRead::Run { x, y, len };
        }
        // at a row start: release whole rows up to the scan position
        let maxl = (instant_scanline - y).min(MAX_SEGMENT_LINES);
        let nbw = maxl * WIDTH;
        if self.r_len <= nbw {
            let len = self.r_len;
            self.r_cont = false;
            return DiffRead::Run { x: 0, y, len };
        }
        self.r_len -= nbw;
        self.r_y += maxl;
        DiffRead::Run { x: 0, y, len: nbw }
    }

    /// Replay the whole stream into a canonical buffer, reading pixel
    /// values through the rotation traversal — the exact addressing the
    /// upload engine uses. Leaves the read cursor rewound.
    pub fn replay(&mut self, dest: &mut [u16], src: &[u16], rotation: Rotation) {
        self.init_read();
        loop {
            match self.read(UNPACED) {
                DiffRead::Run { x, y, len } => {
                    let start = (y * WIDTH + x) as usize;
                    for k in 0..len as usize {
                        let n = start + k;
                        dest[n] = src[rotation.src_index(n)];
                    }
                }
                // unreachable when unpaced
                DiffRead::Wait { .. } | DiffRead::End => break,
            }
        }
        self.init_read();
    }

    // ── Statistics ───────────────────────────────────────────────────────

    /// Number of diffs computed since the last stats reset.
    pub fn computed(&self) -> u32 {
        self.size_stats.count()
    }

    /// Number of computed diffs that overflowed the arena.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Fraction of computed diffs that overflowed.
    pub fn overflow_ratio(&self) -> f64 {
        if self.computed() == 0 {
            0.0
        } else {
            f64::from(self.overflows) / f64::from(self.computed())
        }
    }

    /// Byte-size aggregate of computed diffs.
    pub fn size_stats(&self) -> &Sample {
        &self.size_stats
    }

    /// Compute-time aggregate, fed by [`Self::note_compute_micros`].
    pub fn time_stats(&self) -> &Sample {
        &self.time_stats
    }

    /// Record how long the surrounding code spent in a `compute` call.
    pub fn note_compute_micros(&mut self, us: u32) {
        self.time_stats.push(us as i32);
    }

    /// Reset the producer statistics.
    pub fn stats_reset(&mut self) {
        self.overflows = 0;
        self.size_stats.reset();
        self.time_stats.reset();
    }
}

/// A diff that covers the whole screen without comparing pixels.
///
/// Exposes the same consumer protocol as [`DiffBuffer`]; end to end it
/// denotes the single run `(0, 0, 76800)`, released as paced slabs of at
/// most [`MAX_SEGMENT_LINES`] rows.
#[derive(Debug, Clone, Default)]
pub struct DummyDiff {
    current_line: u32,
}

impl DummyDiff {
    /// A fresh full-screen diff.
    pub const fn new() -> Self {
        Self { current_line: 0 }
    }

    /// Rewind to the top of the screen.
    pub fn init_read(&mut self) {
        self.current_line = 0;
    }

    /// Next consumer step; same contract as [`DiffBuffer::read`].
    pub fn read(&mut self, instant_scanline: u32) -> DiffRead {
        if self.current_line >= HEIGHT {
            return DiffRead::End;
        }
        if instant_scanline >= HEIGHT {
            // the scan wrapped past the end: stream as fast as possible
            let slab = MAX_SEGMENT_LINES.min(HEIGHT - self.current_line);
            let y = self.current_line;
            self.current_line += slab;
            return DiffRead::Run { x: 0, y, len: slab * WIDTH };
        }
        if instant_scanline < self.current_line + MIN_SCANLINE_SPACE {
            return DiffRead::Wait {
                scanline: (self.current_line + MIN_SCANLINE_SPACE).min(HEIGHT),
            };
        }
        let slab = (instant_scanline - self.current_line).min(MAX_SEGMENT_LINES);
        let y = self.current_line;
        self.current_line += slab;
        DiffRead::Run { x: 0, y, len: slab * WIDTH }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)] // failing loudly is the point here

    use super::*;

    fn fb_filled(v: u16) -> Vec<u16> {
        vec![v; NB_PIXELS]
    }

    fn collect_runs(d: &mut DiffBuffer<'_>) -> Vec<(u32, u32, u32)> {
        d.init_read();
        let mut runs = Vec::new();
        loop {
            match d.read(UNPACED) {
                DiffRead::Run { x, y, len } => runs.push((x, y, len)),
                DiffRead::End => break,
                DiffRead::Wait { .. } => panic!("unpaced read returned Wait"),
            }
        }
        runs
    }

    #[test]
    fn varint_roundtrip_at_length_boundaries() {
        let mut arena = [0u8; 64];
        let mut d = DiffBuffer::new(&mut arena);
        d.posw = 0;
        for v in [0, 1, 127, 128, 16_383, 16_384, TAG_WRITE_ALL, TAG_END] {
            d.write_encoded(v);
        }
        d.posr = 0;
        for v in [0, 1, 127, 128, 16_383, 16_384, TAG_WRITE_ALL, TAG_END] {
            assert_eq!(d.read_encoded(), v);
        }
    }

    #[test]
    fn identical_framebuffers_make_an_empty_diff() {
        let old = fb_filled(0x1234);
        let new = fb_filled(0x1234);
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(d.read(UNPACED), DiffRead::End);
    }

    #[test]
    fn last_pixel_change_yields_one_unit_run() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        new[NB_PIXELS - 1] = 0xFFFF;
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(collect_runs(&mut d), vec![(239, 319, 1)]);
    }

    #[test]
    fn full_change_collapses_into_cross_row_slabs() {
        let old = fb_filled(0x0000);
        let new = fb_filled(0xFFFF);
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        let runs = collect_runs(&mut d);
        // one stored chunk, released as 120-row slabs
        assert_eq!(
            runs,
            vec![
                (0, 0, 120 * 240),
                (0, 120, 120 * 240),
                (0, 240, 80 * 240)
            ]
        );
        let total: u32 = runs.iter().map(|r| r.2).sum();
        assert_eq!(total, NB_PIXELS as u32);
    }

    #[test]
    fn gap_merges_up_to_and_including_the_threshold() {
        // row 50: columns 0..=9 and 13..=20 changed; 3 unchanged between
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        for x in 0..10 {
            new[50 * 240 + x] = 0x07E0;
        }
        for x in 13..21 {
            new[50 * 240 + x] = 0x07E0;
        }
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 4, 0);
        assert_eq!(collect_runs(&mut d), vec![(0, 50, 21)]);

        // a separation of exactly `gap` still merges
        d.compute(&old, &new, Rotation::Portrait, 3, 0);
        assert_eq!(collect_runs(&mut d), vec![(0, 50, 21)]);

        // one less and the runs split
        d.compute(&old, &new, Rotation::Portrait, 2, 0);
        assert_eq!(collect_runs(&mut d), vec![(0, 50, 10), (13, 50, 8)]);
    }

    #[test]
    fn checkerboard_coalesces_under_gap() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        for x in (0..240).step_by(2) {
            new[100 * 240 + x] = 0xAAAA;
        }
        let mut arena = [0u8; 4096];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 4, 0);
        let runs = collect_runs(&mut d);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0], (0, 100, 239));
    }

    #[test]
    fn compare_mask_ignores_masked_out_bits() {
        let old = fb_filled(0x0000);
        let mut new = fb_filled(0x0001); // differs only in bit 0 everywhere
        new[42] = 0xF000; // one real change
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0xFFFE);
        assert_eq!(collect_runs(&mut d), vec![(42, 0, 1)]);
    }

    #[test]
    fn copy_variant_leaves_masked_equal_pixels_untouched() {
        let mut old = fb_filled(0x0000);
        let mut new = fb_filled(0x0001);
        new[7] = 0xF000;
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute_with_copy(&mut old, &new, Rotation::Portrait, 0, 0xFFFE);
        // the changed pixel is copied, the mask-equal ones keep the mirror value
        assert_eq!(old[7], 0xF000);
        assert_eq!(old[8], 0x0000);
    }

    #[test]
    fn overflow_degrades_to_write_all_and_replay_stays_exact() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        // many scattered changes to blow a tiny arena
        for i in (0..NB_PIXELS).step_by(97) {
            new[i] = 0xBEEF;
        }
        let mut arena = [0u8; MIN_BUFFER_SIZE + 16];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(d.overflows(), 1);
        assert!(d.overflow_ratio() > 0.99);

        let mut applied = old.clone();
        d.replay(&mut applied, &new, Rotation::Portrait);
        assert_eq!(applied, new);
    }

    #[test]
    fn copy_with_overflow_still_completes_the_mirror_copy() {
        let mut old = fb_filled(0);
        let mut new = fb_filled(0);
        for i in (0..NB_PIXELS).step_by(97) {
            new[i] = 0xBEEF;
        }
        let mut arena = [0u8; MIN_BUFFER_SIZE + 16];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute_with_copy(&mut old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(old, new);
    }

    #[test]
    fn replay_reproduces_the_new_frame_for_every_rotation() {
        for rot in [
            Rotation::Portrait,
            Rotation::Landscape,
            Rotation::PortraitFlipped,
            Rotation::LandscapeFlipped,
        ] {
            let old = fb_filled(0x1111);
            let new: Vec<u16> = (0..NB_PIXELS).map(|i| (i * 31) as u16).collect();
            let mut arena = vec![0u8; 256 * 1024];
            let mut d = DiffBuffer::new(&mut arena);
            d.compute(&old, &new, rot, 0, 0);
            let mut applied = old.clone();
            d.replay(&mut applied, &new, rot);
            let mut expect = vec![0u16; NB_PIXELS];
            copy_rotated(&mut expect, &new, rot);
            assert_eq!(applied, expect, "{rot:?}");
        }
    }

    #[test]
    fn mid_row_run_is_clipped_at_the_row_end() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        // 20 pixels straddling the end of row 10
        for i in 0..20 {
            new[10 * 240 + 230 + i] = 0x5555;
        }
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(collect_runs(&mut d), vec![(230, 10, 10), (0, 11, 10)]);
    }

    #[test]
    fn paced_read_waits_until_the_scan_passes_the_row() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        new[100 * 240] = 1;
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);

        d.init_read();
        assert_eq!(d.read(50), DiffRead::Wait { scanline: 108 });
        // still waiting at the threshold minus one
        assert_eq!(d.read(107), DiffRead::Wait { scanline: 108 });
        assert_eq!(d.read(108), DiffRead::Run { x: 0, y: 100, len: 1 });
    }

    #[test]
    fn paced_read_releases_only_rows_behind_the_scan() {
        let old = fb_filled(0);
        let new = fb_filled(1);
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        d.init_read();
        // scan at line 40: only 40 rows are safely behind it
        assert_eq!(d.read(40), DiffRead::Run { x: 0, y: 0, len: 40 * 240 });
    }

    #[test]
    fn wait_scanline_saturates_at_the_bottom() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        new[318 * 240] = 1;
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        d.init_read();
        assert_eq!(d.read(0), DiffRead::Wait { scanline: 320 });
    }

    #[test]
    fn undersized_arena_behaves_as_an_empty_diff() {
        let old = fb_filled(0);
        let new = fb_filled(1);
        let mut arena = [0u8; MIN_BUFFER_SIZE - 1];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(d.read(UNPACED), DiffRead::End);
    }

    #[test]
    fn dummy_diff_covers_the_screen_exactly_once() {
        let mut d = DummyDiff::new();
        d.init_read();
        let mut total = 0u32;
        let mut next_y = 0u32;
        loop {
            match d.read(UNPACED) {
                DiffRead::Run { x, y, len } => {
                    assert_eq!(x, 0);
                    assert_eq!(y, next_y);
                    next_y += len / 240;
                    total += len;
                }
                DiffRead::End => break,
                DiffRead::Wait { .. } => panic!("unpaced dummy returned Wait"),
            }
        }
        assert_eq!(total, NB_PIXELS as u32);
    }

    #[test]
    fn dummy_diff_paces_against_the_scanline() {
        let mut d = DummyDiff::new();
        d.init_read();
        assert_eq!(d.read(3), DiffRead::Wait { scanline: 8 });
        assert_eq!(d.read(60), DiffRead::Run { x: 0, y: 0, len: 60 * 240 });
        // next slab waits until the scan is 8 lines past line 60
        assert_eq!(d.read(60), DiffRead::Wait { scanline: 68 });
    }

    #[test]
    fn size_stats_track_compute_calls() {
        let old = fb_filled(0);
        let mut new = fb_filled(0);
        new[0] = 1;
        let mut arena = [0u8; 1024];
        let mut d = DiffBuffer::new(&mut arena);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        d.compute(&old, &new, Rotation::Portrait, 0, 0);
        assert_eq!(d.computed(), 2);
        assert_eq!(d.overflows(), 0);
        assert!(d.size_stats().max() > 0);
        d.stats_reset();
        assert_eq!(d.computed(), 0);
    }
}
