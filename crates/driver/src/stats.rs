//! Frame statistics.
//!
//! [`Sample`] aggregates a sequence of `i32` values (count, min, max, mean,
//! standard deviation) without storing them. [`FrameStats`] collects the
//! per-frame accounting the upload engine produces: CPU time vs total
//! upload time, uploaded pixels, SPI write-runs, scanline margin,
//! effective vsync spacing and tear count.
//!
//! CPU time is measured with a pause/resume counter: the engine pauses it
//! whenever it hands control to the DMA channel or arms a wait timer, and
//! resumes it on re-entry, so the figure excludes everything spent
//! sleeping on hardware.

use core::fmt;

/// Streaming aggregate of an `i32` sequence.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    count: u32,
    min: i32,
    max: i32,
    sum: i64,
    sumsqr: i64,
}

impl Default for Sample {
    fn default() -> Self {
        Self::new()
    }
}

impl Sample {
    /// An empty aggregate.
    pub const fn new() -> Self {
        Self {
            count: 0,
            min: i32::MAX,
            max: i32::MIN,
            sum: 0,
            sumsqr: 0,
        }
    }

    /// Forget everything recorded so far.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one value.
    pub fn push(&mut self, val: i32) {
        self.count += 1;
        self.sum += i64::from(val);
        self.sumsqr += i64::from(val) * i64::from(val);
        if val < self.min {
            self.min = val;
        }
        if val > self.max {
            self.max = val;
        }
    }

    /// Number of values recorded.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Smallest value recorded, or 0 when empty.
    pub fn min(&self) -> i32 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    /// Largest value recorded, or 0 when empty.
    pub fn max(&self) -> i32 {
        if self.count == 0 {
            0
        } else {
            self.max
        }
    }

    /// Arithmetic mean, or 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / f64::from(self.count)
        }
    }

    /// Standard deviation around the mean, or 0 when empty.
    pub fn std(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = f64::from(self.count);
        let a = self.sum as f64;
        let var = (self.sumsqr as f64 - (a * a) / n) / n;
        libm::sqrt(var.max(0.0))
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg={:.1} [min={} , max={}] std={:.1}",
            self.mean(),
            self.min(),
            self.max(),
            self.std()
        )
    }
}

/// Per-frame statistics collector for the upload engine.
#[derive(Debug, Default)]
pub struct FrameStats {
    frames: u32,
    vsynced_frames: u32,
    teared_frames: u32,
    total_time_us: u64,

    cpu_us: Sample,
    upload_us: Sample,
    pixels: Sample,
    transactions: Sample,
    margin: Sample,
    spacing: Sample,

    // working state of the frame in progress
    frame_active: bool,
    vsync_on: bool,
    frame_start: u32,
    seg_start: u32,
    cpu_accum: u32,
    nb_transactions: u32,
    nb_pixels: u32,
}

impl FrameStats {
    /// A fresh collector.
    pub const fn new() -> Self {
        Self {
            frames: 0,
            vsynced_frames: 0,
            teared_frames: 0,
            total_time_us: 0,
            cpu_us: Sample::new(),
            upload_us: Sample::new(),
            pixels: Sample::new(),
            transactions: Sample::new(),
            margin: Sample::new(),
            spacing: Sample::new(),
            frame_active: false,
            vsync_on: false,
            frame_start: 0,
            seg_start: 0,
            cpu_accum: 0,
            nb_transactions: 0,
            nb_pixels: 0,
        }
    }

    /// Drop all aggregates (the frame in progress keeps accounting).
    pub fn reset(&mut self) {
        let active = self.frame_active;
        let vsync = self.vsync_on;
        let fs = self.frame_start;
        let ss = self.seg_start;
        let cpu = self.cpu_accum;
        let nbt = self.nb_transactions;
        let nbp = self.nb_pixels;
        *self = Self::new();
        self.frame_active = active;
        self.vsync_on = vsync;
        self.frame_start = fs;
        self.seg_start = ss;
        self.cpu_accum = cpu;
        self.nb_transactions = nbt;
        self.nb_pixels = nbp;
    }

    pub(crate) fn start_frame(&mut self, now: u32, vsync_on: bool) {
        self.frame_active = true;
        self.vsync_on = vsync_on;
        self.frame_start = now;
        self.seg_start = now;
        self.cpu_accum = 0;
        self.nb_transactions = 0;
        self.nb_pixels = 0;
    }

    /// Stop the CPU counter: control is handed to DMA or a timer.
    pub(crate) fn pause(&mut self, now: u32) {
        self.cpu_accum = self
            .cpu_accum
            .wrapping_add(now.wrapping_sub(self.seg_start));
        self.seg_start = now;
    }

    /// Restart the CPU counter on re-entry.
    pub(crate) fn resume(&mut self, now: u32) {
        self.seg_start = now;
    }

    pub(crate) fn add_transaction(&mut self) {
        self.nb_transactions += 1;
    }

    pub(crate) fn add_pixels(&mut self, n: u32) {
        self.nb_pixels += n;
    }

    pub(crate) fn end_frame(&mut self, now: u32, margin: i32, last_delta: u32, teared: bool) {
        if !self.frame_active {
            return;
        }
        self.frame_active = false;
        self.pause(now);

        self.frames += 1;
        let wall = now.wrapping_sub(self.frame_start);
        self.total_time_us += u64::from(wall);
        self.cpu_us.push(self.cpu_accum as i32);
        self.upload_us.push(wall as i32);
        self.pixels.push(self.nb_pixels as i32);
        self.transactions.push(self.nb_transactions as i32);

        if self.vsync_on {
            self.vsynced_frames += 1;
            self.margin.push(margin);
            if self.vsynced_frames > 1 {
                // the first vsynced frame has no predecessor to space against
                self.spacing.push(last_delta as i32);
            }
            if teared {
                self.teared_frames += 1;
            }
        }
    }

    /// Frames completed since the last reset.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Frames completed with vsync active.
    pub fn vsynced_frames(&self) -> u32 {
        self.vsynced_frames
    }

    /// Vsynced frames whose margin went negative.
    pub fn teared_frames(&self) -> u32 {
        self.teared_frames
    }

    /// Fraction of vsynced frames that may have teared.
    pub fn teared_ratio(&self) -> f64 {
        if self.vsynced_frames == 0 {
            0.0
        } else {
            f64::from(self.teared_frames) / f64::from(self.vsynced_frames)
        }
    }

    /// Average achieved framerate in Hz.
    pub fn framerate(&self) -> f64 {
        if self.total_time_us == 0 {
            0.0
        } else {
            f64::from(self.frames) * 1_000_000.0 / self.total_time_us as f64
        }
    }

    /// CPU time per frame in microseconds.
    pub fn cpu_time(&self) -> &Sample {
        &self.cpu_us
    }

    /// Wall time per frame (CPU + waits) in microseconds.
    pub fn upload_time(&self) -> &Sample {
        &self.upload_us
    }

    /// Pixels uploaded per frame.
    pub fn pixels(&self) -> &Sample {
        &self.pixels
    }

    /// SPI write-runs per frame.
    pub fn transactions(&self) -> &Sample {
        &self.transactions
    }

    /// Scanline margin per vsynced frame; a negative minimum means a tear.
    pub fn margin(&self) -> &Sample {
        &self.margin
    }

    /// Refresh periods between consecutive vsynced frames.
    pub fn spacing(&self) -> &Sample {
        &self.spacing
    }
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frames: {} ({:.1} Hz), vsynced: {}, teared: {} ({:.1}%)",
            self.frames,
            self.framerate(),
            self.vsynced_frames,
            self.teared_frames,
            self.teared_ratio() * 100.0
        )?;
        writeln!(f, "cpu time     : {}us", self.cpu_us)?;
        writeln!(f, "upload time  : {}us", self.upload_us)?;
        writeln!(f, "pixels       : {}", self.pixels)?;
        writeln!(f, "write runs   : {}", self.transactions)?;
        writeln!(f, "margin       : {}", self.margin)?;
        write!(f, "vsync spacing: {}", self.spacing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_tracks_min_max_mean() {
        let mut s = Sample::new();
        for v in [3, -1, 10, 4] {
            s.push(v);
        }
        assert_eq!(s.count(), 4);
        assert_eq!(s.min(), -1);
        assert_eq!(s.max(), 10);
        assert!((s.mean() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn sample_std_of_constant_sequence_is_zero() {
        let mut s = Sample::new();
        for _ in 0..8 {
            s.push(7);
        }
        assert!(s.std() < 1e-9);
    }

    #[test]
    fn empty_sample_reports_zeroes() {
        let s = Sample::new();
        assert_eq!(s.min(), 0);
        assert_eq!(s.max(), 0);
        assert_eq!(s.mean(), 0.0);
        assert_eq!(s.std(), 0.0);
    }

    #[test]
    fn cpu_counter_excludes_paused_spans() {
        let mut st = FrameStats::new();
        st.start_frame(1_000, true);
        st.pause(1_100); // 100 us of work
        st.resume(5_000); // 3900 us asleep
        st.end_frame(5_050, 10, 2, false); // 50 more us of work
        assert_eq!(st.cpu_time().max(), 150);
        assert_eq!(st.upload_time().max(), 4_050);
    }

    #[test]
    fn first_vsynced_frame_does_not_record_spacing() {
        let mut st = FrameStats::new();
        st.start_frame(0, true);
        st.end_frame(100, 5, 99, false);
        assert_eq!(st.spacing().count(), 0);
        st.start_frame(200, true);
        st.end_frame(300, 5, 2, false);
        assert_eq!(st.spacing().count(), 1);
        assert_eq!(st.spacing().max(), 2);
    }

    #[test]
    fn teared_frames_are_counted_for_vsynced_frames_only() {
        let mut st = FrameStats::new();
        st.start_frame(0, false);
        st.end_frame(10, -5, 0, true); // not vsynced: ignored
        assert_eq!(st.teared_frames(), 0);
        st.start_frame(20, true);
        st.end_frame(30, -5, 1, true);
        assert_eq!(st.teared_frames(), 1);
        assert!((st.teared_ratio() - 1.0).abs() < 1e-9);
    }
}
