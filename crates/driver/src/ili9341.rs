//! The ILI9341 streaming driver: public surface and buffering
//! coordinator.
//!
//! One [`Ili9341Driver`] owns one [`DisplayLink`] and, optionally, one or
//! two internal framebuffers plus one or two diff arenas bound by the
//! application. What [`Ili9341Driver::update`] does depends on what is
//! bound:
//!
//! | bound | mode | behavior |
//! |---|---|---|
//! | nothing | no buffering | synchronous full-screen upload from the user buffer |
//! | fb1 + diff1 | double (one diff) | async diff upload; diff computed before launch |
//! | fb1 + diff1 + diff2 | double (two diffs) | next diff computed while the previous upload runs |
//! | fb1 + fb2 + both diffs | triple | frame staged in fb2 and launched from the completion boundary |
//!
//! An incomplete binding degrades to the nearest working mode; it is
//! never an error.
//!
//! The *mirror* tracks whether fb1 equals the panel content. Anything
//! that invalidates that equality (rotation, refresh mode, scroll,
//! sleep, rebinding, an explicit force) clears it, and the next update
//! becomes a full redraw through the dummy diff.

use embedded_hal::delay::DelayNs;
use platform::DisplayLink;

use crate::cmd::{
    Command, EXPECT_IMAGE_FORMAT, EXPECT_PIXEL_FORMAT, EXPECT_POWER_MODE, INIT_SEQUENCE,
    SELFDIAG_OK,
};
use crate::diff::{DiffBuffer, DummyDiff};
use crate::rotation::{copy_rotated, Rotation};
use crate::stats::FrameStats;
use crate::timing::{ScanlineOracle, MAX_REFRESH_MODE};
use crate::touch::TouchState;
use crate::upload::{ActiveDiff, ActiveUpload, DmaState, TimerAction};
use crate::{
    DEFAULT_DIFF_GAP, DEFAULT_LATE_START_RATIO, DEFAULT_REFRESH_RATE_HZ, DEFAULT_SPI_CLOCK,
    DEFAULT_SPI_CLOCK_READ, DEFAULT_VSYNC_SPACING, MAX_VSYNC_SPACING, NB_PIXELS, TFT_HEIGHT,
};

/// Which readback disagreed during init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadbackStage {
    /// Display power mode register.
    PowerMode,
    /// Pixel format register.
    PixelFormat,
    /// Image format register.
    ImageFormat,
    /// Self-diagnostic register.
    SelfDiag,
}

/// Panel bring-up failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    /// A post-init readback kept disagreeing after all retries.
    Readback {
        /// The register that disagreed.
        stage: ReadbackStage,
        /// The value it reported.
        got: u8,
    },
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InitError::Readback { stage, got } => {
                let name = match stage {
                    ReadbackStage::PowerMode => "power mode",
                    ReadbackStage::PixelFormat => "pixel format",
                    ReadbackStage::ImageFormat => "image format",
                    ReadbackStage::SelfDiag => "self-diagnostic",
                };
                write!(f, "panel init failed: {name} readback 0x{got:02X}")
            }
        }
    }
}

/// Diagnostic register snapshot, see [`Ili9341Driver::read_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusReadback {
    /// Display power mode (`0x9C` when healthy).
    pub power_mode: u8,
    /// Memory access control as the panel reports it.
    pub madctl: u8,
    /// Pixel format (`0x05` = 16 bpp).
    pub pixel_format: u8,
    /// Image format.
    pub image_format: u8,
    /// Self-diagnostic (`0xC0` when healthy).
    pub self_diag: u8,
}

impl core::fmt::Display for StatusReadback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "- power mode      : 0x{:02X}", self.power_mode)?;
        writeln!(f, "- MADCTL          : 0x{:02X}", self.madctl)?;
        writeln!(f, "- pixel format    : 0x{:02X}", self.pixel_format)?;
        writeln!(f, "- image format    : 0x{:02X}", self.image_format)?;
        write!(
            f,
            "- self-diagnostic : 0x{:02X} [{}]",
            self.self_diag,
            if self.self_diag == SELFDIAG_OK {
                "OK"
            } else {
                "ERROR"
            }
        )
    }
}

/// Buffering mode derived from the bound buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferingMode {
    /// No internal buffers: synchronous full redraws.
    None,
    /// One framebuffer, one diff.
    DoubleOneDiff,
    /// One framebuffer, two diffs: diff computation overlaps the upload.
    DoubleTwoDiff,
    /// Two framebuffers, two diffs.
    Triple,
}

const INIT_RETRIES: u32 = 5;
const READBACK_TIMEOUT_MS: u32 = 10;

/// The driver. `'b` is the lifetime of the bound buffers.
pub struct Ili9341Driver<'b, L: DisplayLink> {
    pub(crate) link: L,

    // configuration
    pub(crate) spi_clock: u32,
    pub(crate) spi_clock_read: u32,
    pub(crate) rotation: Rotation,
    pub(crate) refresh_mode: u8,
    pub(crate) vsync_spacing: i8,
    pub(crate) diff_gap: u32,
    pub(crate) compare_mask: u16,
    pub(crate) late_start_ratio: f32,
    pub(crate) late_start_override: bool,
    pub(crate) scanline_timeout_ms: u32,

    // timing
    pub(crate) oracle: ScanlineOracle,
    pub(crate) timeframestart: u32,
    pub(crate) slinit_anchor: u32,
    pub(crate) last_delta: u32,
    pub(crate) last_margin: i32,

    // buffers
    pub(crate) fb1: Option<&'b mut [u16]>,
    pub(crate) fb2: Option<&'b mut [u16]>,
    pub(crate) fb2_full: bool,
    pub(crate) diff1: Option<DiffBuffer<'b>>,
    pub(crate) diff2: Option<DiffBuffer<'b>>,
    pub(crate) dummy1: DummyDiff,
    pub(crate) dummy2: DummyDiff,
    pub(crate) mirror_valid: bool,
    pub(crate) pending_launch: Option<ActiveDiff>,

    // engine
    pub(crate) dma_state: DmaState,
    pub(crate) timer_action: TimerAction,
    pub(crate) active: Option<ActiveUpload>,

    pub(crate) stats: FrameStats,
    pub(crate) touch: TouchState,
}

impl<'b, L: DisplayLink> Ili9341Driver<'b, L> {
    /// Wrap a link. Nothing talks to the panel until [`Self::begin`].
    pub fn new(link: L) -> Self {
        Self {
            link,
            spi_clock: DEFAULT_SPI_CLOCK,
            spi_clock_read: DEFAULT_SPI_CLOCK_READ,
            rotation: Rotation::Portrait,
            refresh_mode: 0,
            vsync_spacing: DEFAULT_VSYNC_SPACING,
            diff_gap: DEFAULT_DIFF_GAP,
            compare_mask: 0,
            late_start_ratio: DEFAULT_LATE_START_RATIO,
            late_start_override: false,
            scanline_timeout_ms: 0,
            oracle: ScanlineOracle::new(),
            timeframestart: 0,
            slinit_anchor: 0,
            last_delta: 0,
            last_margin: 0,
            fb1: None,
            fb2: None,
            fb2_full: false,
            diff1: None,
            diff2: None,
            dummy1: DummyDiff::new(),
            dummy2: DummyDiff::new(),
            mirror_valid: false,
            pending_launch: None,
            dma_state: DmaState::Idle,
            timer_action: TimerAction::None,
            active: None,
            stats: FrameStats::new(),
            touch: TouchState::new(),
        }
    }

    // ── Bring-up ─────────────────────────────────────────────────────────

    /// Initialize the panel at the default SPI clocks.
    pub fn begin(&mut self, delay: &mut impl DelayNs) -> Result<(), InitError> {
        self.begin_with(DEFAULT_SPI_CLOCK, DEFAULT_SPI_CLOCK_READ, delay)
    }

    /// Initialize the panel: reset, command table, sleep-out, display-on,
    /// then verify the diagnostic readbacks (retrying the whole sequence
    /// a few times), measure the refresh period and settle on the
    /// default refresh rate.
    pub fn begin_with(
        &mut self,
        spi_clock: u32,
        spi_clock_read: u32,
        delay: &mut impl DelayNs,
    ) -> Result<(), InitError> {
        self.spi_clock = spi_clock;
        self.spi_clock_read = spi_clock_read;

        let mut verified = Err(InitError::Readback {
            stage: ReadbackStage::SelfDiag,
            got: 0,
        });
        for attempt in 1..=INIT_RETRIES {
            self.link.panel_reset();
            self.link.begin_tx(self.spi_clock);
            let mut i = 0;
            while INIT_SEQUENCE[i] != 0 {
                let count = INIT_SEQUENCE[i] as usize;
                i += 1;
                self.link.write_cmd8(INIT_SEQUENCE[i]);
                for k in 1..count {
                    self.link.write_data8(INIT_SEQUENCE[i + k]);
                }
                i += count;
            }
            self.link.write_cmd8(Command::SleepOut as u8);
            self.link.end_tx();
            delay.delay_ms(150);
            self.link.begin_tx(self.spi_clock);
            self.link.write_cmd8(Command::DisplayOn as u8);
            self.link.end_tx();
            delay.delay_ms(50);

            verified = self.verify_readbacks();
            if verified.is_ok() {
                break;
            }
            log::warn!("panel init readback mismatch, attempt {attempt}/{INIT_RETRIES}");
        }
        verified?;

        self.set_refresh_mode_internal(0, delay);
        self.oracle.note_period_mode0();
        let mode = self.oracle.mode_for_rate(DEFAULT_REFRESH_RATE_HZ);
        self.set_refresh_mode_internal(mode, delay);

        self.mirror_valid = false;
        self.timeframestart = self.link.now_micros();
        self.slinit_anchor = 0;
        self.stats.reset();
        log::info!(
            "panel up: {:.1} Hz refresh (mode {})",
            self.oracle.refresh_rate(),
            self.refresh_mode
        );
        Ok(())
    }

    fn verify_readbacks(&mut self) -> Result<(), InitError> {
        let checks: [(Command, u8, ReadbackStage); 4] = [
            (Command::ReadPowerMode, EXPECT_POWER_MODE, ReadbackStage::PowerMode),
            (Command::ReadPixelFormat, EXPECT_PIXEL_FORMAT, ReadbackStage::PixelFormat),
            (Command::ReadImageFormat, EXPECT_IMAGE_FORMAT, ReadbackStage::ImageFormat),
            (Command::ReadSelfDiag, SELFDIAG_OK, ReadbackStage::SelfDiag),
        ];
        for (cmd, want, stage) in checks {
            let got = self
                .link
                .read_cmd8(cmd as u8, 0, READBACK_TIMEOUT_MS)
                .unwrap_or(0);
            if got != want {
                return Err(InitError::Readback { stage, got });
            }
        }
        Ok(())
    }

    /// Query the self-diagnostic register; `None` on a read timeout.
    /// [`SELFDIAG_OK`] means healthy.
    pub fn self_diag(&mut self) -> Option<u8> {
        self.wait_idle();
        self.link
            .read_cmd8(Command::ReadSelfDiag as u8, 0, READBACK_TIMEOUT_MS)
    }

    /// Read the panel's diagnostic registers (a timed-out read shows 0).
    pub fn read_status(&mut self) -> StatusReadback {
        self.wait_idle();
        let t = READBACK_TIMEOUT_MS;
        let rd = |link: &mut L, c: Command| link.read_cmd8(c as u8, 0, t).unwrap_or(0);
        StatusReadback {
            power_mode: rd(&mut self.link, Command::ReadPowerMode),
            madctl: rd(&mut self.link, Command::ReadMadctl),
            pixel_format: rd(&mut self.link, Command::ReadPixelFormat),
            image_format: rd(&mut self.link, Command::ReadImageFormat),
            self_diag: rd(&mut self.link, Command::ReadSelfDiag),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────

    /// SPI write clock in Hz. Resets the statistics.
    pub fn set_spi_clock(&mut self, clk_hz: u32) {
        self.wait_idle();
        self.spi_clock = clk_hz;
        self.stats.reset();
    }

    /// SPI read clock in Hz (scanline and register readbacks).
    pub fn set_spi_clock_read(&mut self, clk_hz: u32) {
        self.wait_idle();
        self.spi_clock_read = clk_hz;
        self.stats.reset();
    }

    /// Current SPI write clock.
    pub fn spi_clock(&self) -> u32 {
        self.spi_clock
    }

    /// Screen orientation, 0..=3 (values wrap). A change forces the next
    /// update to redraw fully and resets the statistics.
    pub fn set_rotation(&mut self, r: u8) {
        let rot = Rotation::from_index(r);
        if rot == self.rotation {
            return;
        }
        self.wait_idle();
        self.rotation = rot;
        self.mirror_valid = false;
        self.stats.reset();
    }

    /// Current orientation.
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Logical screen width under the current orientation.
    pub fn width(&self) -> u32 {
        self.rotation.width()
    }

    /// Logical screen height under the current orientation.
    pub fn height(&self) -> u32 {
        self.rotation.height()
    }

    /// Refresh mode 0 (fastest) ..= 31 (slowest); out-of-range is a
    /// no-op. Re-measures the refresh period, clears the mirror and
    /// resets the statistics.
    pub fn set_refresh_mode(&mut self, mode: u8, delay: &mut impl DelayNs) {
        if mode > MAX_REFRESH_MODE {
            log::warn!("refresh mode {mode} out of range, ignored");
            return;
        }
        self.wait_idle();
        self.mirror_valid = false;
        self.set_refresh_mode_internal(mode, delay);
    }

    fn set_refresh_mode_internal(&mut self, mode: u8, delay: &mut impl DelayNs) {
        self.refresh_mode = mode;
        let (diva, m) = if mode >= 16 { (1, mode - 16) } else { (0, mode) };
        self.link.begin_tx(self.spi_clock);
        self.link.write_cmd8(Command::FrameRateCtrl as u8);
        self.link.write_data8(diva);
        self.link.write_data8(0x10 + m);
        self.link.end_tx();
        delay.delay_us(50);
        self.oracle
            .sample(&mut self.link, delay, self.scanline_timeout_ms);
        self.stats.reset();
    }

    /// Pick the refresh mode closest to `hz`.
    pub fn set_refresh_rate(&mut self, hz: f64, delay: &mut impl DelayNs) {
        let mode = self.oracle.mode_for_rate(hz);
        self.set_refresh_mode(mode, delay);
    }

    /// Current refresh mode.
    pub fn refresh_mode(&self) -> u8 {
        self.refresh_mode
    }

    /// Measured refresh rate in Hz.
    pub fn refresh_rate(&self) -> f64 {
        self.oracle.refresh_rate()
    }

    /// Frame pacing: `-1` drops frames while busy, `0` uploads as fast
    /// as possible without dropping, `k ≥ 1` displays every k-th refresh.
    /// Out-of-range values clamp. Resets the statistics.
    pub fn set_vsync_spacing(&mut self, spacing: i8) {
        self.wait_idle();
        self.vsync_spacing = spacing.clamp(-1, MAX_VSYNC_SPACING);
        self.stats.reset();
    }

    /// Current vsync spacing.
    pub fn vsync_spacing(&self) -> i8 {
        self.vsync_spacing
    }

    /// Run-coalescing threshold in pixels (clamped to the screen size).
    /// Resets the statistics.
    pub fn set_diff_gap(&mut self, gap: u32) {
        self.wait_idle();
        self.diff_gap = gap.min(NB_PIXELS as u32);
        self.stats.reset();
    }

    /// Current diff gap.
    pub fn diff_gap(&self) -> u32 {
        self.diff_gap
    }

    /// Color bits that participate in the diff comparison; `0` (or
    /// `0xFFFF`) compares exactly.
    pub fn set_compare_mask(&mut self, mask: u16) {
        self.wait_idle();
        self.compare_mask = mask;
    }

    /// Tolerance for starting an upload after its refresh began:
    /// 0 waits for the phase anchor exactly, 1 starts almost anywhere.
    /// Clamped to [0, 1].
    pub fn set_late_start_ratio(&mut self, ratio: f32) {
        self.wait_idle();
        self.late_start_ratio = ratio.clamp(0.0, 1.0);
    }

    /// Force the next vsynced upload to re-lock on the phase anchor as if
    /// the ratio were 0; self-clears.
    pub fn request_late_start_resync(&mut self) {
        self.late_start_override = true;
    }

    /// Timeout for the scanline query in milliseconds; 0 disables it.
    pub fn set_scanline_timeout(&mut self, ms: u32) {
        self.scanline_timeout_ms = ms;
    }

    /// Force the next update to redraw the whole screen.
    pub fn force_full_redraw(&mut self) {
        self.wait_idle();
        self.mirror_valid = false;
    }

    // ── Panel controls ───────────────────────────────────────────────────

    /// Enter or leave sleep mode; the next update redraws fully.
    pub fn sleep(&mut self, enable: bool, delay: &mut impl DelayNs) {
        self.wait_idle();
        self.mirror_valid = false;
        self.link.begin_tx(self.spi_clock);
        if enable {
            self.link.write_cmd8(Command::DisplayOff as u8);
            self.link.write_cmd8(Command::SleepIn as u8);
            self.link.end_tx();
            delay.delay_ms(120);
        } else {
            self.link.write_cmd8(Command::DisplayOn as u8);
            self.link.write_cmd8(Command::SleepOut as u8);
            self.link.end_tx();
            delay.delay_ms(5);
        }
    }

    /// Invert the panel colors.
    pub fn invert_display(&mut self, invert: bool) {
        self.wait_idle();
        self.link.begin_tx(self.spi_clock);
        self.link.write_cmd8(if invert {
            Command::InvertOn as u8
        } else {
            Command::InvertOff as u8
        });
        self.link.end_tx();
    }

    /// Vertical scroll start address. Any offset is accepted and reduced
    /// into `[0, 320)`; the next update redraws fully.
    pub fn set_scroll(&mut self, offset: i32) {
        self.wait_idle();
        self.mirror_valid = false;
        let line = offset.rem_euclid(TFT_HEIGHT as i32) as u16;
        self.link.begin_tx(self.spi_clock);
        self.link.write_cmd8(Command::VScrollStart as u8);
        self.link.write_data16(line);
        self.link.end_tx();
    }

    // ── Buffer binding ───────────────────────────────────────────────────

    /// Bind zero, one or two internal framebuffers (each 240·320 words).
    /// They belong to the driver until taken back; a short slice is
    /// ignored. Clears the mirror.
    pub fn set_framebuffers(
        &mut self,
        fb1: Option<&'b mut [u16]>,
        fb2: Option<&'b mut [u16]>,
    ) {
        self.wait_idle();
        self.mirror_valid = false;
        self.fb2_full = false;
        self.pending_launch = None;
        let check = |fb: Option<&'b mut [u16]>| -> Option<&'b mut [u16]> {
            match fb {
                Some(s) if s.len() >= NB_PIXELS => Some(s),
                Some(_) => {
                    log::warn!("framebuffer shorter than {NB_PIXELS} words ignored");
                    None
                }
                None => None,
            }
        };
        let a = check(fb1);
        let b = check(fb2);
        if a.is_some() {
            self.fb1 = a;
            self.fb2 = b;
        } else {
            self.fb1 = b;
            self.fb2 = a;
        }
        self.stats.reset();
    }

    /// Take the bound framebuffers back.
    pub fn take_framebuffers(&mut self) -> (Option<&'b mut [u16]>, Option<&'b mut [u16]>) {
        self.wait_idle();
        self.mirror_valid = false;
        self.fb2_full = false;
        self.pending_launch = None;
        (self.fb1.take(), self.fb2.take())
    }

    /// Bind zero, one or two diff arenas.
    pub fn set_diff_buffers(
        &mut self,
        diff1: Option<DiffBuffer<'b>>,
        diff2: Option<DiffBuffer<'b>>,
    ) {
        self.wait_idle();
        self.pending_launch = None;
        if diff1.is_some() {
            self.diff1 = diff1;
            self.diff2 = diff2;
        } else {
            self.diff1 = diff2;
            self.diff2 = diff1;
        }
    }

    /// Take the bound diff arenas back.
    pub fn take_diff_buffers(&mut self) -> (Option<DiffBuffer<'b>>, Option<DiffBuffer<'b>>) {
        self.wait_idle();
        self.pending_launch = None;
        (self.diff1.take(), self.diff2.take())
    }

    /// The mode updates currently run in, derived from the bindings.
    pub fn buffering_mode(&self) -> BufferingMode {
        if self.fb1.is_none() || self.diff1.is_none() {
            return BufferingMode::None;
        }
        if self.diff2.is_none() {
            return BufferingMode::DoubleOneDiff;
        }
        if self.fb2.is_none() {
            return BufferingMode::DoubleTwoDiff;
        }
        BufferingMode::Triple
    }

    // ── Updates ──────────────────────────────────────────────────────────

    /// Push a frame to the screen. Returns false when the frame was
    /// dropped (`vsync_spacing == -1` with an upload in flight) or the
    /// slice is short.
    ///
    /// `fb` is laid out for the current rotation. In the buffered modes
    /// the call returns as soon as the upload is scheduled and `fb` may
    /// be reused immediately; unbuffered updates block to completion.
    ///
    /// # Concurrency
    ///
    /// Must not be preempted by [`Self::on_dma_complete`] or
    /// [`Self::on_timer`]; see the exclusion contract on those entry
    /// points. The stage-or-launch decisions inside are additionally
    /// bracketed with `DisplayLink::mask_irqs` so their flag updates
    /// commit atomically against the completion interrupt.
    pub fn update(&mut self, fb: &[u16]) -> bool {
        self.update_with(fb, false)
    }

    /// Like [`Self::update`] with an explicit full-redraw request.
    ///
    /// # Concurrency
    ///
    /// Same exclusion contract as [`Self::update`].
    pub fn update_with(&mut self, fb: &[u16], force_full: bool) -> bool {
        if fb.len() < NB_PIXELS {
            log::warn!("update with a short framebuffer ignored");
            return false;
        }
        match self.buffering_mode() {
            BufferingMode::None => self.update_unbuffered(fb),
            BufferingMode::DoubleOneDiff => self.update_double_one(fb, force_full),
            BufferingMode::DoubleTwoDiff => self.update_double_two(fb, force_full),
            BufferingMode::Triple => self.update_triple(fb, force_full),
        }
    }

    /// Synchronous full-screen upload straight from the user buffer.
    fn update_unbuffered(&mut self, fb: &[u16]) -> bool {
        self.wait_idle();
        self.mirror_valid = false;
        self.dummy1.init_read();
        self.start_upload(fb.as_ptr(), self.rotation, ActiveDiff::Dummy);
        self.wait_idle();
        true
    }

    fn update_double_one(&mut self, fb: &[u16], force_full: bool) -> bool {
        if self.vsync_spacing == -1 && self.is_busy() {
            return false; // drop the frame
        }
        self.wait_idle();
        let slot = self.prepare_front(fb, force_full);
        self.launch_front(slot);
        true
    }

    fn update_double_two(&mut self, fb: &[u16], force_full: bool) -> bool {
        if self.vsync_spacing == -1 && self.is_busy() {
            return false;
        }
        if !self.mirror_valid || force_full {
            self.wait_idle();
            let slot = self.prepare_front(fb, true);
            self.launch_front(slot);
            return true;
        }
        if self.is_busy() {
            // overlap: next diff into the back arena while the DMA runs
            let rot = self.rotation;
            let (gap, mask) = (self.diff_gap, self.compare_mask);
            let t0 = self.link.now_micros();
            if let (Some(fb1), Some(d2)) = (self.fb1.as_deref(), self.diff2.as_mut()) {
                d2.compute(fb1, fb, rot, gap, mask);
            }
            let dt = self.link.now_micros().wrapping_sub(t0);
            if let Some(d2) = self.diff2.as_mut() {
                d2.note_compute_micros(dt);
            }
            self.wait_idle();
            if let Some(fb1) = self.fb1.as_deref_mut() {
                copy_rotated(fb1, fb, rot);
            }
            core::mem::swap(&mut self.diff1, &mut self.diff2);
            self.launch_front(ActiveDiff::Real);
        } else {
            let slot = self.prepare_front(fb, false);
            self.launch_front(slot);
        }
        true
    }

    fn update_triple(&mut self, fb: &[u16], force_full: bool) -> bool {
        if !self.is_busy() {
            let slot = self.prepare_front(fb, force_full);
            self.launch_front(slot);
            return true;
        }
        if self.vsync_spacing != -1 {
            // wait for the staging buffer; with -1 a parked frame is
            // simply replaced
            while self.fb2_full {
                self.pump_one();
            }
        }
        // First atomic check: withdraw any parked launch so the finish
        // path cannot swap fb2/diff2 in while they are being rewritten.
        self.link.mask_irqs();
        if !self.is_busy() {
            self.link.unmask_irqs();
            let slot = self.prepare_front(fb, force_full);
            self.launch_front(slot);
            return true;
        }
        self.pending_launch = None;
        self.fb2_full = false;
        self.link.unmask_irqs();

        // stage into the back pair while the upload runs
        let rot = self.rotation;
        let (gap, mask) = (self.diff_gap, self.compare_mask);
        let kind = if self.mirror_valid && !force_full {
            let t0 = self.link.now_micros();
            if let (Some(fb1), Some(d2)) = (self.fb1.as_deref(), self.diff2.as_mut()) {
                d2.compute(fb1, fb, rot, gap, mask);
            }
            let dt = self.link.now_micros().wrapping_sub(t0);
            if let Some(d2) = self.diff2.as_mut() {
                d2.note_compute_micros(dt);
            }
            ActiveDiff::Real
        } else {
            self.dummy2.init_read();
            ActiveDiff::Dummy
        };
        if let Some(fb2) = self.fb2.as_deref_mut() {
            copy_rotated(fb2, fb, rot);
        }

        // Second atomic check: the upload may have drained during the
        // staging work, and then nothing would ever consume the parked
        // frame.
        self.link.mask_irqs();
        if self.is_busy() {
            // still in flight: park; the completion boundary swaps and
            // launches
            self.pending_launch = Some(kind);
            self.fb2_full = true;
            self.link.unmask_irqs();
            return true;
        }
        self.link.unmask_irqs();
        // completed in between: swap the staged pair in and launch now
        self.pending_launch = Some(kind);
        self.run_pending_launch();
        true
    }

    /// Fill fb1 for the next launch: a riding-copy diff, or a rotating
    /// copy plus the dummy stream when a full redraw is due. Returns the
    /// slot to stream from.
    fn prepare_front(&mut self, fb: &[u16], force_full: bool) -> ActiveDiff {
        let rot = self.rotation;
        let full = force_full || !self.mirror_valid;
        if full {
            if let Some(fb1) = self.fb1.as_deref_mut() {
                copy_rotated(fb1, fb, rot);
            }
            self.dummy1.init_read();
            ActiveDiff::Dummy
        } else {
            let (gap, mask) = (self.diff_gap, self.compare_mask);
            let t0 = self.link.now_micros();
            if let (Some(fb1), Some(d1)) = (self.fb1.as_deref_mut(), self.diff1.as_mut()) {
                d1.compute_with_copy(fb1, fb, rot, gap, mask);
            }
            let dt = self.link.now_micros().wrapping_sub(t0);
            if let Some(d1) = self.diff1.as_mut() {
                d1.note_compute_micros(dt);
            }
            ActiveDiff::Real
        }
    }

    /// Launch an upload from fb1 and mark it as the mirror.
    fn launch_front(&mut self, slot: ActiveDiff) {
        let Some(src) = self.fb1.as_deref().map(<[u16]>::as_ptr) else {
            return;
        };
        self.mirror_valid = true;
        self.start_upload(src, Rotation::Portrait, slot);
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// Refresh periods between the last two vsynced frames.
    pub fn last_vsync_spacing(&self) -> u32 {
        self.last_delta
    }

    /// True when the last vsynced frame's margin went negative.
    pub fn teared_last_frame(&self) -> bool {
        self.last_margin < 0
    }

    /// Scanline margin of the last frame.
    pub fn last_margin(&self) -> i32 {
        self.last_margin
    }

    /// True while fb1 is known to equal the panel content.
    pub fn mirror_valid(&self) -> bool {
        self.mirror_valid
    }

    /// Frame statistics.
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Reset the frame statistics.
    pub fn stats_reset(&mut self) {
        self.stats.reset();
    }

    /// Diff-producer statistics of the bound arenas.
    pub fn diff_stats(&self) -> (Option<&crate::stats::Sample>, Option<&crate::stats::Sample>) {
        (
            self.diff1.as_ref().map(DiffBuffer::size_stats),
            self.diff2.as_ref().map(DiffBuffer::size_stats),
        )
    }

    // ── Touch ────────────────────────────────────────────────────────────

    /// Route the touch controller's pen interrupt here.
    pub fn on_touch_irq(&mut self) {
        let now_ms = self.link.now_micros() / 1_000;
        self.touch.note_irq(now_ms);
    }

    /// Milliseconds since the last touch interrupt, or `None` when no
    /// touch happened since the previous call. Never uses the bus.
    pub fn last_touched(&mut self) -> Option<u32> {
        let now_ms = self.link.now_micros() / 1_000;
        self.touch.take_last_touched(now_ms)
    }

    /// Read the touch position and pressure, mapped to the current
    /// orientation (and to screen coordinates once a range is set).
    ///
    /// Defers the bus access to the end of an in-flight upload.
    pub fn read_touch(&mut self) -> (i32, i32, i32) {
        if self.is_busy() {
            self.touch.request_read();
            self.wait_idle(); // the finish path performs the read
        } else {
            self.touch_acquire();
        }
        self.touch.point(self.rotation)
    }

    /// Map raw touch coordinates onto `[0, width) × [0, height)`;
    /// call with zeros to return to raw values.
    pub fn set_touch_range(&mut self, min_x: i32, max_x: i32, min_y: i32, max_y: i32) {
        self.touch.set_range(min_x, max_x, min_y, max_y);
    }

    /// Sample the touch controller if it is due. The bus must be idle.
    pub(crate) fn touch_acquire(&mut self) {
        let now_ms = self.link.now_micros() / 1_000;
        if !self.touch.due(now_ms) {
            return;
        }
        if let Some(sample) = self.link.read_touch() {
            self.touch.process(sample, now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_error_display_names_the_stage() {
        let e = InitError::Readback {
            stage: ReadbackStage::PixelFormat,
            got: 0x66,
        };
        assert_eq!(
            format!("{e}"),
            "panel init failed: pixel format readback 0x66"
        );
    }

    #[test]
    fn status_readback_display_flags_bad_diagnostics() {
        let ok = StatusReadback {
            self_diag: SELFDIAG_OK,
            ..Default::default()
        };
        assert!(format!("{ok}").contains("[OK]"));
        let bad = StatusReadback::default();
        assert!(format!("{bad}").contains("[ERROR]"));
    }
}
