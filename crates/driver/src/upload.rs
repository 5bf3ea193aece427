//! The vsync-aligned upload engine.
//!
//! A frame upload is a small state machine racing the panel's refresh
//! scan:
//!
//! ```text
//! Idle → Armed → WaitScan → DmaRun → WaitGap → (DmaRun | WaitGap)* → Finish → Idle
//! ```
//!
//! * `Armed` — a one-shot timer is set for the start of the refresh cycle
//!   the frame is due on (`timeframestart + (vsync_spacing−1)·P`).
//! * `WaitScan` — on fire, the engine waits for the scan to pass its phase
//!   anchor (scanline 0 after a resync), bounded by the late-start
//!   tolerance, then locks the race: captures `slinitpos`, restarts the
//!   elapsed counter and stamps `timeframestart` for the next frame.
//! * `DmaRun` — a write-run is armed as a TX-DMA chain. Its completion
//!   interrupt updates the scanline margin and asks the diff stream for
//!   the next run.
//! * `WaitGap` — the stream reported the next run too close behind the
//!   scan; a one-shot wait re-enters the consumer.
//! * `Finish` — FIFO drain, trailing NOP, transaction end, statistics,
//!   deferred touch read, and the staged relaunch if triple buffering
//!   parked one.
//!
//! The application routes its interrupt handlers here: the SPI TX DMA
//! completion ISR calls [`Ili9341Driver::on_dma_complete`] and the timer
//! ISR calls [`Ili9341Driver::on_timer`]. Which logical step a timer fire
//! means is tracked in a typed [`TimerAction`], never in a swapped
//! function pointer. Synchronous paths pump the same events through
//! `DisplayLink::wait_event`.
//!
//! # Concurrency contract
//!
//! The entry points take `&mut self`, so they must never run while
//! another method of the driver is executing: an application that routes
//! the real ISRs into them directly has to mask those two interrupts (or
//! hold the events pending) for as long as the CPU is inside any driver
//! call, and deliver the backlog afterwards. Where the coordinator
//! cannot rely on that alone — the stage-or-launch decisions of triple
//! buffering, whose outcome races the completion interrupt — it brackets
//! the few flag writes itself with `DisplayLink::mask_irqs` /
//! `unmask_irqs`, mirroring the interrupts-off regions the hardware
//! design calls for.

use platform::{DisplayLink, LinkEvent, TxChain, TxSeg};

use crate::cmd::Command;
use crate::diff::{DiffRead, UNPACED};
use crate::ili9341::Ili9341Driver;
use crate::rotation::Rotation;
use crate::timing::NB_SCANLINES;
use crate::{NB_PIXELS, TFT_WIDTH};

/// Longest single wait the engine will program.
pub(crate) const MAX_DELAY_US: u32 = 1_000_000;

/// Floor for gap waits, absorbing timer granularity.
const MIN_GAP_WAIT_US: u32 = 10;

/// DMA channel occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DmaState {
    Idle,
    Active,
}

/// What the next timer fire means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    None,
    /// The refresh cycle this frame is due on begins: enter `WaitScan`.
    FrameStart,
    /// A gap wait elapsed: re-enter the diff consumer.
    GapWait,
}

/// Which diff source the engine consumes (launches always stream from the
/// front slot; staged back slots are swapped in first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveDiff {
    Real,
    Dummy,
}

/// State of the upload in flight.
pub(crate) struct ActiveUpload {
    pub src: *const u16,
    pub src_rotation: Rotation,
    pub slot: ActiveDiff,
    pub vsynced: bool,
    /// First run, read at schedule time and armed at race start.
    pub pending_run: Option<(u32, u32, u32)>,
    /// Column/page address window origin currently programmed.
    pub window_x: u32,
    pub window_y: u32,
    /// Scanline at race start.
    pub slinitpos: u32,
    /// `now_micros` at race start.
    pub race_epoch: u32,
    /// Running minimum of scanlines-ahead-of-scan; negative means a tear.
    pub margin: i32,
    /// Last row touched by the most recent run.
    pub last_y: u32,
}

impl<'b, L: DisplayLink> Ili9341Driver<'b, L> {
    // ── ISR entry points ─────────────────────────────────────────────────

    /// Route the SPI TX DMA channel's completion interrupt here.
    ///
    /// # Concurrency
    ///
    /// Must not preempt any other method of this driver. The application
    /// guarantees this by masking (or deferring) the DMA-completion and
    /// timer interrupts while it is inside a driver call and delivering
    /// the pending events afterwards; see the module-level contract.
    pub fn on_dma_complete(&mut self) {
        if self.dma_state != DmaState::Active || self.active.is_none() {
            return;
        }
        let now = self.link.now_micros();
        self.stats.resume(now);

        let snapshot = self
            .active
            .as_ref()
            .map(|a| (a.vsynced, a.race_epoch, a.last_y, a.slinitpos, a.margin));
        if let Some((true, epoch, last_y, slinit, margin)) = snapshot {
            let scanned = self.oracle.scanlines_during(now.wrapping_sub(epoch));
            let m = (i64::from(last_y) + i64::from(NB_SCANLINES)
                - i64::from(slinit)
                - i64::from(scanned)) as i32;
            if m < margin {
                if let Some(a) = self.active.as_mut() {
                    a.margin = m;
                }
            }
        }
        self.advance_consumer();
    }

    /// Route the one-shot timer interrupt here.
    ///
    /// # Concurrency
    ///
    /// Same exclusion contract as [`Self::on_dma_complete`].
    pub fn on_timer(&mut self) {
        match core::mem::replace(&mut self.timer_action, TimerAction::None) {
            TimerAction::FrameStart => self.wait_scan(),
            TimerAction::GapWait => {
                let now = self.link.now_micros();
                self.stats.resume(now);
                self.advance_consumer();
            }
            TimerAction::None => {}
        }
    }

    /// Dispatch any due events without blocking.
    pub fn poll(&mut self) {
        while let Some(ev) = self.link.poll_event() {
            self.dispatch(ev);
        }
    }

    /// True while an upload is in flight.
    pub fn is_busy(&self) -> bool {
        self.dma_state == DmaState::Active
    }

    /// Block (pumping link events) until the in-flight upload, if any,
    /// has fully completed.
    pub fn wait_idle(&mut self) {
        while self.dma_state == DmaState::Active {
            self.pump_one();
        }
    }

    fn dispatch(&mut self, ev: LinkEvent) {
        match ev {
            LinkEvent::DmaComplete => self.on_dma_complete(),
            LinkEvent::Timer => self.on_timer(),
        }
    }

    pub(crate) fn pump_one(&mut self) {
        let ev = self.link.wait_event();
        self.dispatch(ev);
    }

    /// Busy-wait without arming the timer (sub-timer-granularity waits in
    /// the scan race).
    fn spin_micros(&mut self, us: u32) {
        let us = us.min(MAX_DELAY_US);
        let t0 = self.link.now_micros();
        while self.link.now_micros().wrapping_sub(t0) < us {}
    }

    // ── Launch ───────────────────────────────────────────────────────────

    /// Begin streaming one frame. `src` must stay valid and unmodified
    /// until the engine returns to idle; the coordinator guarantees it.
    pub(crate) fn start_upload(&mut self, src: *const u16, src_rotation: Rotation, slot: ActiveDiff) {
        debug_assert_eq!(self.dma_state, DmaState::Idle);
        let vsynced = self.vsync_spacing > 0;
        let now = self.link.now_micros();
        self.stats.start_frame(now, vsynced);
        self.link.flush_cache(src.cast(), NB_PIXELS * 2);

        self.diff_init_read(slot);
        let first = self.diff_read(slot, UNPACED);
        let DiffRead::Run { x, y, len } = first else {
            self.finish_empty(vsynced);
            return;
        };

        self.dma_state = DmaState::Active;
        self.active = Some(ActiveUpload {
            src,
            src_rotation,
            slot,
            vsynced,
            pending_run: Some((x, y, len)),
            window_x: x,
            window_y: y,
            slinitpos: 0,
            race_epoch: now,
            margin: NB_SCANLINES as i32,
            last_y: y,
        });

        if vsynced {
            let p = self.oracle.period().max(1);
            let spacing = self.vsync_spacing as u32;
            self.timer_action = TimerAction::FrameStart;
            self.link
                .one_shot_at(self.timeframestart.wrapping_add((spacing - 1).wrapping_mul(p)));
            let now = self.link.now_micros();
            self.stats.pause(now);
        } else {
            self.begin_run_stream();
        }
    }

    /// An empty diff still advances the frame clock so the next frame
    /// keeps its cadence, and still releases a staged relaunch.
    fn finish_empty(&mut self, vsynced: bool) {
        if vsynced {
            let p = self.oracle.period().max(1);
            let reach0 =
                self.oracle
                    .micros_to_reach(&mut self.link, 0, true, self.scanline_timeout_ms);
            let t1 = self.link.now_micros().wrapping_add(reach0);
            let t2 = self
                .timeframestart
                .wrapping_add((self.vsync_spacing as u32).wrapping_mul(p));
            let tfs = if (t1.wrapping_sub(t2) as i32) >= 0 { t1 } else { t2 };
            self.last_delta = tfs.wrapping_sub(self.timeframestart).wrapping_add(p / 2) / p;
            self.timeframestart = tfs;
            let now = self.link.now_micros();
            self.stats.end_frame(now, NB_SCANLINES as i32, self.last_delta, false);
        } else {
            let now = self.link.now_micros();
            self.stats.end_frame(now, 0, 0, false);
        }
        self.run_pending_launch();
    }

    // ── WaitScan ─────────────────────────────────────────────────────────

    /// The frame's refresh cycle began: wait for the scan to pass the
    /// phase anchor (bounded by the late-start tolerance), lock the race
    /// and start streaming.
    fn wait_scan(&mut self) {
        let now = self.link.now_micros();
        self.stats.resume(now);
        let t = self.scanline_timeout_ms;

        let anchor = self.slinit_anchor;
        let ratio = if self.late_start_override {
            self.late_start_override = false;
            0.0
        } else {
            self.late_start_ratio
        };
        let span = (NB_SCANLINES - 1).saturating_sub(anchor) as f32;
        let sc_limit = anchor + (span * ratio) as u32;

        let dd1 = self.oracle.micros_to_reach(&mut self.link, anchor, false, t);
        let dd2 = self.oracle.micros_to_reach(&mut self.link, sc_limit, true, t);
        self.spin_micros(dd1.min(dd2));
        loop {
            let w = self.oracle.micros_to_exit(&mut self.link, 0, anchor);
            if w == 0 {
                break;
            }
            self.spin_micros(w);
        }

        // lock the race to wherever the scan actually is
        self.oracle.scanline(&mut self.link, true, t);
        let slinit = self.oracle.scanline(&mut self.link, false, 0);
        self.slinit_anchor = slinit;

        let reach0 = self.oracle.micros_to_reach(&mut self.link, 0, false, 0);
        let now = self.link.now_micros();
        let tfs = now.wrapping_add(reach0);
        let p = self.oracle.period().max(1);
        self.last_delta = tfs.wrapping_sub(self.timeframestart).wrapping_add(p / 2) / p;
        self.timeframestart = tfs;

        if let Some(a) = self.active.as_mut() {
            a.slinitpos = slinit;
            a.race_epoch = now;
        }
        self.begin_run_stream();
    }

    // ── DmaRun ───────────────────────────────────────────────────────────

    /// Open the transaction, program the first full address windows and
    /// arm the first run. Bails out without pixel writes when the pending
    /// run is implausible.
    fn begin_run_stream(&mut self) {
        let Some((x, y, len, wx, wy)) = self
            .active
            .as_ref()
            .and_then(|a| a.pending_run.map(|(x, y, l)| (x, y, l, a.window_x, a.window_y)))
        else {
            self.abort_frame();
            return;
        };
        let end = y as usize * TFT_WIDTH + x as usize + len as usize;
        if len == 0 || x >= TFT_WIDTH as u32 || y >= NB_SCANLINES || end > NB_PIXELS || (x, y) != (wx, wy)
        {
            log::warn!("frame aborted: implausible first run ({x},{y}) len {len}");
            self.abort_frame();
            return;
        }
        self.link.begin_tx(self.spi_clock);
        self.write_window(x, y, true);
        self.arm_run(x, y, len);
    }

    /// Program address windows for a run; only deltas after the first.
    /// `RAMWR` resets the panel's write pointer to the window origin, so
    /// an unchanged coordinate can skip its window write entirely.
    fn write_window(&mut self, x: u32, y: u32, force_both: bool) {
        let (wx, wy) = self
            .active
            .as_ref()
            .map(|a| (a.window_x, a.window_y))
            .unwrap_or((u32::MAX, u32::MAX));
        if force_both || x != wx {
            self.link.write_cmd8(Command::ColumnAddrSet as u8);
            self.link.write_data16(x as u16);
            self.link.write_data16((TFT_WIDTH - 1) as u16);
        }
        if force_both || y != wy {
            self.link.write_cmd8(Command::PageAddrSet as u8);
            self.link.write_data16(y as u16);
            self.link.write_data16((NB_SCANLINES - 1) as u16);
        }
        self.link.write_cmd8(Command::RamWrite as u8);
        self.stats.add_transaction();
        if let Some(a) = self.active.as_mut() {
            a.window_x = x;
            a.window_y = y;
        }
    }

    /// Build and arm the DMA chain for one run.
    fn arm_run(&mut self, x: u32, y: u32, len: u32) {
        let Some(a) = self.active.as_mut() else {
            return;
        };
        let chain = build_chain(a.src, a.src_rotation, x, y, len);
        a.last_y = (y * TFT_WIDTH as u32 + x + len - 1) / TFT_WIDTH as u32;
        a.pending_run = None;
        // SAFETY: the source framebuffer is frozen while the upload is in
        // flight (coordinator invariant) and outlives the transfer.
        unsafe { self.link.arm_tx_dma(&chain) };
        self.stats.add_pixels(len);
        let now = self.link.now_micros();
        self.stats.pause(now);
    }

    /// Ask the diff stream what comes next and act on it.
    fn advance_consumer(&mut self) {
        let Some((vsynced, slot, epoch, slinit)) = self
            .active
            .as_ref()
            .map(|a| (a.vsynced, a.slot, a.race_epoch, a.slinitpos))
        else {
            return;
        };
        let instant = if vsynced {
            let now = self.link.now_micros();
            slinit + self.oracle.scanlines_during(now.wrapping_sub(epoch))
        } else {
            UNPACED
        };
        match self.diff_read(slot, instant) {
            DiffRead::End => self.finish_frame(),
            DiffRead::Wait { scanline } => {
                let lines = scanline.saturating_sub(instant) + 1;
                let delay = self.oracle.time_for_scanlines(lines).max(MIN_GAP_WAIT_US);
                self.timer_action = TimerAction::GapWait;
                self.link.one_shot_in(delay.min(MAX_DELAY_US));
                let now = self.link.now_micros();
                self.stats.pause(now);
            }
            DiffRead::Run { x, y, len } => {
                self.write_window(x, y, false);
                self.arm_run(x, y, len);
            }
        }
    }

    // ── Finish ───────────────────────────────────────────────────────────

    fn finish_frame(&mut self) {
        self.link.finish_tx_dma();
        self.link.write_cmd8(Command::Nop as u8);
        self.link.end_tx();
        let Some(a) = self.active.take() else {
            self.dma_state = DmaState::Idle;
            return;
        };
        let teared = a.vsynced && a.margin < 0;
        self.last_margin = a.margin;
        let now = self.link.now_micros();
        self.stats.end_frame(now, a.margin, self.last_delta, teared);
        self.link.flush_cache(a.src.cast(), NB_PIXELS * 2);
        self.dma_state = DmaState::Idle;
        if self.touch.take_read_pending() {
            self.touch_acquire();
        }
        self.run_pending_launch();
    }

    /// Implausible stream state: end the frame without pixel writes. The
    /// mirror is left as-is — stale only if it already was.
    fn abort_frame(&mut self) {
        let (margin, vsynced) = self
            .active
            .take()
            .map(|a| (a.margin, a.vsynced))
            .unwrap_or((0, false));
        let now = self.link.now_micros();
        self.stats.end_frame(now, margin, self.last_delta, vsynced && margin < 0);
        self.dma_state = DmaState::Idle;
        self.run_pending_launch();
    }

    /// The completion boundary of triple buffering: swap the staged pair
    /// in and launch from the front buffer. Also invoked directly by the
    /// coordinator when its second atomic check finds the upload already
    /// drained.
    pub(crate) fn run_pending_launch(&mut self) {
        let Some(kind) = self.pending_launch.take() else {
            return;
        };
        match kind {
            ActiveDiff::Real => core::mem::swap(&mut self.diff1, &mut self.diff2),
            ActiveDiff::Dummy => core::mem::swap(&mut self.dummy1, &mut self.dummy2),
        }
        core::mem::swap(&mut self.fb1, &mut self.fb2);
        self.fb2_full = false;
        self.mirror_valid = true;
        let Some(src) = self.fb1.as_deref().map(<[u16]>::as_ptr) else {
            return;
        };
        self.start_upload(src, Rotation::Portrait, kind);
    }

    // ── Diff slot access ─────────────────────────────────────────────────

    fn diff_init_read(&mut self, slot: ActiveDiff) {
        match slot {
            ActiveDiff::Real => {
                if let Some(d) = self.diff1.as_mut() {
                    d.init_read();
                }
            }
            ActiveDiff::Dummy => self.dummy1.init_read(),
        }
    }

    fn diff_read(&mut self, slot: ActiveDiff, instant_scanline: u32) -> DiffRead {
        match slot {
            ActiveDiff::Real => self
                .diff1
                .as_mut()
                .map_or(DiffRead::End, |d| d.read(instant_scanline)),
            ActiveDiff::Dummy => self.dummy1.read(instant_scanline),
        }
    }
}

/// Map one canonical write-run onto the source traversal (the pixel
/// pusher). Contiguous rotations yield a single segment; landscape
/// rotations one strided segment per touched canonical row.
fn build_chain(src: *const u16, rot: Rotation, x: u32, y: u32, len: u32) -> TxChain {
    let mut chain = TxChain::new();
    let start = (y * TFT_WIDTH as u32 + x) as usize;
    if rot.is_contiguous() {
        let seg = TxSeg {
            base: src.wrapping_add(rot.src_index(start)),
            words: len,
            step: rot.src_step(),
        };
        let _ = chain.push(seg);
        return chain;
    }
    let mut n = start;
    let mut remaining = len as usize;
    while remaining > 0 {
        let row_rem = TFT_WIDTH - (n % TFT_WIDTH);
        let seg_len = remaining.min(row_rem);
        let seg = TxSeg {
            base: src.wrapping_add(rot.src_index(n)),
            words: seg_len as u32,
            step: rot.src_step(),
        };
        if chain.push(seg).is_err() {
            debug_assert!(false, "run exceeded the chain capacity");
            break;
        }
        n += seg_len;
        remaining -= seg_len;
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_chain_is_one_segment() {
        let fb = vec![0u16; NB_PIXELS];
        let c = build_chain(fb.as_ptr(), Rotation::Portrait, 0, 10, 2400);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].words, 2400);
        assert_eq!(c[0].step, 1);
        assert_eq!(c[0].base as usize, fb.as_ptr() as usize + 10 * 240 * 2);
    }

    #[test]
    fn flipped_chain_reads_backwards() {
        let fb = vec![0u16; NB_PIXELS];
        let c = build_chain(fb.as_ptr(), Rotation::PortraitFlipped, 239, 319, 1);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].step, -1);
        // last canonical pixel reads the first source word
        assert_eq!(c[0].base as usize, fb.as_ptr() as usize);
    }

    #[test]
    fn landscape_chain_splits_per_row_with_stride() {
        let fb = vec![0u16; NB_PIXELS];
        // 3 whole rows from a row start
        let c = build_chain(fb.as_ptr(), Rotation::Landscape, 0, 100, 3 * 240);
        assert_eq!(c.len(), 3);
        for seg in c.iter() {
            assert_eq!(seg.words, 240);
            assert_eq!(seg.step, -320);
        }
    }

    #[test]
    fn mid_row_landscape_run_is_a_single_segment() {
        let fb = vec![0u16; NB_PIXELS];
        let c = build_chain(fb.as_ptr(), Rotation::LandscapeFlipped, 100, 7, 50);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].words, 50);
        assert_eq!(c[0].step, 320);
    }
}
