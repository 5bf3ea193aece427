//! Mock implementations for testing.
//!
//! [`MockLink`] is a behavioral simulation of an ILI9341 panel behind a
//! [`DisplayLink`]: it decodes the command stream (address windows, RAM
//! writes, scroll, mode registers), keeps a 240×320 RGB565 RAM image,
//! models the refresh scan against a virtual microsecond clock, and
//! schedules DMA-completion and timer events in virtual time.
//!
//! Time advances three ways: a small fixed cost per SPI/clock operation
//! (so busy-wait loops make progress), explicitly via [`MockDelay`], and
//! by [`DisplayLink::wait_event`], which jumps to the next scheduled
//! event. All state sits behind a shared handle, so tests keep a clone of
//! the link for inspection after handing it to a driver.

#![cfg(any(test, feature = "std"))]
// Mock infrastructure: failing loudly beats failing quietly in tests.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use crate::link::{DisplayLink, LinkEvent, TouchSample, TxChain};

/// Panel width in the canonical orientation.
pub const PANEL_WIDTH: usize = 240;
/// Panel height in the canonical orientation.
pub const PANEL_HEIGHT: usize = 320;
/// Total pixel count.
pub const PANEL_PIXELS: usize = PANEL_WIDTH * PANEL_HEIGHT;

const CMD_CASET: u8 = 0x2A;
const CMD_PASET: u8 = 0x2B;
const CMD_RAMWR: u8 = 0x2C;
const CMD_VSCRSADD: u8 = 0x37;
const CMD_MADCTL: u8 = 0x36;
const CMD_FRMCTR1: u8 = 0xB1;

const RD_MODE: u8 = 0x0A;
const RD_MADCTL: u8 = 0x0B;
const RD_PIXFMT: u8 = 0x0C;
const RD_IMGFMT: u8 = 0x0D;
const RD_SELFDIAG: u8 = 0x0F;

/// Virtual-time cost of one FIFO write or clock query, in microseconds.
const OP_COST_US: u64 = 1;
/// Virtual-time cost of a scanline or register readback.
const READ_COST_US: u64 = 5;

#[derive(Clone, Copy)]
struct RawSeg {
    base: *const u16,
    words: u32,
    step: i32,
}

struct DmaJob {
    segs: Vec<RawSeg>,
    done_at: u64,
}

struct PanelSim {
    now: u64,
    refresh_period_us: u64,

    ram: Vec<u16>,
    x0: u16,
    x1: u16,
    y0: u16,
    y1: u16,
    col: u16,
    row: u16,
    writing: bool,

    pending_cmd: Option<u8>,
    params8: Vec<u8>,
    params16: Vec<u16>,

    madctl: u8,
    frmctr1: (u8, u8),
    scroll: u16,

    power_mode: u8,
    pixel_format: u8,
    image_format: u8,
    self_diag: u8,
    /// Remaining self-diag reads that report a bad value (retry tests).
    fail_self_diag_reads: u32,
    /// Remaining scanline reads that time out and report raw 0.
    fail_scanline_reads: u32,

    in_tx: bool,
    tx_clk_hz: u32,

    dma: Option<DmaJob>,
    timer_at: Option<u64>,

    touch: Option<TouchSample>,

    tx_begin_count: u32,
    ramwr_count: u32,
    pixel_words: u64,
    reset_count: u32,
    flush_count: u32,
    irq_mask_depth: u32,
    irq_mask_count: u32,
}

impl PanelSim {
    fn new() -> Self {
        Self {
            now: 0,
            refresh_period_us: 10_000,
            ram: vec![0u16; PANEL_PIXELS],
            x0: 0,
            x1: (PANEL_WIDTH - 1) as u16,
            y0: 0,
            y1: (PANEL_HEIGHT - 1) as u16,
            col: 0,
            row: 0,
            writing: false,
            pending_cmd: None,
            params8: Vec::new(),
            params16: Vec::new(),
            madctl: 0x48,
            frmctr1: (0, 0x10),
            scroll: 0,
            power_mode: 0x9C,
            pixel_format: 0x05,
            image_format: 0x00,
            self_diag: 0xC0,
            fail_self_diag_reads: 0,
            fail_scanline_reads: 0,
            in_tx: false,
            tx_clk_hz: 0,
            dma: None,
            timer_at: None,
            touch: None,
            tx_begin_count: 0,
            ramwr_count: 0,
            pixel_words: 0,
            reset_count: 0,
            flush_count: 0,
            irq_mask_depth: 0,
            irq_mask_count: 0,
        }
    }

    /// Scanline being refreshed at virtual time `t`, in [0, 319].
    fn scanline_at(&self, t: u64) -> u32 {
        (((t % self.refresh_period_us) * PANEL_HEIGHT as u64) / self.refresh_period_us) as u32
    }

    /// Raw value the controller's `0x45` query would report, in [0, 161].
    fn raw_scanline_at(&self, t: u64) -> u8 {
        let s = self.scanline_at(t);
        (((s + 3) / 2).min(161)) as u8
    }

    fn write_pixel(&mut self, w: u16) {
        if !self.writing {
            return;
        }
        let idx = self.row as usize * PANEL_WIDTH + self.col as usize;
        if idx < PANEL_PIXELS {
            self.ram[idx] = w;
        }
        self.pixel_words += 1;
        self.col += 1;
        if self.col > self.x1 {
            self.col = self.x0;
            self.row += 1;
            if self.row > self.y1 {
                self.row = self.y0;
            }
        }
    }

    fn start_command(&mut self, cmd: u8) {
        self.writing = false;
        self.pending_cmd = Some(cmd);
        self.params8.clear();
        self.params16.clear();
        if cmd == CMD_RAMWR {
            self.col = self.x0;
            self.row = self.y0;
            self.writing = true;
            self.ramwr_count += 1;
        }
    }

    fn param8(&mut self, b: u8) {
        self.params8.push(b);
        match self.pending_cmd {
            Some(CMD_MADCTL) => self.madctl = b,
            Some(CMD_FRMCTR1) if self.params8.len() == 2 => {
                self.frmctr1 = (self.params8[0], self.params8[1]);
            }
            _ => {}
        }
    }

    fn param16(&mut self, w: u16) {
        self.params16.push(w);
        match (self.pending_cmd, self.params16.len()) {
            (Some(CMD_CASET), 1) => {
                self.x0 = w.min((PANEL_WIDTH - 1) as u16);
                self.col = self.x0;
            }
            (Some(CMD_CASET), 2) => self.x1 = w.min((PANEL_WIDTH - 1) as u16),
            (Some(CMD_PASET), 1) => {
                self.y0 = w.min((PANEL_HEIGHT - 1) as u16);
                self.row = self.y0;
            }
            (Some(CMD_PASET), 2) => self.y1 = w.min((PANEL_HEIGHT - 1) as u16),
            (Some(CMD_VSCRSADD), 1) => self.scroll = w,
            _ => {}
        }
    }

    fn run_dma(&mut self, job: &DmaJob) {
        for seg in &job.segs {
            for k in 0..seg.words {
                // SAFETY: the driver guarantees (and `arm_tx_dma` documents)
                // that segment memory stays valid and frozen until the
                // completion event is delivered, which is exactly now.
                let w = unsafe { *seg.base.offset(k as isize * seg.step as isize) };
                self.write_pixel(w);
            }
        }
    }

    fn next_event_at(&self) -> Option<(u64, LinkEvent)> {
        let dma = self.dma.as_ref().map(|j| (j.done_at, LinkEvent::DmaComplete));
        let tim = self.timer_at.map(|t| (t, LinkEvent::Timer));
        match (dma, tim) {
            (Some(d), Some(t)) => Some(if d.0 <= t.0 { d } else { t }),
            (Some(d), None) => Some(d),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        }
    }

    fn deliver(&mut self, ev: LinkEvent) {
        match ev {
            LinkEvent::DmaComplete => {
                if let Some(job) = self.dma.take() {
                    self.run_dma(&job);
                }
            }
            LinkEvent::Timer => self.timer_at = None,
        }
    }
}

/// Simulated ILI9341 panel behind a [`DisplayLink`].
///
/// Clones share the same simulation; keep one clone as an inspection
/// probe before moving the link into a driver.
#[derive(Clone)]
pub struct MockLink {
    sim: Rc<RefCell<PanelSim>>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// New simulation at time zero, refresh period 10 ms, RAM all zero.
    pub fn new() -> Self {
        Self {
            sim: Rc::new(RefCell::new(PanelSim::new())),
        }
    }

    /// A delay source that advances this simulation's clock.
    pub fn delay(&self) -> MockDelay {
        MockDelay {
            sim: Rc::clone(&self.sim),
        }
    }

    /// Set the refresh period in microseconds.
    pub fn set_refresh_period(&self, us: u64) {
        self.sim.borrow_mut().refresh_period_us = us;
    }

    /// Make the next `n` self-diagnostic readbacks report a bad value.
    pub fn fail_next_self_diag_reads(&self, n: u32) {
        self.sim.borrow_mut().fail_self_diag_reads = n;
    }

    /// Make the next `n` scanline queries time out (raw 0).
    pub fn fail_next_scanline_reads(&self, n: u32) {
        self.sim.borrow_mut().fail_scanline_reads = n;
    }

    /// Script the touch controller's next acquisition frames.
    pub fn set_touch_sample(&self, sample: Option<TouchSample>) {
        self.sim.borrow_mut().touch = sample;
    }

    /// Current virtual time in microseconds.
    pub fn now(&self) -> u64 {
        self.sim.borrow().now
    }

    /// Advance virtual time without doing anything.
    pub fn advance(&self, us: u64) {
        self.sim.borrow_mut().now += us;
    }

    /// Panel RAM word at canonical `(x, y)`.
    pub fn ram_at(&self, x: usize, y: usize) -> u16 {
        self.sim.borrow().ram[y * PANEL_WIDTH + x]
    }

    /// Compare the full panel RAM against a canonical framebuffer.
    pub fn ram_equals(&self, fb: &[u16]) -> bool {
        self.sim.borrow().ram[..] == fb[..PANEL_PIXELS]
    }

    /// Index of the first RAM word differing from `fb`, if any.
    pub fn first_mismatch(&self, fb: &[u16]) -> Option<usize> {
        let sim = self.sim.borrow();
        (0..PANEL_PIXELS).find(|&i| sim.ram[i] != fb[i])
    }

    /// Number of SPI transactions opened so far.
    pub fn tx_begin_count(&self) -> u32 {
        self.sim.borrow().tx_begin_count
    }

    /// Number of `RAMWR` commands decoded so far.
    pub fn ramwr_count(&self) -> u32 {
        self.sim.borrow().ramwr_count
    }

    /// Total pixel words written into RAM.
    pub fn pixel_words(&self) -> u64 {
        self.sim.borrow().pixel_words
    }

    /// Number of panel resets observed.
    pub fn reset_count(&self) -> u32 {
        self.sim.borrow().reset_count
    }

    /// Last MADCTL value written.
    pub fn madctl(&self) -> u8 {
        self.sim.borrow().madctl
    }

    /// Last FRMCTR1 pair written (divider, rtna).
    pub fn frmctr1(&self) -> (u8, u8) {
        self.sim.borrow().frmctr1
    }

    /// Last vertical scroll start address written.
    pub fn scroll(&self) -> u16 {
        self.sim.borrow().scroll
    }

    /// True while a DMA chain is armed and not yet completed.
    pub fn dma_in_flight(&self) -> bool {
        self.sim.borrow().dma.is_some()
    }

    /// Number of cache-flush requests observed.
    pub fn flush_count(&self) -> u32 {
        self.sim.borrow().flush_count
    }

    /// Number of interrupt-masked sections entered so far.
    pub fn irq_mask_count(&self) -> u32 {
        self.sim.borrow().irq_mask_count
    }
}

impl DisplayLink for MockLink {
    fn begin_tx(&mut self, clk_hz: u32) {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        s.in_tx = true;
        s.tx_clk_hz = clk_hz;
        s.tx_begin_count += 1;
    }

    fn end_tx(&mut self) {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        s.in_tx = false;
        s.writing = false;
    }

    fn write_cmd8(&mut self, cmd: u8) {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        s.start_command(cmd);
    }

    fn write_data8(&mut self, data: u8) {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        s.param8(data);
    }

    fn write_data16(&mut self, data: u16) {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        s.param16(data);
    }

    fn read_cmd8(&mut self, cmd: u8, _index: u8, _timeout_ms: u32) -> Option<u8> {
        let mut s = self.sim.borrow_mut();
        s.now += READ_COST_US;
        let v = match cmd {
            RD_MODE => s.power_mode,
            RD_MADCTL => s.madctl,
            RD_PIXFMT => s.pixel_format,
            RD_IMGFMT => s.image_format,
            RD_SELFDIAG => {
                if s.fail_self_diag_reads > 0 {
                    s.fail_self_diag_reads -= 1;
                    0x00
                } else {
                    s.self_diag
                }
            }
            _ => 0,
        };
        Some(v)
    }

    fn read_scanline(&mut self, _timeout_ms: u32) -> u8 {
        let mut s = self.sim.borrow_mut();
        assert!(!s.in_tx, "scanline query during an open TX transaction");
        s.now += READ_COST_US;
        if s.fail_scanline_reads > 0 {
            s.fail_scanline_reads -= 1;
            return 0;
        }
        s.raw_scanline_at(s.now)
    }

    unsafe fn arm_tx_dma(&mut self, chain: &TxChain) {
        let mut s = self.sim.borrow_mut();
        assert!(s.dma.is_none(), "DMA chain armed while one is in flight");
        let words: u64 = chain.iter().map(|seg| u64::from(seg.words)).sum();
        let clk = u64::from(s.tx_clk_hz.max(1));
        let duration = (words * 16 * 1_000_000) / clk;
        let segs = chain
            .iter()
            .map(|seg| RawSeg {
                base: seg.base,
                words: seg.words,
                step: seg.step,
            })
            .collect();
        s.dma = Some(DmaJob {
            segs,
            done_at: s.now + OP_COST_US + duration,
        });
    }

    fn finish_tx_dma(&mut self) {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        assert!(s.dma.is_none(), "finish_tx_dma with a chain still in flight");
    }

    fn flush_cache(&mut self, _ptr: *const u8, _len: usize) {
        self.sim.borrow_mut().flush_count += 1;
    }

    fn one_shot_in(&mut self, micros: u32) {
        let mut s = self.sim.borrow_mut();
        s.timer_at = Some(s.now + u64::from(micros.max(1)));
    }

    fn one_shot_at(&mut self, deadline_micros: u32) {
        let mut s = self.sim.borrow_mut();
        let delta = deadline_micros.wrapping_sub(s.now as u32) as i32;
        let delta = if delta < 1 { 1 } else { delta as u64 };
        s.timer_at = Some(s.now + delta);
    }

    fn cancel_timer(&mut self) {
        self.sim.borrow_mut().timer_at = None;
    }

    fn mask_irqs(&mut self) {
        let mut s = self.sim.borrow_mut();
        s.irq_mask_depth += 1;
        s.irq_mask_count += 1;
    }

    fn unmask_irqs(&mut self) {
        let mut s = self.sim.borrow_mut();
        assert!(
            s.irq_mask_depth > 0,
            "unmask_irqs without a matching mask_irqs"
        );
        s.irq_mask_depth -= 1;
    }

    fn now_micros(&mut self) -> u32 {
        let mut s = self.sim.borrow_mut();
        s.now += OP_COST_US;
        s.now as u32
    }

    fn wait_event(&mut self) -> LinkEvent {
        let mut s = self.sim.borrow_mut();
        let (at, ev) = s
            .next_event_at()
            .expect("wait_event with nothing armed: the driver would hang");
        if at > s.now {
            s.now = at;
        }
        s.deliver(ev);
        ev
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        let mut s = self.sim.borrow_mut();
        match s.next_event_at() {
            Some((at, ev)) if at <= s.now => {
                s.deliver(ev);
                Some(ev)
            }
            _ => None,
        }
    }

    fn panel_reset(&mut self) {
        let mut s = self.sim.borrow_mut();
        s.now += 150_000;
        s.reset_count += 1;
        s.x0 = 0;
        s.x1 = (PANEL_WIDTH - 1) as u16;
        s.y0 = 0;
        s.y1 = (PANEL_HEIGHT - 1) as u16;
        s.writing = false;
        s.scroll = 0;
    }

    fn read_touch(&mut self) -> Option<TouchSample> {
        let mut s = self.sim.borrow_mut();
        s.now += READ_COST_US;
        s.touch
    }
}

/// Delay source advancing the simulation clock.
pub struct MockDelay {
    sim: Rc<RefCell<PanelSim>>,
}

impl embedded_hal::delay::DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.sim.borrow_mut().now += u64::from(ns / 1_000);
    }
}
