//! The display link capability.
//!
//! [`DisplayLink`] is the single narrow surface the driver core speaks to.
//! One value of it bundles everything one panel instance needs from the
//! host: the SPI transaction and FIFO write primitives, register readback,
//! the scanline query, TX-DMA chain arming, a one-shot microsecond timer,
//! a free-running microsecond clock, cache maintenance, and event
//! delivery for the two interrupt sources (DMA completion and timer fire).
//!
//! Bundling these into one trait is deliberate: a display instance always
//! owns exactly one bus, one DMA channel, one timer slot and one clock, so
//! splitting them buys nothing and makes slot bookkeeping the caller's
//! problem. Instantiating a second driver means constructing a second
//! `DisplayLink`; there is no global slot table.
//!
//! # Event delivery
//!
//! Implementations deliver [`LinkEvent`]s for the DMA-chain tail interrupt
//! and the one-shot timer. On hardware the ISRs typically record the event
//! and the application routes it into the driver's `on_dma_complete` /
//! `on_timer` entry points; [`DisplayLink::wait_event`] is the blocking
//! variant used by the driver's synchronous paths (a WFI-style wait on an
//! MCU, a simulated-time step in the mock).

/// An event produced by one of the link's two interrupt sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    /// The tail descriptor of the armed TX-DMA chain completed.
    DmaComplete,
    /// The one-shot timer fired.
    Timer,
}

/// One TX-DMA pixel segment.
///
/// Transmits `words` RGB565 words, the k-th read from
/// `base.offset(k * step)`. `step == 1` is a plain contiguous read,
/// `step == -1` a reversed one, and `|step| > 1` a strided walk (used for
/// landscape-rotated sources, which are not contiguous in canonical scan
/// order).
#[derive(Debug, Clone, Copy)]
pub struct TxSeg {
    /// Address of the first word transmitted.
    pub base: *const u16,
    /// Number of 16-bit words in the segment.
    pub words: u32,
    /// Word offset between consecutive reads.
    pub step: i32,
}

impl TxSeg {
    /// A contiguous forward segment.
    pub fn contiguous(base: *const u16, words: u32) -> Self {
        Self { base, words, step: 1 }
    }
}

/// Upper bound on segments per armed chain.
///
/// A chain carries at most one segment per touched scanline and a run is
/// clipped to 120 lines by the diff reader, so 128 leaves headroom.
pub const MAX_TX_SEGS: usize = 128;

/// A TX-DMA descriptor chain: the pixel segments for one write-run.
///
/// Implementations prepend their own framing descriptor that switches the
/// bus to 16-bit data mode (DC high) before the first pixel word, and raise
/// [`LinkEvent::DmaComplete`] when the tail segment drains.
pub type TxChain = heapless::Vec<TxSeg, MAX_TX_SEGS>;

/// Host capabilities consumed by the driver core, one value per panel.
///
/// FIFO writes are infallible by contract: on the targeted hardware they
/// spin on FIFO watermarks and cannot report failure. Fallible setup
/// (pin validation, bus acquisition) belongs to the construction of the
/// implementing type, before a driver ever sees it.
pub trait DisplayLink {
    // ── SPI transactions ─────────────────────────────────────────────────

    /// Open an SPI transaction at the given clock and assert chip select.
    fn begin_tx(&mut self, clk_hz: u32);

    /// Release chip select and close the transaction.
    fn end_tx(&mut self);

    /// Write a command byte (DC asserted).
    fn write_cmd8(&mut self, cmd: u8);

    /// Write a data byte (DC deasserted).
    fn write_data8(&mut self, data: u8);

    /// Write a 16-bit data word (DC deasserted).
    fn write_data16(&mut self, data: u16);

    /// Read one byte of a command response.
    ///
    /// Opens its own read-clock transaction. `timeout_ms == 0` means no
    /// timeout; `None` is returned if the deadline expires first.
    fn read_cmd8(&mut self, cmd: u8, index: u8, timeout_ms: u32) -> Option<u8>;

    /// Issue the scanline query (`0x45`) and return the raw value in
    /// `[0, 161]`. Returns 0 if the read times out.
    ///
    /// Must not be called while a TX transaction is open.
    fn read_scanline(&mut self, timeout_ms: u32) -> u8;

    // ── TX DMA ───────────────────────────────────────────────────────────

    /// Arm the TX-DMA chain. Completion of the tail segment raises
    /// [`LinkEvent::DmaComplete`].
    ///
    /// # Safety
    ///
    /// Every segment's source range must stay valid, and unmodified, until
    /// the completion event has been delivered. The driver guarantees this
    /// by freezing the upload source while a transfer is in flight.
    unsafe fn arm_tx_dma(&mut self, chain: &TxChain);

    /// Tear down after the last chain of a frame: drain the TX FIFO, wait
    /// for the bus to go quiet, restore the FIFO watermark and detach the
    /// DMA request from the transmitter.
    fn finish_tx_dma(&mut self);

    /// Flush any write-back cache over `len` bytes at `ptr` so DMA sees
    /// the data. No-op on coherent platforms.
    fn flush_cache(&mut self, ptr: *const u8, len: usize) {
        let _ = (ptr, len);
    }

    // ── One-shot timer ───────────────────────────────────────────────────

    /// Arm the one-shot timer to raise [`LinkEvent::Timer`] in `micros`
    /// microseconds. Re-arming replaces any pending shot.
    fn one_shot_in(&mut self, micros: u32);

    /// Arm the one-shot timer for an absolute [`Self::now_micros`]
    /// deadline. A deadline already in the past fires as soon as possible.
    fn one_shot_at(&mut self, deadline_micros: u32);

    /// Cancel a pending one-shot, if any.
    fn cancel_timer(&mut self);

    // ── Critical sections ────────────────────────────────────────────────

    /// Mask this link's two interrupt sources (DMA completion and the
    /// one-shot timer) so a short multi-word driver update cannot be
    /// preempted by their delivery.
    ///
    /// The driver does not nest calls and keeps the masked sections a few
    /// field accesses long. Events raised while masked must be held
    /// pending and delivered after [`Self::unmask_irqs`], never dropped.
    /// The default is a no-op, which is sufficient wherever events reach
    /// the driver only by polling from a single context (host tests).
    fn mask_irqs(&mut self) {}

    /// Undo [`Self::mask_irqs`].
    fn unmask_irqs(&mut self) {}

    // ── Clock ────────────────────────────────────────────────────────────

    /// Free-running microsecond counter; wraps at `u32::MAX`.
    fn now_micros(&mut self) -> u32;

    // ── Events ───────────────────────────────────────────────────────────

    /// Block until the next pending event and return it.
    fn wait_event(&mut self) -> LinkEvent;

    /// Return a pending event without blocking, if one is due.
    fn poll_event(&mut self) -> Option<LinkEvent>;

    // ── Panel plumbing ───────────────────────────────────────────────────

    /// Pulse the panel reset line, blocking through the post-reset settle
    /// time. No-op where no reset line is wired.
    fn panel_reset(&mut self) {}

    /// Sample the shared-bus touch controller, if one is present.
    ///
    /// Returns `None` when no controller is wired. Must not be called
    /// while a TX transaction is open.
    fn read_touch(&mut self) -> Option<TouchSample> {
        None
    }
}

/// One raw acquisition frame from the XPT2046-class touch controller.
///
/// Pressure electrodes first, then three x and three y position reads;
/// the driver filters and maps them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TouchSample {
    /// First pressure electrode reading.
    pub z1: i16,
    /// Second pressure electrode reading.
    pub z2: i16,
    /// Three consecutive x position reads.
    pub x: [i16; 3],
    /// Three consecutive y position reads.
    pub y: [i16; 3],
}
