//! Vsync-aligned differential framebuffer streaming for ILI9341 panels.
//!
//! The panel's SPI bus is slow relative to its refresh rate, so this
//! driver gets its frame rate from two tricks:
//!
//! 1. **Differential uploads** — only the pixels that changed since the
//!    previous frame cross the bus, encoded by [`diff::DiffBuffer`] as a
//!    compact stream of write-runs.
//! 2. **Scanline racing** — every run is released only once the panel's
//!    refresh scan has passed its rows, so a watching eye never sees a
//!    half-drawn frame. The [`timing::ScanlineOracle`] keeps the phase
//!    estimate; the upload engine races it with TX-DMA chains and a
//!    one-shot timer.
//!
//! # Architecture layers
//!
//! ```text
//! Application (renders frames, routes the two ISRs)
//!         ↓
//! Ili9341Driver — buffering coordinator + upload state machine
//!         ↓
//! platform::DisplayLink (SPI, TX DMA, timer, clock, cache, events)
//! ```
//!
//! # Usage sketch
//!
//! ```rust,ignore
//! use driver::{diff::DiffBuffer, Ili9341Driver};
//! use static_cell::StaticCell;
//!
//! static FB1: StaticCell<[u16; driver::NB_PIXELS]> = StaticCell::new();
//! static ARENA1: StaticCell<[u8; 8192]> = StaticCell::new();
//!
//! let mut lcd = Ili9341Driver::new(link);
//! lcd.begin(&mut delay)?;
//! lcd.set_framebuffers(Some(FB1.init([0; driver::NB_PIXELS])), None);
//! lcd.set_diff_buffers(Some(DiffBuffer::new(ARENA1.init([0; 8192]))), None);
//! lcd.set_vsync_spacing(2); // refresh_rate / 2 frames per second, no tearing
//!
//! // in the render loop
//! lcd.update(&frame);
//! // in the ISRs
//! // SPI DMA completion -> lcd.on_dma_complete();
//! // timer              -> lcd.on_timer();
//! ```

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

mod cmd;
pub mod diff;
pub mod ili9341;
pub mod rotation;
pub mod stats;
pub mod timing;
mod touch;
mod upload;

pub use cmd::SELFDIAG_OK;
pub use diff::{DiffBuffer, DiffRead, DummyDiff};
pub use ili9341::{BufferingMode, Ili9341Driver, InitError, ReadbackStage, StatusReadback};
pub use rotation::Rotation;
pub use stats::{FrameStats, Sample};
pub use timing::ScanlineOracle;

/// Panel width in the canonical orientation.
pub const TFT_WIDTH: usize = 240;

/// Panel height in the canonical orientation (also the scanline count).
pub const TFT_HEIGHT: usize = 320;

/// Pixels per frame.
pub const NB_PIXELS: usize = TFT_WIDTH * TFT_HEIGHT;

/// Default SPI write clock; many panels overclock well beyond it.
pub const DEFAULT_SPI_CLOCK: u32 = 30_000_000;

/// Default SPI read clock (readback is far slower than write).
pub const DEFAULT_SPI_CLOCK_READ: u32 = 4_000_000;

/// Refresh rate targeted right after init.
pub const DEFAULT_REFRESH_RATE_HZ: f64 = 90.0;

/// Default frame pacing: every second refresh.
pub const DEFAULT_VSYNC_SPACING: i8 = 2;

/// Largest usable vsync spacing.
pub const MAX_VSYNC_SPACING: i8 = 10;

/// Default run-coalescing gap in pixels.
pub const DEFAULT_DIFF_GAP: u32 = 10;

/// Default tolerance for late upload starts.
pub const DEFAULT_LATE_START_RATIO: f32 = 0.3;
