//! Capability layer for the display driver core.
//!
//! The driver core never touches a peripheral register. Everything it
//! needs from the host is expressed by the [`DisplayLink`] trait — SPI
//! transactions, register readback, the scanline query, TX-DMA chain
//! arming, a one-shot microsecond timer, a free-running microsecond clock,
//! cache maintenance and interrupt-event delivery — one value per panel
//! instance.
//!
//! # Architecture layers
//!
//! ```text
//! Application
//!         ↓
//! driver crate (diff engine, upload state machine, coordinator)
//!         ↓
//! this crate — DisplayLink (trait abstraction)
//!         ↓
//! Hardware layer (LPSPI + eDMA + PIT on an MCU, MockLink on the host)
//! ```
//!
//! # Features
//!
//! - `std`: enable [`mocks`] — a behavioral ILI9341 panel simulation with
//!   a virtual microsecond clock, used by every host test.
//! - `defmt`: `defmt::Format` derives on public types.

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)] // hardware accessors — callers decide
#![allow(clippy::module_name_repetitions)]

pub mod link;

#[cfg(any(test, feature = "std"))]
pub mod mocks;

pub use link::{DisplayLink, LinkEvent, TouchSample, TxChain, TxSeg, MAX_TX_SEGS};
