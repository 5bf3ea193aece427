//! Panel timing oracle.
//!
//! Every timing bet the upload engine makes goes through one phase
//! estimate: the pair `(synced_scanline, synced_at)` captured at the last
//! hardware scanline query, extrapolated with the measured refresh period
//! `P`. No other component reads the panel's scanline register.
//!
//! The controller reports its scan position in a coarse [0, 161] register;
//! [`ScanlineOracle::scanline`] remaps it into the 320-line space with
//! `s = max(0, 2·raw − 3)`, letting line 0 absorb the remap slack.
//!
//! The refresh-rate model mirrors the controller's frame-rate divider:
//! mode `m` of 0..=31 scales the fastest period by `(16 + m')/16`, with an
//! extra halving (and `m' = m − 16`) for modes 16 and up.

use platform::DisplayLink;

use crate::TFT_HEIGHT;

/// Scanlines per refresh cycle.
pub const NB_SCANLINES: u32 = TFT_HEIGHT as u32;

/// Frames averaged by [`ScanlineOracle::sample`].
const SAMPLE_FRAMES: u32 = 10;

/// Highest refresh mode.
pub const MAX_REFRESH_MODE: u8 = 31;

/// Phase and period estimate for the panel's refresh scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanlineOracle {
    period: u32,
    period_mode0: u32,
    synced_scanline: u32,
    synced_at: u32,
}

impl ScanlineOracle {
    /// A blank oracle; useless until [`Self::sample`] has run once.
    pub const fn new() -> Self {
        Self {
            period: 0,
            period_mode0: 0,
            synced_scanline: 0,
            synced_at: 0,
        }
    }

    /// Current refresh period estimate in microseconds (0 before the
    /// first sample).
    pub fn period(&self) -> u32 {
        self.period
    }

    /// Refresh period of the fastest mode, captured by the driver right
    /// after sampling mode 0.
    pub fn period_mode0(&self) -> u32 {
        self.period_mode0
    }

    pub(crate) fn note_period_mode0(&mut self) {
        self.period_mode0 = self.period;
    }

    /// Remap a raw [0, 161] scanline register value into 320-line space.
    #[inline]
    pub fn remap_raw(raw: u8) -> u32 {
        (2 * i32::from(raw) - 3).max(0) as u32
    }

    /// Current scanline in [0, 319].
    ///
    /// With `sync` the panel is queried (the bus must be free) and the
    /// phase estimate is refreshed; without it the position is predicted
    /// from the last sync point.
    pub fn scanline<L: DisplayLink>(&mut self, link: &mut L, sync: bool, timeout_ms: u32) -> u32 {
        if sync {
            let raw = link.read_scanline(timeout_ms);
            let s = Self::remap_raw(raw);
            self.synced_at = link.now_micros();
            self.synced_scanline = s;
            return s;
        }
        if self.period == 0 {
            return self.synced_scanline;
        }
        let elapsed = u64::from(link.now_micros().wrapping_sub(self.synced_at));
        let advanced = elapsed * u64::from(NB_SCANLINES) / u64::from(self.period);
        ((u64::from(self.synced_scanline) + advanced) % u64::from(NB_SCANLINES)) as u32
    }

    /// Microseconds until the scan reaches line `s` (forward distance in
    /// the 320-line cycle).
    pub fn micros_to_reach<L: DisplayLink>(
        &mut self,
        link: &mut L,
        s: u32,
        sync: bool,
        timeout_ms: u32,
    ) -> u32 {
        let now = self.scanline(link, sync, timeout_ms);
        let dist = if now <= s {
            s - now
        } else {
            s + NB_SCANLINES - now
        };
        self.time_for_scanlines(dist)
    }

    /// Microseconds until the scan leaves `[start, end]`; 0 when it is
    /// already outside, or when the range is degenerate (inverted, or
    /// spanning four fifths of the cycle or more).
    pub fn micros_to_exit<L: DisplayLink>(&mut self, link: &mut L, start: u32, end: u32) -> u32 {
        if end < start {
            return 0;
        }
        let delta = end - start;
        if 5 * delta >= 4 * NB_SCANLINES {
            return 0;
        }
        let v = self.scanline(link, false, 0);
        if v < start || v > end {
            return 0;
        }
        // never 0 while inside the range
        1 + self.micros_to_reach(link, (end + 1) % NB_SCANLINES, false, 0)
    }

    /// Microseconds the scan needs for `n` lines.
    pub fn time_for_scanlines(&self, n: u32) -> u32 {
        ((u64::from(n) * u64::from(self.period)) / u64::from(NB_SCANLINES)) as u32
    }

    /// Scanlines the scan covers in `us` microseconds.
    pub fn scanlines_during(&self, us: u32) -> u32 {
        if self.period == 0 {
            return 0;
        }
        ((u64::from(us) * u64::from(NB_SCANLINES)) / u64::from(self.period)) as u32
    }

    /// Measure the refresh period: the mean interval between consecutive
    /// scanline-0 departures over [`SAMPLE_FRAMES`] frames. Blocks for
    /// roughly twice that many refresh cycles.
    pub fn sample<L: DisplayLink>(
        &mut self,
        link: &mut L,
        delay: &mut impl embedded_hal::delay::DelayNs,
        timeout_ms: u32,
    ) {
        let mut sum: u64 = 0;
        for _ in 0..SAMPLE_FRAMES {
            // park well away from the edge so each crossing is distinct
            delay.delay_us(5_000);
            while self.scanline(link, true, timeout_ms) != 0 {}
            while self.scanline(link, true, timeout_ms) != 1 {}
            let t0 = link.now_micros();
            delay.delay_us(5_000);
            while self.scanline(link, true, timeout_ms) != 0 {}
            while self.scanline(link, true, timeout_ms) != 1 {}
            sum += u64::from(link.now_micros().wrapping_sub(t0));
        }
        self.period = (sum / u64::from(SAMPLE_FRAMES)) as u32;
    }

    // ── Refresh-mode model ───────────────────────────────────────────────

    /// Refresh rate in Hz the panel would run at in `mode`, derived from
    /// the fastest mode's measured period.
    pub fn rate_for_mode(&self, mode: u8) -> f64 {
        if self.period_mode0 == 0 {
            return 0.0;
        }
        let mut freq = 1_000_000.0 / f64::from(self.period_mode0);
        let mut m = u32::from(mode.min(MAX_REFRESH_MODE));
        if m >= 16 {
            freq /= 2.0;
            m -= 16;
        }
        (freq * 16.0) / (16.0 + f64::from(m))
    }

    /// Mode whose refresh rate is closest to `hz`.
    pub fn mode_for_rate(&self, hz: f64) -> u8 {
        if hz <= self.rate_for_mode(MAX_REFRESH_MODE) {
            return MAX_REFRESH_MODE;
        }
        if hz >= self.rate_for_mode(0) {
            return 0;
        }
        // rates are monotonically decreasing in the mode index
        let mut a: u8 = 0;
        let mut b: u8 = MAX_REFRESH_MODE;
        while b - a > 1 {
            let c = (a + b) / 2;
            if hz < self.rate_for_mode(c) {
                a = c;
            } else {
                b = c;
            }
        }
        let da = self.rate_for_mode(a) - hz;
        let db = hz - self.rate_for_mode(b);
        if da < db {
            a
        } else {
            b
        }
    }

    /// Current refresh rate in Hz (0 before the first sample).
    pub fn refresh_rate(&self) -> f64 {
        if self.period == 0 {
            0.0
        } else {
            1_000_000.0 / f64::from(self.period)
        }
    }
}

#[cfg(test)]
mod tests {
    use platform::mocks::MockLink;

    use super::*;

    #[test]
    fn remap_pins_the_low_raw_values_to_line_zero() {
        assert_eq!(ScanlineOracle::remap_raw(0), 0);
        assert_eq!(ScanlineOracle::remap_raw(1), 0);
        assert_eq!(ScanlineOracle::remap_raw(2), 1);
        assert_eq!(ScanlineOracle::remap_raw(161), 319);
    }

    #[test]
    fn predicted_scanline_tracks_elapsed_time() {
        let probe = MockLink::new();
        probe.set_refresh_period(3_200); // 10 us per line
        let mut link = probe.clone();
        let mut o = ScanlineOracle::new();
        o.period = 3_200;
        o.scanline(&mut link, true, 0);
        let s0 = o.scanline(&mut link, false, 0);
        probe.advance(100);
        let s1 = o.scanline(&mut link, false, 0);
        assert!(
            (s1 + NB_SCANLINES - s0) % NB_SCANLINES >= 9,
            "scan should advance about 10 lines, went {s0} -> {s1}"
        );
    }

    #[test]
    fn micros_to_reach_wraps_forward() {
        let probe = MockLink::new();
        probe.set_refresh_period(3_200);
        let mut link = probe.clone();
        let mut o = ScanlineOracle::new();
        o.period = 3_200;
        probe.advance(1_000); // scan near line 100
        o.scanline(&mut link, true, 0);
        let fwd = o.micros_to_reach(&mut link, 110, false, 0);
        assert!(fwd <= 200, "short hop took {fwd} us");
        let wrap = o.micros_to_reach(&mut link, 50, false, 0);
        assert!(
            (2_000..3_400).contains(&wrap),
            "wrap-around hop took {wrap} us"
        );
    }

    #[test]
    fn micros_to_exit_is_zero_outside_the_range() {
        let probe = MockLink::new();
        probe.set_refresh_period(3_200);
        let mut link = probe.clone();
        let mut o = ScanlineOracle::new();
        o.period = 3_200;
        probe.advance(1_600); // around line 160
        o.scanline(&mut link, true, 0);
        assert_eq!(o.micros_to_exit(&mut link, 0, 50), 0);
        assert!(o.micros_to_exit(&mut link, 100, 200) > 0);
        // degenerate ranges report no wait
        assert_eq!(o.micros_to_exit(&mut link, 200, 100), 0);
        assert_eq!(o.micros_to_exit(&mut link, 0, 319), 0);
    }

    #[test]
    fn sample_recovers_the_mock_period() {
        let probe = MockLink::new();
        probe.set_refresh_period(10_000);
        let mut link = probe.clone();
        let mut delay = probe.delay();
        let mut o = ScanlineOracle::new();
        o.sample(&mut link, &mut delay, 0);
        let p = o.period();
        assert!(
            (9_500..10_500).contains(&p),
            "sampled period {p} us, expected about 10000"
        );
    }

    #[test]
    fn rate_model_matches_the_divider_formula() {
        let mut o = ScanlineOracle::new();
        o.period_mode0 = 8_333; // ~120 Hz fastest
        let base = o.rate_for_mode(0);
        assert!((base - 120.0).abs() < 1.0);
        // mode 16 is the fastest divider with the /2 prescaler
        assert!((o.rate_for_mode(16) - base / 2.0).abs() < 0.5);
        assert!(o.rate_for_mode(31) < o.rate_for_mode(30));
    }

    #[test]
    fn mode_for_rate_picks_the_nearest_mode() {
        let mut o = ScanlineOracle::new();
        o.period_mode0 = 8_333;
        assert_eq!(o.mode_for_rate(1_000.0), 0);
        assert_eq!(o.mode_for_rate(1.0), MAX_REFRESH_MODE);
        let m = o.mode_for_rate(o.rate_for_mode(7));
        assert_eq!(m, 7);
    }

    #[test]
    fn scanlines_during_inverts_time_for_scanlines() {
        let mut o = ScanlineOracle::new();
        o.period = 3_200;
        let t = o.time_for_scanlines(37);
        let n = o.scanlines_during(t);
        assert!(n.abs_diff(37) <= 1);
    }
}
