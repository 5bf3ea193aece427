//! Shared-bus touch controller shim (XPT2046 class).
//!
//! The controller sits on the display's SPI bus, so position reads must
//! never collide with an upload: a read requested while DMA is in flight
//! is parked and performed by the upload's finish path. Everything else
//! here is filtering — a pressure threshold, best-two-of-three averaging
//! of the noisy position triples, and the per-orientation axis mapping.

use crate::rotation::Rotation;
use platform::TouchSample;

/// Pressure below this is treated as "not touched".
const Z_THRESHOLD: i32 = 400;
/// Pressure below this clears the pen-down latch entirely.
const Z_THRESHOLD_INT: i32 = 75;
/// Minimum milliseconds between bus acquisitions.
const MSEC_THRESHOLD: u32 = 3;

/// Raw full-scale of the controller's position ADC.
const ADC_MAX: i32 = 4095;

/// Touch bookkeeping owned by the driver.
#[derive(Debug)]
pub(crate) struct TouchState {
    touched: bool,
    pen_down: bool,
    read_pending: bool,
    irq_wired: bool,
    irq_at_ms: u32,
    read_at_ms: u32,
    x: i32,
    y: i32,
    z: i32,
    range: Option<(i32, i32, i32, i32)>,
}

impl TouchState {
    pub(crate) const fn new() -> Self {
        Self {
            touched: false,
            pen_down: true,
            read_pending: false,
            irq_wired: false,
            irq_at_ms: 0,
            read_at_ms: 0,
            x: 0,
            y: 0,
            z: 0,
            range: None,
        }
    }

    /// Pen interrupt observed.
    pub(crate) fn note_irq(&mut self, now_ms: u32) {
        self.touched = true;
        self.pen_down = true;
        self.irq_wired = true;
        self.irq_at_ms = now_ms;
    }

    /// Milliseconds since the last interrupt, consuming the latch.
    pub(crate) fn take_last_touched(&mut self, now_ms: u32) -> Option<u32> {
        let was = self.touched;
        self.touched = false;
        if was && self.irq_wired {
            Some(now_ms.wrapping_sub(self.irq_at_ms))
        } else {
            None
        }
    }

    /// Ask the upload finish path to perform the next acquisition.
    pub(crate) fn request_read(&mut self) {
        self.read_pending = true;
    }

    pub(crate) fn take_read_pending(&mut self) -> bool {
        core::mem::replace(&mut self.read_pending, false)
    }

    /// Whether an acquisition is worth the bus time right now.
    pub(crate) fn due(&self, now_ms: u32) -> bool {
        if now_ms.wrapping_sub(self.read_at_ms) < MSEC_THRESHOLD {
            return false;
        }
        !self.irq_wired || self.pen_down
    }

    /// Digest one acquisition frame.
    pub(crate) fn process(&mut self, sample: TouchSample, now_ms: u32) {
        let mut z = i32::from(sample.z1) + ADC_MAX - i32::from(sample.z2);
        if z < 0 {
            z = 0;
        }
        if z < Z_THRESHOLD {
            self.z = 0;
            if z < Z_THRESHOLD_INT && self.irq_wired {
                self.pen_down = false;
            }
            return;
        }
        self.z = z;
        self.x = i32::from(best_two_avg(sample.x[0], sample.x[1], sample.x[2]));
        self.y = i32::from(best_two_avg(sample.y[0], sample.y[1], sample.y[2]));
        self.read_at_ms = now_ms;
    }

    /// Map raw coordinates to screen coordinates; zeroed bounds mean raw.
    pub(crate) fn set_range(&mut self, min_x: i32, max_x: i32, min_y: i32, max_y: i32) {
        self.range = if min_x < max_x && min_y < max_y {
            Some((min_x, max_x, min_y, max_y))
        } else {
            None
        };
    }

    /// Last position under the given orientation, with the calibration
    /// range applied when one is set. Returns `(x, y, z)`.
    pub(crate) fn point(&self, rotation: Rotation) -> (i32, i32, i32) {
        let (px, py) = (self.x, self.y);
        let (rx, ry) = match rotation {
            Rotation::Portrait => (ADC_MAX - py, ADC_MAX - px),
            Rotation::Landscape => (ADC_MAX - px, py),
            Rotation::PortraitFlipped => (py, px),
            Rotation::LandscapeFlipped => (px, ADC_MAX - py),
        };
        match self.range {
            Some((min_x, max_x, min_y, max_y)) => {
                let w = rotation.width() as i32;
                let h = rotation.height() as i32;
                (
                    map_range(rx, min_x, max_x, 0, w - 1),
                    map_range(ry, min_y, max_y, 0, h - 1),
                    self.z,
                )
            }
            None => (rx, ry, self.z),
        }
    }
}

/// Average of the two closest of three noisy readings.
fn best_two_avg(a: i16, b: i16, c: i16) -> i16 {
    let da = (a - b).abs();
    let db = (a - c).abs();
    let dc = (c - b).abs();
    if da <= db && da <= dc {
        (a + b) >> 1
    } else if db <= da && db <= dc {
        (a + c) >> 1
    } else {
        (b + c) >> 1
    }
}

fn map_range(v: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    (v - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_two_avg_drops_the_outlier() {
        assert_eq!(best_two_avg(100, 102, 900), 101);
        assert_eq!(best_two_avg(900, 100, 102), 101);
        assert_eq!(best_two_avg(100, 900, 102), 101);
    }

    #[test]
    fn light_pressure_reads_as_no_touch() {
        let mut t = TouchState::new();
        t.process(
            TouchSample {
                z1: 10,
                z2: 4000,
                x: [100, 100, 100],
                y: [200, 200, 200],
            },
            5,
        );
        let (_, _, z) = t.point(Rotation::Portrait);
        assert_eq!(z, 0);
    }

    #[test]
    fn firm_press_maps_through_the_rotation() {
        let mut t = TouchState::new();
        t.process(
            TouchSample {
                z1: 3000,
                z2: 500,
                x: [1000, 1010, 3000],
                y: [2000, 2010, 100],
            },
            5,
        );
        let (x0, y0, z) = t.point(Rotation::Portrait);
        assert!(z >= Z_THRESHOLD);
        assert_eq!(x0, ADC_MAX - 2005);
        assert_eq!(y0, ADC_MAX - 1005);
        let (x2, y2, _) = t.point(Rotation::PortraitFlipped);
        assert_eq!(x2, 2005);
        assert_eq!(y2, 1005);
    }

    #[test]
    fn calibration_range_maps_to_screen_coordinates() {
        let mut t = TouchState::new();
        t.x = 2000;
        t.y = 2000;
        t.z = 1000;
        t.set_range(0, ADC_MAX, 0, ADC_MAX);
        let (x, y, _) = t.point(Rotation::Portrait);
        assert!((0..240).contains(&x));
        assert!((0..320).contains(&y));
    }

    #[test]
    fn acquisitions_are_rate_limited() {
        let mut t = TouchState::new();
        t.process(
            TouchSample {
                z1: 3000,
                z2: 500,
                x: [1, 1, 1],
                y: [1, 1, 1],
            },
            10,
        );
        assert!(!t.due(11));
        assert!(t.due(13));
    }

    #[test]
    fn last_touched_consumes_the_latch() {
        let mut t = TouchState::new();
        t.note_irq(100);
        assert_eq!(t.take_last_touched(130), Some(30));
        assert_eq!(t.take_last_touched(140), None);
    }
}
