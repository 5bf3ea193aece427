//! Screen rotation as a traversal policy.
//!
//! The panel is always addressed in its native portrait orientation and
//! every internal framebuffer is stored that way ("canonical": 240×320,
//! row-major). A rotation never re-addresses the panel — it only changes
//! how a user framebuffer, which is laid out for the rotated logical
//! screen, is traversed when it is diffed, copied or streamed out.
//!
//! [`Rotation::src_index`] is that traversal: it maps a canonical pixel
//! offset to the offset of the same physical pixel in a rotated source
//! buffer. Rotation 0 is the identity and rotation 2 a reversal, so both
//! are contiguous walks; rotations 1 and 3 hop by the rotated row pitch
//! (320 words) between horizontally adjacent canonical pixels and must
//! never be treated as contiguous.

use crate::{NB_PIXELS, TFT_HEIGHT, TFT_WIDTH};

/// Screen orientation, numbered like the classic driver rotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rotation {
    /// 0 — portrait 240×320, the panel's native order.
    #[default]
    Portrait = 0,
    /// 1 — landscape 320×240.
    Landscape = 1,
    /// 2 — portrait 240×320, flipped.
    PortraitFlipped = 2,
    /// 3 — landscape 320×240, flipped.
    LandscapeFlipped = 3,
}

impl Rotation {
    /// Rotation for an index; values above 3 wrap (an invalid request
    /// degrades instead of failing).
    pub fn from_index(r: u8) -> Self {
        match r & 3 {
            0 => Rotation::Portrait,
            1 => Rotation::Landscape,
            2 => Rotation::PortraitFlipped,
            _ => Rotation::LandscapeFlipped,
        }
    }

    /// Numeric index, 0..=3.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Logical screen width under this rotation.
    pub fn width(self) -> u32 {
        if self.is_landscape() {
            TFT_HEIGHT as u32
        } else {
            TFT_WIDTH as u32
        }
    }

    /// Logical screen height under this rotation.
    pub fn height(self) -> u32 {
        if self.is_landscape() {
            TFT_WIDTH as u32
        } else {
            TFT_HEIGHT as u32
        }
    }

    /// True for rotations 1 and 3.
    pub fn is_landscape(self) -> bool {
        matches!(self, Rotation::Landscape | Rotation::LandscapeFlipped)
    }

    /// True when the traversal is a contiguous memory walk (forward or
    /// reverse).
    pub fn is_contiguous(self) -> bool {
        !self.is_landscape()
    }

    /// Offset in a rotated source buffer of the pixel at canonical
    /// offset `n`.
    #[inline]
    pub fn src_index(self, n: usize) -> usize {
        match self {
            Rotation::Portrait => n,
            Rotation::Landscape => {
                let y = n / TFT_WIDTH;
                let x = n % TFT_WIDTH;
                y + TFT_HEIGHT * (TFT_WIDTH - 1 - x)
            }
            Rotation::PortraitFlipped => NB_PIXELS - 1 - n,
            Rotation::LandscapeFlipped => {
                let y = n / TFT_WIDTH;
                let x = n % TFT_WIDTH;
                (TFT_HEIGHT - 1 - y) + TFT_HEIGHT * x
            }
        }
    }

    /// Source-offset change per step along a canonical scanline.
    ///
    /// Together with [`Self::src_index`] of a scanline's first pixel this
    /// describes one DMA segment for the pixel pusher.
    #[inline]
    pub(crate) fn src_step(self) -> i32 {
        match self {
            Rotation::Portrait => 1,
            Rotation::PortraitFlipped => -1,
            Rotation::Landscape | Rotation::LandscapeFlipped => {
                // adjacent canonical columns are a rotated row apart
                if self == Rotation::Landscape {
                    -(TFT_HEIGHT as i32)
                } else {
                    TFT_HEIGHT as i32
                }
            }
        }
    }
}

/// Copy a rotated source framebuffer over a canonical destination.
///
/// After the call `dest[n] == src[rotation.src_index(n)]` for every `n`:
/// the destination holds the source image in panel order.
pub fn copy_rotated(dest: &mut [u16], src: &[u16], rotation: Rotation) {
    debug_assert!(dest.len() >= NB_PIXELS && src.len() >= NB_PIXELS);
    match rotation {
        Rotation::Portrait => dest[..NB_PIXELS].copy_from_slice(&src[..NB_PIXELS]),
        Rotation::Landscape => {
            let mut p = 0;
            for i in 0..TFT_HEIGHT {
                for j in (0..TFT_WIDTH).rev() {
                    dest[p] = src[i + TFT_HEIGHT * j];
                    p += 1;
                }
            }
        }
        Rotation::PortraitFlipped => {
            for (p, d) in dest[..NB_PIXELS].iter_mut().enumerate() {
                *d = src[NB_PIXELS - 1 - p];
            }
        }
        Rotation::LandscapeFlipped => {
            let mut p = 0;
            for i in (0..TFT_HEIGHT).rev() {
                for j in 0..TFT_WIDTH {
                    dest[p] = src[i + TFT_HEIGHT * j];
                    p += 1;
                }
            }
        }
    }
}
