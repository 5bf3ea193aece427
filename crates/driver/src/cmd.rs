//! ILI9341 command set.

/// Controller opcodes used by the driver.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub(crate) enum Command {
    Nop = 0x00,
    SwReset = 0x01,
    ReadPowerMode = 0x0A,
    ReadMadctl = 0x0B,
    ReadPixelFormat = 0x0C,
    ReadImageFormat = 0x0D,
    ReadSelfDiag = 0x0F,
    SleepIn = 0x10,
    SleepOut = 0x11,
    InvertOff = 0x20,
    InvertOn = 0x21,
    GammaSet = 0x26,
    DisplayOff = 0x28,
    DisplayOn = 0x29,
    ColumnAddrSet = 0x2A,
    PageAddrSet = 0x2B,
    RamWrite = 0x2C,
    VScrollStart = 0x37,
    PixelFormat = 0x3A,
    /// Frame rate control (normal mode); carries the refresh-mode divider.
    FrameRateCtrl = 0xB1,
    DisplayFunctionCtrl = 0xB6,
    PowerCtrl1 = 0xC0,
    PowerCtrl2 = 0xC1,
    VcomCtrl1 = 0xC5,
    VcomCtrl2 = 0xC7,
    MemoryAccessCtrl = 0x36,
    PositiveGamma = 0xE0,
    NegativeGamma = 0xE1,
    /// Scanline query; raw response in [0, 161].
    GetScanline = 0x45,
}

/// Expected readbacks after a successful init.
pub(crate) const EXPECT_POWER_MODE: u8 = 0x9C;
pub(crate) const EXPECT_PIXEL_FORMAT: u8 = 0x05;
pub(crate) const EXPECT_IMAGE_FORMAT: u8 = 0x00;
/// Self-diagnostic value when everything is functional.
pub const SELFDIAG_OK: u8 = 0xC0;

/// MADCTL written at init: column order flipped, BGR filter — the panel's
/// canonical portrait addressing. Rotation never rewrites it.
pub(crate) const MADCTL_INIT: u8 = 0x48;

/// Power-up command table: count-prefixed `(count, opcode, params...)`
/// records, terminated by a zero count. The undocumented vendor entries
/// match the panel maker's reference sequence.
pub(crate) const INIT_SEQUENCE: &[u8] = &[
    4, 0xEF, 0x03, 0x80, 0x02, //
    4, 0xCF, 0x00, 0xC1, 0x30, // power control B
    5, 0xED, 0x64, 0x03, 0x12, 0x81, // power-on sequence control
    4, 0xE8, 0x85, 0x00, 0x78, // driver timing control A
    6, 0xCB, 0x39, 0x2C, 0x00, 0x34, 0x02, // power control A
    2, 0xF7, 0x20, // pump ratio control
    3, 0xEA, 0x00, 0x00, // driver timing control B
    2, 0xC0, 0x20, // power control 1
    2, 0xC1, 0x10, // power control 2
    3, 0xC5, 0x3E, 0x28, // VCOM control 1
    2, 0xC7, 0x86, // VCOM control 2
    2, 0x36, MADCTL_INIT, // memory access control
    2, 0x3A, 0x55, // 16-bit pixel format
    3, 0xB1, 0x00, 0x18, // frame rate control
    4, 0xB6, 0x08, 0x82, 0x27, // display function control
    2, 0xF2, 0x00, // gamma function disable
    2, 0x26, 0x01, // gamma curve 1
    16, 0xE0, 0x0F, 0x31, 0x2B, 0x0C, 0x0E, 0x08, 0x4E, 0xF1, 0x37, 0x07, 0x10, 0x03, 0x0E,
    0x09, 0x00, // positive gamma
    16, 0xE1, 0x00, 0x0E, 0x14, 0x03, 0x11, 0x07, 0x31, 0xC1, 0x48, 0x08, 0x0F, 0x0C, 0x31,
    0x36, 0x0F, // negative gamma
    0,
];
