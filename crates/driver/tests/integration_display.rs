//! End-to-end driver tests against the simulated panel.
//!
//! Every test brings the driver up through the real init path, pushes
//! frames through the real diff/upload machinery, and checks the mock
//! panel's RAM — the same observable a user has.

use driver::rotation::copy_rotated;
use driver::{DiffBuffer, Ili9341Driver, Rotation, NB_PIXELS, TFT_WIDTH};
use platform::mocks::MockLink;

const REFRESH_PERIOD_US: u64 = 10_000;

fn leak_fb() -> &'static mut [u16] {
    Box::leak(vec![0u16; NB_PIXELS].into_boxed_slice())
}

fn leak_arena(bytes: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; bytes].into_boxed_slice())
}

/// Panel + driver through the full `begin()` sequence.
fn bring_up(spi_clock: u32) -> (Ili9341Driver<'static, MockLink>, MockLink) {
    let probe = MockLink::new();
    probe.set_refresh_period(REFRESH_PERIOD_US);
    let mut delay = probe.delay();
    let mut lcd = Ili9341Driver::new(probe.clone());
    lcd.begin_with(spi_clock, 4_000_000, &mut delay)
        .expect("panel init");
    (lcd, probe)
}

fn bring_up_double(spi_clock: u32) -> (Ili9341Driver<'static, MockLink>, MockLink) {
    let (mut lcd, probe) = bring_up(spi_clock);
    lcd.set_framebuffers(Some(leak_fb()), None);
    lcd.set_diff_buffers(Some(DiffBuffer::new(leak_arena(64 * 1024))), None);
    (lcd, probe)
}

// ── Bring-up ─────────────────────────────────────────────────────────────

#[test]
fn begin_measures_a_believable_refresh_rate() {
    let (lcd, _probe) = bring_up(30_000_000);
    let hz = lcd.refresh_rate();
    assert!(
        (80.0..130.0).contains(&hz),
        "refresh rate {hz:.1} Hz out of range"
    );
}

#[test]
fn begin_retries_a_failing_self_diagnostic() {
    let probe = MockLink::new();
    probe.set_refresh_period(REFRESH_PERIOD_US);
    probe.fail_next_self_diag_reads(1);
    let mut delay = probe.delay();
    let mut lcd = Ili9341Driver::new(probe.clone());
    lcd.begin(&mut delay).expect("second attempt should pass");
    assert_eq!(probe.reset_count(), 2);
}

#[test]
fn begin_gives_up_after_repeated_mismatches() {
    let probe = MockLink::new();
    probe.set_refresh_period(REFRESH_PERIOD_US);
    probe.fail_next_self_diag_reads(100);
    let mut delay = probe.delay();
    let mut lcd = Ili9341Driver::new(probe.clone());
    let err = lcd.begin(&mut delay).expect_err("init must fail");
    let msg = format!("{err}");
    assert!(msg.contains("self-diagnostic"), "unexpected error: {msg}");
}

#[test]
fn self_diag_reports_the_healthy_value() {
    let (mut lcd, _probe) = bring_up(30_000_000);
    assert_eq!(lcd.self_diag(), Some(driver::SELFDIAG_OK));
}

// ── Scenario 1: full redraw ──────────────────────────────────────────────

#[test]
fn full_redraw_lands_every_pixel() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    let frame = vec![0xFFFFu16; NB_PIXELS];
    assert!(lcd.update(&frame));
    lcd.wait_idle();
    assert!(lcd.mirror_valid());
    assert_eq!(probe.first_mismatch(&frame), None);
    assert_eq!(probe.pixel_words(), NB_PIXELS as u64);
}

#[test]
fn unbuffered_update_blocks_and_paints_the_panel() {
    let (mut lcd, probe) = bring_up(30_000_000);
    let frame: Vec<u16> = (0..NB_PIXELS).map(|i| (i * 13) as u16).collect();
    assert!(lcd.update(&frame));
    assert!(!lcd.is_busy(), "unbuffered update must be synchronous");
    assert_eq!(probe.first_mismatch(&frame), None);
}

// ── Scenario 2: two stripes ──────────────────────────────────────────────

#[test]
fn two_stripes_upload_exactly_the_stripes() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    let base = vec![0x0000u16; NB_PIXELS];
    lcd.update(&base);
    lcd.wait_idle();

    let mut frame = base.clone();
    for y in 10..20 {
        for x in 0..TFT_WIDTH {
            frame[y * TFT_WIDTH + x] = 0xF800;
        }
    }
    for y in 200..210 {
        for x in 0..TFT_WIDTH {
            frame[y * TFT_WIDTH + x] = 0x001F;
        }
    }
    let ramwr_before = probe.ramwr_count();
    let words_before = probe.pixel_words();
    lcd.stats_reset();
    lcd.update(&frame);
    lcd.wait_idle();

    assert_eq!(probe.first_mismatch(&frame), None);
    assert_eq!(probe.pixel_words() - words_before, 20 * 240);
    // adjacent changed rows coalesce into one cross-row run per stripe;
    // the scan race may clip the second stripe once more
    let runs = probe.ramwr_count() - ramwr_before;
    assert!((2..=4).contains(&runs), "{runs} write runs for two stripes");
    assert_eq!(lcd.stats().pixels().max(), 20 * 240);
    assert_eq!(lcd.stats().transactions().max() as u32, runs);
}

// ── Scenario 3: gap coalescing ───────────────────────────────────────────

#[test]
fn near_runs_merge_under_the_gap() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    lcd.set_diff_gap(4);
    let base = vec![0u16; NB_PIXELS];
    lcd.update(&base);
    lcd.wait_idle();

    let mut frame = base.clone();
    for x in 0..10 {
        frame[50 * TFT_WIDTH + x] = 0x07E0;
    }
    for x in 13..21 {
        frame[50 * TFT_WIDTH + x] = 0x07E0;
    }
    let ramwr_before = probe.ramwr_count();
    let words_before = probe.pixel_words();
    lcd.update(&frame);
    lcd.wait_idle();

    assert_eq!(probe.first_mismatch(&frame), None);
    // one merged run of 21 pixels, unchanged gap pixels included
    assert_eq!(probe.ramwr_count() - ramwr_before, 1);
    assert_eq!(probe.pixel_words() - words_before, 21);
}

// ── Scenario 4: rotation 1 ───────────────────────────────────────────────

#[test]
fn landscape_updates_match_the_rotated_readback() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    lcd.set_rotation(1);
    assert_eq!(lcd.width(), 320);

    // full redraw in landscape
    let frame: Vec<u16> = (0..NB_PIXELS).map(|i| (i * 7) as u16).collect();
    lcd.update(&frame);
    lcd.wait_idle();
    let mut canonical = vec![0u16; NB_PIXELS];
    copy_rotated(&mut canonical, &frame, Rotation::Landscape);
    assert_eq!(probe.first_mismatch(&canonical), None);

    // then a small landscape-space change rides the diff path
    let mut next = frame.clone();
    for i in 0..50 {
        next[40 * 320 + 100 + i] = 0xBEEF;
    }
    lcd.update(&next);
    lcd.wait_idle();
    copy_rotated(&mut canonical, &next, Rotation::Landscape);
    assert_eq!(probe.first_mismatch(&canonical), None);
}

#[test]
fn every_rotation_full_redraw_is_canonical_on_the_panel() {
    for r in 0..4u8 {
        let (mut lcd, probe) = bring_up(30_000_000);
        lcd.set_rotation(r);
        let frame: Vec<u16> = (0..NB_PIXELS).map(|i| (i ^ 0x55AA) as u16).collect();
        lcd.update(&frame);
        let mut canonical = vec![0u16; NB_PIXELS];
        copy_rotated(&mut canonical, &frame, Rotation::from_index(r));
        assert_eq!(probe.first_mismatch(&canonical), None, "rotation {r}");
    }
}

// ── Scenario 5: vsync race ───────────────────────────────────────────────

#[test]
fn vsync_spacing_two_holds_cadence_without_tearing() {
    let (mut lcd, _probe) = bring_up_double(80_000_000);
    lcd.set_vsync_spacing(2);
    lcd.stats_reset();

    let mut frame = vec![0u16; NB_PIXELS];
    lcd.update(&frame); // full redraw primes the mirror
    lcd.wait_idle();
    lcd.stats_reset();

    for i in 0..60u16 {
        // one moving row changes per frame
        let row = (i as usize * 5) % 300;
        for x in 0..TFT_WIDTH {
            frame[row * TFT_WIDTH + x] = 0x1000 + i;
        }
        assert!(lcd.update(&frame));
    }
    lcd.wait_idle();

    let spacing = lcd.stats().spacing();
    assert!(spacing.count() >= 50, "only {} spaced frames", spacing.count());
    let mean = spacing.mean();
    assert!(
        (1.9..2.1).contains(&mean),
        "mean vsync spacing {mean:.2}, expected about 2"
    );
    assert!(
        lcd.stats().teared_ratio() <= 0.01,
        "teared ratio {:.3}",
        lcd.stats().teared_ratio()
    );
    assert_eq!(lcd.last_vsync_spacing(), 2);
}

// ── Scenario 6: frame dropping ───────────────────────────────────────────

#[test]
fn minus_one_spacing_drops_frames_while_busy() {
    let (mut lcd, probe) = bring_up_double(1_000_000); // slow bus: uploads linger
    lcd.set_vsync_spacing(-1);

    let frame_a = vec![0xAAAAu16; NB_PIXELS];
    assert!(lcd.update(&frame_a));
    assert!(lcd.is_busy(), "upload should still be in flight");

    let ramwr_before = probe.ramwr_count();
    let frame_b = vec![0xBBBBu16; NB_PIXELS];
    let accepted = lcd.update(&frame_b);
    assert!(!accepted, "frame must be dropped while busy");
    assert_eq!(probe.ramwr_count(), ramwr_before, "drop must not touch the bus");

    lcd.wait_idle();
    assert_eq!(probe.first_mismatch(&frame_a), None, "panel shows the kept frame");
}

// ── Identical frames ─────────────────────────────────────────────────────

#[test]
fn identical_frame_uploads_nothing() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    let frame = vec![0x1234u16; NB_PIXELS];
    lcd.update(&frame);
    lcd.wait_idle();

    let words_before = probe.pixel_words();
    let ramwr_before = probe.ramwr_count();
    assert!(lcd.update(&frame));
    lcd.wait_idle();
    assert_eq!(probe.pixel_words(), words_before);
    assert_eq!(probe.ramwr_count(), ramwr_before);
}

// ── Double buffering with two diffs ──────────────────────────────────────

#[test]
fn overlapped_diff_computation_still_converges() {
    let (mut lcd, probe) = bring_up(4_000_000); // slow enough to overlap
    lcd.set_framebuffers(Some(leak_fb()), None);
    lcd.set_diff_buffers(
        Some(DiffBuffer::new(leak_arena(64 * 1024))),
        Some(DiffBuffer::new(leak_arena(64 * 1024))),
    );
    lcd.set_vsync_spacing(0);

    let frame_a = vec![0x00FFu16; NB_PIXELS];
    lcd.update(&frame_a);
    assert!(lcd.is_busy());

    let mut frame_b = frame_a.clone();
    for i in 0..1000 {
        frame_b[i * 7] = 0xFF00;
    }
    // computes the diff into the back arena while A is still flying
    lcd.update(&frame_b);
    lcd.wait_idle();
    assert_eq!(probe.first_mismatch(&frame_b), None);
}

// ── Triple buffering ─────────────────────────────────────────────────────

#[test]
fn triple_buffering_stages_and_launches_from_completion() {
    let (mut lcd, probe) = bring_up(4_000_000);
    lcd.set_framebuffers(Some(leak_fb()), Some(leak_fb()));
    lcd.set_diff_buffers(
        Some(DiffBuffer::new(leak_arena(64 * 1024))),
        Some(DiffBuffer::new(leak_arena(64 * 1024))),
    );
    lcd.set_vsync_spacing(0);

    let frame_a = vec![0x1111u16; NB_PIXELS];
    lcd.update(&frame_a);
    assert!(lcd.is_busy());

    let frame_b = vec![0x2222u16; NB_PIXELS];
    assert!(lcd.update(&frame_b), "staged into the back framebuffer");

    let frame_c = vec![0x3333u16; NB_PIXELS];
    assert!(lcd.update(&frame_c));

    lcd.wait_idle();
    assert_eq!(probe.first_mismatch(&frame_c), None);
    // both staged updates bracketed their stage-or-launch decisions
    assert!(
        probe.irq_mask_count() >= 4,
        "only {} interrupts-off sections recorded",
        probe.irq_mask_count()
    );
}

// ── Reconfiguration invariants ───────────────────────────────────────────

#[test]
fn rotation_change_forces_a_full_redraw() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    let frame = vec![0x4444u16; NB_PIXELS];
    lcd.update(&frame);
    lcd.wait_idle();
    assert!(lcd.mirror_valid());

    lcd.set_rotation(2);
    assert!(!lcd.mirror_valid());

    let words_before = probe.pixel_words();
    lcd.update(&frame);
    lcd.wait_idle();
    assert_eq!(
        probe.pixel_words() - words_before,
        NB_PIXELS as u64,
        "post-rotation update must repaint everything"
    );
}

#[test]
fn force_full_redraw_repaints_an_identical_frame() {
    let (mut lcd, probe) = bring_up_double(30_000_000);
    let frame = vec![0x9999u16; NB_PIXELS];
    lcd.update(&frame);
    lcd.wait_idle();

    lcd.force_full_redraw();
    let words_before = probe.pixel_words();
    lcd.update(&frame);
    lcd.wait_idle();
    assert_eq!(probe.pixel_words() - words_before, NB_PIXELS as u64);
}

#[test]
fn scroll_offsets_normalize_into_panel_range() {
    let (mut lcd, probe) = bring_up(30_000_000);
    lcd.set_scroll(-40);
    assert_eq!(probe.scroll(), 280);
    lcd.set_scroll(330);
    assert_eq!(probe.scroll(), 10);
}

#[test]
fn binding_fb2_without_diff2_degrades_to_double_buffering() {
    let (mut lcd, _probe) = bring_up(30_000_000);
    lcd.set_framebuffers(Some(leak_fb()), Some(leak_fb()));
    lcd.set_diff_buffers(Some(DiffBuffer::new(leak_arena(8 * 1024))), None);
    assert_eq!(lcd.buffering_mode(), driver::BufferingMode::DoubleOneDiff);
}

#[test]
fn frame_rate_control_reaches_the_panel() {
    let (mut lcd, probe) = bring_up(30_000_000);
    let mut delay = probe.delay();
    lcd.set_refresh_mode(19, &mut delay);
    // mode >= 16 engages the /2 divider and rewrites the rtna field
    assert_eq!(probe.frmctr1(), (1, 0x10 + 3));
    assert_eq!(lcd.refresh_mode(), 19);
}

// ── Touch shim ───────────────────────────────────────────────────────────

#[test]
fn touch_read_defers_until_the_upload_finishes() {
    let (mut lcd, probe) = bring_up_double(1_000_000);
    lcd.set_vsync_spacing(0);
    probe.set_touch_sample(Some(platform::TouchSample {
        z1: 3000,
        z2: 500,
        x: [1000, 1005, 1010],
        y: [2000, 2005, 2010],
    }));

    let frame = vec![0x5A5Au16; NB_PIXELS];
    lcd.update(&frame);
    assert!(lcd.is_busy());
    let (x, y, z) = lcd.read_touch();
    assert!(!lcd.is_busy(), "deferred read waits the upload out");
    assert!(z >= 400, "pressure {z} too low");
    assert!(x > 0 && y > 0);
}
