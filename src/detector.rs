//! Pipeline orchestration.
//!
//! `Detector` wires the stages together: resolution lookup, rectification,
//! crop, grid calibration (with the uniform fallback), whole-board stone
//! scan, marker localization, and move resolution. Every call produces a
//! `Detection` with a `Diagnostics` record describing what each stage did,
//! so failed frames can be replayed offline.

use std::path::{Path, PathBuf};

use anyhow::Context;
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{resolution_key, CropInsets, DetectorConfig};
use crate::error::DetectError;
use crate::geometry::{Coord, Grid, Player, Point};
use crate::marker::{locate_marker, locate_stone_blob, MarkerMatch};
use crate::resolver::{
    apply_cross_check, changed_candidate, expected_last_player, infer_move_number,
    snap_confidence, MoveSource,
};
use crate::stones::{scan_board, BoardSnapshot, Occupancy};
use crate::{grid, rectify};

/// Confidence assigned when only the previous-frame diff identifies the move.
const PREV_DIFF_CONFIDENCE: f32 = 0.5;

/// The result of one detection call.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub move_number: u32,
    pub color: Player,
    pub coord: Coord,
    /// Board notation, e.g. "D16".
    pub coord_text: String,
    /// 0.0 (no usable evidence) to 1.0.
    pub confidence: f32,
    pub diagnostics: Diagnostics,
}

/// Per-stage record of what the pipeline saw. Serialized as pretty JSON for
/// offline inspection of misrecognized frames.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub resolution: String,
    pub corners: [Point; 4],
    pub crop: CropInsets,
    /// "hough" or "uniform-fallback".
    pub grid_source: &'static str,
    pub spacing_x: f32,
    pub spacing_y: f32,
    /// "strict" or "relaxed".
    pub stone_profile: &'static str,
    pub black_count: usize,
    pub white_count: usize,
    pub expected_color: Player,
    pub move_source: MoveSource,
    /// Marker strategy that produced the result, when one did.
    pub strategy: Option<&'static str>,
    /// Glyph bounding box as [x, y, width, height].
    pub marker_bbox: Option<[i32; 4]>,
    pub marker_score: Option<f64>,
    pub snap_distance: Option<f32>,
    /// Whether the classified board agreed with the marker cell.
    pub cross_check: Option<bool>,
    /// "marker", "prev-diff", "marker-rejected" or "marker-not-found".
    pub status: &'static str,
}

impl Diagnostics {
    /// Write this record to `<dir>/<case_id>.json`.
    pub fn dump(&self, dir: &Path, case_id: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create diagnostics directory {:?}", dir))?;
        let path = dir.join(format!("{}.json", case_id));
        let json = serde_json::to_string_pretty(self).context("Failed to serialize diagnostics")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write diagnostics to {:?}", path))?;
        Ok(path)
    }
}

/// The full detection pipeline plus optional retained state for tracked
/// (frame-over-frame) operation.
pub struct Detector {
    config: DetectorConfig,
    tracked: Mutex<Option<BoardSnapshot>>,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            tracked: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect the last move in one capture.
    ///
    /// `hint` is an externally extracted move number (parity fixes the
    /// color); `prev` an optional previous-frame snapshot used to
    /// prioritize changed intersections when the marker path fails. Both
    /// are pure inputs; no state is retained.
    pub fn detect(
        &self,
        img: &RgbImage,
        hint: Option<u32>,
        prev: Option<&BoardSnapshot>,
    ) -> Result<Detection, DetectError> {
        self.run(img, hint, prev).map(|(d, _)| d)
    }

    /// Like `detect`, but keeps the classified board as the previous
    /// snapshot for the next call. One call at a time per instance.
    pub fn detect_tracked(&self, img: &RgbImage, hint: Option<u32>) -> Result<Detection, DetectError> {
        let mut guard = self.tracked.lock();
        let prev = guard.clone();
        let (detection, snapshot) = self.run(img, hint, prev.as_ref())?;
        *guard = Some(snapshot);
        Ok(detection)
    }

    /// Drop any retained previous-frame snapshot.
    pub fn reset_tracking(&self) {
        *self.tracked.lock() = None;
    }

    fn run(
        &self,
        img: &RgbImage,
        hint: Option<u32>,
        prev: Option<&BoardSnapshot>,
    ) -> Result<(Detection, BoardSnapshot), DetectError> {
        let (w, h) = img.dimensions();
        let board = self
            .config
            .board_for(w, h)
            .ok_or_else(|| DetectError::UnsupportedResolution(resolution_key(w, h)))?;

        let warped = rectify::rectify(img, &board.quad());
        let warped = rectify::crop(&warped, &board.crop);

        let (grid, grid_source) = match grid::calibrate(&warped) {
            Ok(g) => (g, "hough"),
            Err(e) => {
                warn!(error = %e, "grid calibration failed, using uniform fallback");
                // Crop insets are per-side, so the rectified image may no
                // longer be square; span each axis with its own dimension.
                let fallback = Grid::uniform_rect(
                    (warped.width() - 1) as f32,
                    (warped.height() - 1) as f32,
                );
                (fallback, "uniform-fallback")
            }
        };

        let (snapshot, stone_profile) = scan_board(&warped, &grid, &self.config.stones);
        let (black_count, white_count) = snapshot.counts();
        let expected = expected_last_player(hint, black_count, white_count);
        let (move_number, move_source) = infer_move_number(hint, black_count, white_count);
        debug!(
            black = black_count,
            white = white_count,
            expected = expected.as_str(),
            move_number,
            "board state scanned"
        );

        let mut diag = Diagnostics {
            resolution: resolution_key(w, h),
            corners: *board.quad().corners(),
            crop: board.crop,
            grid_source,
            spacing_x: grid.spacing_x(),
            spacing_y: grid.spacing_y(),
            stone_profile,
            black_count,
            white_count,
            expected_color: expected,
            move_source,
            strategy: None,
            marker_bbox: None,
            marker_score: None,
            snap_distance: None,
            cross_check: None,
            status: "marker-not-found",
        };

        let expected_occ = Occupancy::of(expected);
        let mut accepted: Option<(Coord, f32)> = None;
        match locate_marker(&warped, expected, &grid, &self.config.marker) {
            Ok(m) => {
                let primary = m.strategy;
                accepted = evaluate_match(m, &grid, &snapshot, expected_occ, &mut diag);
                if accepted.is_none() && primary != "stone-blob" {
                    // A glyph was found but sat on the wrong color; resume
                    // the chain at its last rung before giving up.
                    if let Some(blob) =
                        locate_stone_blob(&warped, expected, &grid, &self.config.marker)
                    {
                        accepted = evaluate_match(blob, &grid, &snapshot, expected_occ, &mut diag);
                    }
                }
            }
            Err(e) => debug!(error = %e, "marker chain exhausted"),
        }

        if let Some((coord, confidence)) = accepted {
            info!(
                coord = %coord,
                color = expected.as_str(),
                confidence,
                "move detected"
            );
            let detection = Detection {
                move_number,
                color: expected,
                coord,
                coord_text: coord.text(),
                confidence,
                diagnostics: diag,
            };
            return Ok((detection, snapshot));
        }

        // Marker path failed; a previous-frame diff can still name the move.
        if let Some(prev) = prev {
            if let Some(coord) = changed_candidate(&snapshot, prev, expected) {
                diag.status = "prev-diff";
                info!(coord = %coord, "move recovered from previous-frame diff");
                let detection = Detection {
                    move_number,
                    color: expected,
                    coord,
                    coord_text: coord.text(),
                    confidence: PREV_DIFF_CONFIDENCE,
                    diagnostics: diag,
                };
                return Ok((detection, snapshot));
            }
        }

        // Best effort exhausted: report a zero-confidence result rather than
        // an error so batch callers can keep going.
        let coord = Coord { col: 0, row: 0 };
        let detection = Detection {
            move_number,
            color: expected,
            coord,
            coord_text: coord.text(),
            confidence: 0.0,
            diagnostics: diag,
        };
        Ok((detection, snapshot))
    }
}

/// Snap a marker match and validate it against the classified board,
/// recording the attempt in the diagnostics either way.
///
/// A snapped cell holding the opposite color discards the match; an Empty
/// cell is tolerated (classification may have missed the stone) but earns
/// no cross-check bonus.
fn evaluate_match(
    m: MarkerMatch,
    grid: &Grid,
    snapshot: &BoardSnapshot,
    expected_occ: Occupancy,
    diag: &mut Diagnostics,
) -> Option<(Coord, f32)> {
    let MarkerMatch {
        marker,
        strategy,
        confidence_factor,
    } = m;
    let (coord, dist, base) = snap_confidence(grid, marker.center.0, marker.center.1);

    diag.strategy = Some(strategy);
    diag.marker_bbox = Some([
        marker.bounds.left(),
        marker.bounds.top(),
        marker.bounds.width() as i32,
        marker.bounds.height() as i32,
    ]);
    diag.marker_score = Some(marker.score);
    diag.snap_distance = Some(dist);

    let occupancy = snapshot.get(coord);
    if occupancy != Occupancy::Empty && occupancy != expected_occ {
        warn!(
            coord = %coord,
            found = ?occupancy,
            strategy,
            "marker cell holds the wrong color, discarding match"
        );
        diag.cross_check = Some(false);
        diag.status = "marker-rejected";
        return None;
    }

    let agrees = occupancy == expected_occ;
    diag.cross_check = Some(agrees);
    diag.status = "marker";
    Some((coord, apply_cross_check(base * confidence_factor, agrees)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardCalibration;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut};
    use imageproc::rect::Rect;

    const SPACING: f32 = 52.0;
    const MARGIN: f32 = 40.0;

    fn test_config() -> DetectorConfig {
        let mut cfg = DetectorConfig::default();
        cfg.boards.insert(
            "1024x1024".to_string(),
            BoardCalibration {
                corners: [
                    Point::new(0.0, 0.0),
                    Point::new(1023.0, 0.0),
                    Point::new(1023.0, 1023.0),
                    Point::new(0.0, 1023.0),
                ],
                crop: CropInsets::default(),
            },
        );
        cfg
    }

    fn line_pos(i: u8) -> f32 {
        MARGIN + i as f32 * SPACING
    }

    fn stone_color(player: Player) -> image::Rgb<u8> {
        match player {
            Player::Black => image::Rgb([40, 40, 40]),
            Player::White => image::Rgb([235, 235, 235]),
        }
    }

    /// A clean rectified-style board: warm wood, full grid, optional stones
    /// and a last-move glyph at the stone's upper-left.
    fn synthetic_board(
        stones: &[(Coord, image::Rgb<u8>)],
        glyph: Option<(Coord, image::Rgb<u8>)>,
    ) -> RgbImage {
        let mut img = RgbImage::from_pixel(1024, 1024, image::Rgb([222, 184, 120]));
        let ink = image::Rgb([30, 20, 10]);
        let lo = line_pos(0);
        let hi = line_pos(18);
        for i in 0..19u8 {
            let p = line_pos(i);
            draw_line_segment_mut(&mut img, (p, lo), (p, hi), ink);
            draw_line_segment_mut(&mut img, (lo, p), (hi, p), ink);
        }
        for &(coord, color) in stones {
            let (x, y) = (line_pos(coord.col), line_pos(coord.row));
            draw_filled_circle_mut(&mut img, (x as i32, y as i32), 20, color);
        }
        if let Some((coord, color)) = glyph {
            let (x, y) = (line_pos(coord.col), line_pos(coord.row));
            // Glyph center at the stone's upper-left shoulder.
            let gx = x - 20.0;
            let gy = y - 22.0;
            draw_filled_rect_mut(
                &mut img,
                Rect::at(gx as i32 - 6, gy as i32 - 6).of_size(12, 12),
                color,
            );
        }
        img
    }

    const RED: image::Rgb<u8> = image::Rgb([235, 20, 20]);
    const BLUE: image::Rgb<u8> = image::Rgb([30, 60, 235]);

    #[test]
    fn test_detects_marked_black_move() {
        let target = Coord::new(3, 15).unwrap();
        let stones = [
            (target, stone_color(Player::Black)),
            (Coord::new(16, 3).unwrap(), stone_color(Player::White)),
            (Coord::new(9, 9).unwrap(), stone_color(Player::Black)),
        ];
        let img = synthetic_board(&stones, Some((target, RED)));

        let detector = Detector::new(test_config());
        let detection = detector.detect(&img, Some(7), None).expect("detection");

        assert_eq!(detection.coord, target);
        assert_eq!(detection.color, Player::Black);
        assert_eq!(detection.move_number, 7);
        assert!(
            detection.confidence > 0.7,
            "confidence {}",
            detection.confidence
        );
        assert_eq!(detection.diagnostics.status, "marker");
        assert_eq!(detection.diagnostics.strategy, Some("hsv"));
    }

    #[test]
    fn test_wrong_hue_marker_is_rejected() {
        // A blue glyph on a black stone with an even-move hint: the blue
        // search matches, but the cell holds the wrong color.
        let target = Coord::new(10, 4).unwrap();
        let img = synthetic_board(&[(target, stone_color(Player::Black))], Some((target, BLUE)));

        let detector = Detector::new(test_config());
        let detection = detector.detect(&img, Some(8), None).expect("detection");

        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.diagnostics.status, "marker-rejected");
    }

    #[test]
    fn test_unregistered_resolution_fails_fast() {
        let img = RgbImage::new(640, 480);
        let detector = Detector::new(test_config());
        match detector.detect(&img, None, None) {
            Err(DetectError::UnsupportedResolution(key)) => assert_eq!(key, "640x480"),
            other => panic!("expected UnsupportedResolution, got {:?}", other.map(|d| d.coord)),
        }
    }

    #[test]
    fn test_stone_probe_resumes_after_rejected_glyph() {
        let black_at = Coord::new(2, 2).unwrap();
        let white_at = Coord::new(12, 12).unwrap();
        // Blue glyph sits on the black stone, so the glyph match is
        // discarded; the chain resumes with the expected-color stone probe
        // and lands on the white stone.
        let img = synthetic_board(
            &[
                (black_at, stone_color(Player::Black)),
                (white_at, stone_color(Player::White)),
            ],
            Some((black_at, BLUE)),
        );

        let detector = Detector::new(test_config());
        let detection = detector.detect(&img, Some(8), None).expect("detection");

        assert_eq!(detection.coord, white_at);
        assert_eq!(detection.color, Player::White);
        assert_eq!(detection.diagnostics.status, "marker");
        assert_eq!(detection.diagnostics.strategy, Some("stone-blob"));
        assert!(detection.confidence > 0.0 && detection.confidence < 1.0);
    }

    #[test]
    fn test_prev_diff_recovers_rejected_marker() {
        // Stones dim enough that only the relaxed classifier sees them, so
        // the stone probe cannot rescue the discarded glyph match and the
        // previous-frame diff names the new black stone.
        let white_at = Coord::new(12, 12).unwrap();
        let black_at = Coord::new(2, 2).unwrap();
        let img = synthetic_board(
            &[
                (white_at, image::Rgb([160, 160, 160])),
                (black_at, image::Rgb([110, 110, 110])),
            ],
            Some((white_at, RED)),
        );

        let mut prev = BoardSnapshot::empty();
        prev.set(white_at, Occupancy::White);

        let detector = Detector::new(test_config());
        let detection = detector.detect(&img, Some(3), Some(&prev)).expect("detection");

        assert_eq!(detection.coord, black_at);
        assert_eq!(detection.color, Player::Black);
        assert_eq!(detection.diagnostics.status, "prev-diff");
        assert!((detection.confidence - PREV_DIFF_CONFIDENCE).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_fallback_spans_cropped_rect() {
        let mut cfg = test_config();
        if let Some(board) = cfg.boards.get_mut("1024x1024") {
            board.crop.left = 0.4;
        }
        // A featureless frame forces the uniform fallback grid; with the
        // asymmetric crop the rectified image is 615 wide but still 1024
        // tall, and each axis must span its own dimension.
        let img = RgbImage::from_pixel(1024, 1024, image::Rgb([222, 184, 120]));

        let detector = Detector::new(cfg);
        let detection = detector.detect(&img, None, None).expect("detection");
        let diag = &detection.diagnostics;
        assert_eq!(diag.grid_source, "uniform-fallback");
        assert!(
            (diag.spacing_y - 1023.0 / 18.0).abs() < 0.6,
            "spacing_y {}",
            diag.spacing_y
        );
        assert!(diag.spacing_x < 36.0, "spacing_x {}", diag.spacing_x);
        assert_eq!(detection.confidence, 0.0);
    }

    #[test]
    fn test_tracked_mode_retains_snapshot() {
        let first = Coord::new(3, 3).unwrap();
        let second = Coord::new(15, 15).unwrap();
        let detector = Detector::new(test_config());

        let frame1 = synthetic_board(&[(first, stone_color(Player::Black))], Some((first, RED)));
        let d1 = detector.detect_tracked(&frame1, Some(1)).expect("frame 1");
        assert_eq!(d1.coord, first);

        let frame2 = synthetic_board(
            &[
                (first, stone_color(Player::Black)),
                (second, stone_color(Player::White)),
            ],
            Some((second, BLUE)),
        );
        let d2 = detector.detect_tracked(&frame2, Some(2)).expect("frame 2");
        assert_eq!(d2.coord, second);
        assert_eq!(d2.color, Player::White);
    }

    #[test]
    fn test_diagnostics_serialize() {
        let target = Coord::new(9, 9).unwrap();
        let img = synthetic_board(&[(target, stone_color(Player::Black))], Some((target, RED)));
        let detector = Detector::new(test_config());
        let detection = detector.detect(&img, Some(3), None).expect("detection");

        let json = serde_json::to_string_pretty(&detection.diagnostics).unwrap();
        assert!(json.contains("\"resolution\": \"1024x1024\""));
        assert!(json.contains("\"status\": \"marker\""));
    }
}
