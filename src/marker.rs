//! Last-move marker localization.
//!
//! The client app draws a small colored glyph at the upper-left of the most
//! recently placed stone: red on a black stone, blue on a white one. The
//! locator segments the expected hue, cleans the mask up, and scores the
//! resulting contours for compactness. Three strategies run in order of
//! reliability; the first hit wins.

use image::{GrayImage, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::threshold;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::close;
use imageproc::rect::Rect;
use tracing::debug;

use crate::config::MarkerParams;
use crate::error::DetectError;
use crate::geometry::{Grid, Player, BOARD_LINES};
use crate::stones::mean_patch;

/// A located marker glyph and the stone-center estimate derived from it.
#[derive(Debug, Clone)]
pub struct Marker {
    /// Bounding box of the glyph (or probe patch) in rectified pixels.
    pub bounds: Rect,
    /// Center of the glyph itself.
    pub glyph_center: (f32, f32),
    /// Estimated stone center: the glyph sits at the stone's upper-left, so
    /// this is the glyph center shifted toward the lower-right.
    pub center: (f32, f32),
    pub score: f64,
}

/// A marker plus which strategy produced it.
#[derive(Debug, Clone)]
pub struct MarkerMatch {
    pub marker: Marker,
    pub strategy: &'static str,
    /// Reliability multiplier folded into the final confidence.
    pub confidence_factor: f32,
}

/// One way of finding the marker. Strategies are tried in declaration order.
trait MarkerStrategy {
    fn name(&self) -> &'static str;
    fn confidence_factor(&self) -> f32;
    fn locate(
        &self,
        img: &RgbImage,
        player: Player,
        grid: &Grid,
        params: &MarkerParams,
    ) -> Option<Marker>;
}

/// Run the strategy chain for the expected player's marker hue.
pub fn locate_marker(
    img: &RgbImage,
    player: Player,
    grid: &Grid,
    params: &MarkerParams,
) -> Result<MarkerMatch, DetectError> {
    let strategies: [&dyn MarkerStrategy; 3] = [&HsvStrategy, &RgbStrategy, &StoneBlobStrategy];
    for strategy in strategies {
        if let Some(marker) = strategy.locate(img, player, grid, params) {
            debug!(
                strategy = strategy.name(),
                score = marker.score,
                x = marker.center.0,
                y = marker.center.1,
                "marker located"
            );
            return Ok(MarkerMatch {
                marker,
                strategy: strategy.name(),
                confidence_factor: strategy.confidence_factor(),
            });
        }
    }
    Err(DetectError::MarkerNotFound(strategies.len()))
}

/// Run only the stone-blob probe, for callers that discarded an earlier
/// glyph match and want to resume the chain at its last rung.
pub fn locate_stone_blob(
    img: &RgbImage,
    player: Player,
    grid: &Grid,
    params: &MarkerParams,
) -> Option<MarkerMatch> {
    StoneBlobStrategy
        .locate(img, player, grid, params)
        .map(|marker| MarkerMatch {
            marker,
            strategy: StoneBlobStrategy.name(),
            confidence_factor: StoneBlobStrategy.confidence_factor(),
        })
}

/// Convert an RGB pixel to HSV with hue on the half-degree 0..=180 scale.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let rf = r as f32 / 255.0;
    let gf = g as f32 / 255.0;
    let bf = b as f32 / 255.0;
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * ((gf - bf) / delta)
    } else if max == gf {
        60.0 * ((bf - rf) / delta) + 120.0
    } else {
        60.0 * ((rf - gf) / delta) + 240.0
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };

    let s = if max == 0.0 { 0.0 } else { delta / max };
    ((hue / 2.0).round() as u8, (s * 255.0).round() as u8, (max * 255.0).round() as u8)
}

/// Primary strategy: strict HSV segmentation of the expected hue, scored by
/// area, aspect and circularity.
struct HsvStrategy;

impl MarkerStrategy for HsvStrategy {
    fn name(&self) -> &'static str {
        "hsv"
    }

    fn confidence_factor(&self) -> f32 {
        1.0
    }

    fn locate(
        &self,
        img: &RgbImage,
        player: Player,
        grid: &Grid,
        params: &MarkerParams,
    ) -> Option<Marker> {
        let mask = hsv_mask(img, player, params);
        let mask = clean_mask(mask, params);
        best_contour(&mask, params, true).map(|c| c.into_marker(grid, params))
    }
}

/// Fallback: loose raw-RGB box segmentation, for washed-out or compressed
/// frames where saturation drops out of the strict HSV bands.
struct RgbStrategy;

impl MarkerStrategy for RgbStrategy {
    fn name(&self) -> &'static str {
        "rgb-loose"
    }

    fn confidence_factor(&self) -> f32 {
        0.9
    }

    fn locate(
        &self,
        img: &RgbImage,
        player: Player,
        grid: &Grid,
        params: &MarkerParams,
    ) -> Option<Marker> {
        let range = match player {
            Player::Black => params.red_rgb,
            Player::White => params.blue_rgb,
        };
        let mut mask = GrayImage::new(img.width(), img.height());
        for (x, y, p) in img.enumerate_pixels() {
            if range.contains(p.0) {
                mask.put_pixel(x, y, image::Luma([255u8]));
            }
        }
        let mask = clean_mask(mask, params);
        best_contour(&mask, params, false).map(|c| c.into_marker(grid, params))
    }
}

/// Last resort when no glyph is visible at all: probe every intersection
/// for the most salient stone of the expected color. The probe center is
/// already a stone center, so no glyph offset is applied.
struct StoneBlobStrategy;

impl MarkerStrategy for StoneBlobStrategy {
    fn name(&self) -> &'static str {
        "stone-blob"
    }

    fn confidence_factor(&self) -> f32 {
        0.5
    }

    fn locate(
        &self,
        img: &RgbImage,
        player: Player,
        grid: &Grid,
        _params: &MarkerParams,
    ) -> Option<Marker> {
        let half = crate::stones::patch_half(grid);
        let mut best: Option<Marker> = None;

        for row in 0..BOARD_LINES {
            for col in 0..BOARD_LINES {
                let x = grid.xs()[col];
                let y = grid.ys()[row];
                let mean = mean_patch(img, x, y, half);
                let brightness = (mean[0] + mean[1] + mean[2]) / 3.0;
                let chroma = mean.iter().fold(f64::MIN, |a, &v| a.max(v))
                    - mean.iter().fold(f64::MAX, |a, &v| a.min(v));
                if chroma > 80.0 {
                    continue;
                }
                let salience = match player {
                    Player::Black if brightness < 100.0 => 255.0 - brightness,
                    Player::White if brightness > 170.0 => brightness,
                    _ => continue,
                };
                if best.as_ref().map_or(true, |b| salience > b.score) {
                    let side = half * 2 + 1;
                    best = Some(Marker {
                        bounds: Rect::at(x as i32 - half as i32, y as i32 - half as i32)
                            .of_size(side, side),
                        glyph_center: (x, y),
                        center: (x, y),
                        score: salience,
                    });
                }
            }
        }
        best
    }
}

fn hsv_mask(img: &RgbImage, player: Player, params: &MarkerParams) -> GrayImage {
    let mut mask = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let (h, s, v) = rgb_to_hsv(p.0[0], p.0[1], p.0[2]);
        let hit = match player {
            Player::Black => params.red_hsv.iter().any(|r| r.contains(h, s, v)),
            Player::White => params.blue_hsv.contains(h, s, v),
        };
        if hit {
            mask.put_pixel(x, y, image::Luma([255u8]));
        }
    }
    mask
}

/// Smooth and re-binarize the mask, then close small holes.
fn clean_mask(mask: GrayImage, params: &MarkerParams) -> GrayImage {
    let binary = if params.blur_sigma > 0.0 {
        threshold(&gaussian_blur_f32(&mask, params.blur_sigma), 63)
    } else {
        mask
    };
    close(&binary, Norm::LInf, params.morph_radius)
}

/// A filtered, scored contour candidate.
struct Candidate {
    bounds: Rect,
    score: f64,
}

impl Candidate {
    fn into_marker(self, grid: &Grid, params: &MarkerParams) -> Marker {
        let gx = self.bounds.left() as f32 + self.bounds.width() as f32 / 2.0;
        let gy = self.bounds.top() as f32 + self.bounds.height() as f32 / 2.0;
        let dx = params.stone_offset_ratio * grid.spacing_x();
        let dy = params.stone_offset_ratio * grid.spacing_y();
        Marker {
            bounds: self.bounds,
            glyph_center: (gx, gy),
            center: (gx + dx, gy + dy),
            score: self.score,
        }
    }
}

/// Extract outer contours, filter by area and aspect, and keep the best
/// scorer. `use_circularity` selects the strict scoring used for the HSV
/// pass; the loose RGB pass scores on area and aspect alone.
fn best_contour(mask: &GrayImage, params: &MarkerParams, use_circularity: bool) -> Option<Candidate> {
    let contours = find_contours::<i32>(mask);
    let mut best: Option<Candidate> = None;

    for contour in &contours {
        if contour.border_type != BorderType::Outer || contour.points.is_empty() {
            continue;
        }
        let (bounds, area, perimeter) = contour_shape(contour);
        if area < params.min_area || area > params.max_area {
            continue;
        }
        let (w, h) = (bounds.width() as f64, bounds.height() as f64);
        let aspect = w.max(h) / w.min(h).max(1.0);
        if aspect > params.max_aspect {
            continue;
        }

        let mut score = area * (params.max_aspect - aspect);
        if use_circularity {
            let circularity = if perimeter > 0.0 {
                4.0 * std::f64::consts::PI * area / (perimeter * perimeter)
            } else {
                0.0
            };
            score *= circularity + 0.5;
        }

        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Candidate { bounds, score });
        }
    }
    best
}

/// Bounding box, shoelace area and perimeter of a closed contour.
fn contour_shape(contour: &Contour<i32>) -> (Rect, f64, f64) {
    let pts = &contour.points;
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    let mut area2 = 0.0f64;
    let mut perimeter = 0.0f64;

    for i in 0..pts.len() {
        let p = pts[i];
        let q = pts[(i + 1) % pts.len()];
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
        area2 += (p.x as f64) * (q.y as f64) - (q.x as f64) * (p.y as f64);
        perimeter += (((q.x - p.x).pow(2) + (q.y - p.y).pow(2)) as f64).sqrt();
    }

    let bounds = Rect::at(min_x, min_y)
        .of_size((max_x - min_x + 1) as u32, (max_y - min_y + 1) as u32);
    (bounds, area2.abs() / 2.0, perimeter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};

    fn board_bg() -> RgbImage {
        RgbImage::from_pixel(1024, 1024, image::Rgb([222, 184, 120]))
    }

    #[test]
    fn test_rgb_to_hsv_primaries() {
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        assert_eq!(rgb_to_hsv(0, 255, 0), (60, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 255), (120, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 0).1, 0);
    }

    #[test]
    fn test_rgb_to_hsv_red_wraps_high() {
        // Slightly magenta red lands in the high hue band.
        let (h, s, v) = rgb_to_hsv(200, 30, 40);
        assert!(h >= 160, "hue {}", h);
        assert!(s > 150 && v > 150);
    }

    #[test]
    fn test_hsv_strategy_finds_red_glyph_for_black() {
        let mut img = board_bg();
        let grid = Grid::uniform(1023.0);
        draw_filled_rect_mut(
            &mut img,
            Rect::at(300, 300).of_size(14, 14),
            image::Rgb([235, 20, 20]),
        );

        let params = MarkerParams::default();
        let found = HsvStrategy
            .locate(&img, Player::Black, &grid, &params)
            .expect("red glyph");
        assert!((found.glyph_center.0 - 307.0).abs() < 3.0);
        assert!((found.glyph_center.1 - 307.0).abs() < 3.0);
        // The stone-center estimate sits lower-right of the glyph.
        assert!(found.center.0 > found.glyph_center.0);
        assert!(found.center.1 > found.glyph_center.1);

        // Blue search must not match a red glyph.
        assert!(HsvStrategy.locate(&img, Player::White, &grid, &params).is_none());
    }

    #[test]
    fn test_rgb_fallback_catches_desaturated_glyph() {
        let mut img = board_bg();
        let grid = Grid::uniform(1023.0);
        // Too desaturated for the strict HSV band.
        draw_filled_rect_mut(
            &mut img,
            Rect::at(500, 400).of_size(12, 12),
            image::Rgb([180, 90, 90]),
        );

        let params = MarkerParams::default();
        assert!(HsvStrategy.locate(&img, Player::Black, &grid, &params).is_none());
        let matched = locate_marker(&img, Player::Black, &grid, &params).expect("fallback");
        assert_eq!(matched.strategy, "rgb-loose");
        assert!(matched.confidence_factor < 1.0);
    }

    #[test]
    fn test_stone_blob_last_resort() {
        let mut img = board_bg();
        let grid = Grid::uniform(1023.0);
        let at = crate::geometry::Coord::new(5, 5).unwrap();
        let (x, y) = grid.point(at);
        draw_filled_circle_mut(&mut img, (x as i32, y as i32), 20, image::Rgb([40, 40, 40]));

        let params = MarkerParams::default();
        let matched = locate_marker(&img, Player::Black, &grid, &params).expect("stone blob");
        assert_eq!(matched.strategy, "stone-blob");
        assert!((matched.marker.center.0 - x).abs() < 1.0);
        assert!((matched.marker.center.1 - y).abs() < 1.0);
    }

    #[test]
    fn test_empty_board_exhausts_strategies() {
        let img = board_bg();
        let grid = Grid::uniform(1023.0);
        let err = locate_marker(&img, Player::White, &grid, &MarkerParams::default());
        assert!(matches!(err, Err(DetectError::MarkerNotFound(3))));
    }
}
