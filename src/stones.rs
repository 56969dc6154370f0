//! Stone classification over the rectified board.
//!
//! Each intersection is judged from a small square patch centered on it,
//! about a third of a cell wide. The mean patch color is tested against the
//! warm wood background first, then a chroma ceiling (stones are
//! achromatic), then brightness bands. Anything ambiguous stays Empty.

use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{StoneParams, StoneProfile};
use crate::geometry::{Coord, Grid, Player, BOARD_LINES};

/// What occupies one intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Occupancy {
    Empty,
    Black,
    White,
}

impl Occupancy {
    pub fn player(&self) -> Option<Player> {
        match self {
            Occupancy::Empty => None,
            Occupancy::Black => Some(Player::Black),
            Occupancy::White => Some(Player::White),
        }
    }

    pub fn of(player: Player) -> Self {
        match player {
            Player::Black => Occupancy::Black,
            Player::White => Occupancy::White,
        }
    }
}

/// A full-board classification, indexed `[row][col]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot(pub [[Occupancy; BOARD_LINES]; BOARD_LINES]);

impl BoardSnapshot {
    pub fn empty() -> Self {
        Self([[Occupancy::Empty; BOARD_LINES]; BOARD_LINES])
    }

    pub fn get(&self, coord: Coord) -> Occupancy {
        self.0[coord.row as usize][coord.col as usize]
    }

    pub fn set(&mut self, coord: Coord, occ: Occupancy) {
        self.0[coord.row as usize][coord.col as usize] = occ;
    }

    /// Stone totals as (black, white).
    pub fn counts(&self) -> (usize, usize) {
        let mut black = 0;
        let mut white = 0;
        for row in &self.0 {
            for occ in row {
                match occ {
                    Occupancy::Black => black += 1,
                    Occupancy::White => white += 1,
                    Occupancy::Empty => {}
                }
            }
        }
        (black, white)
    }

    /// Intersections whose occupancy differs from `other`, row-major order.
    pub fn diff(&self, other: &BoardSnapshot) -> Vec<Coord> {
        let mut changed = Vec::new();
        for row in 0..BOARD_LINES {
            for col in 0..BOARD_LINES {
                if self.0[row][col] != other.0[row][col] {
                    // Indices are in range by construction.
                    if let Some(c) = Coord::new(col as u8, row as u8) {
                        changed.push(c);
                    }
                }
            }
        }
        changed
    }
}

/// Mean RGB over a `(2*half+1)` square patch, clamped to the image bounds.
pub fn mean_patch(img: &RgbImage, cx: f32, cy: f32, half: u32) -> [f64; 3] {
    let (w, h) = img.dimensions();
    let x0 = (cx as i64 - half as i64).clamp(0, w as i64 - 1) as u32;
    let y0 = (cy as i64 - half as i64).clamp(0, h as i64 - 1) as u32;
    let x1 = (cx as i64 + half as i64).clamp(0, w as i64 - 1) as u32;
    let y1 = (cy as i64 + half as i64).clamp(0, h as i64 - 1) as u32;

    let mut sum = [0.0f64; 3];
    let mut n = 0.0f64;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let p = img.get_pixel(x, y).0;
            for c in 0..3 {
                sum[c] += p[c] as f64;
            }
            n += 1.0;
        }
    }
    [sum[0] / n, sum[1] / n, sum[2] / n]
}

/// Classify one mean patch color against a threshold profile.
pub fn classify_mean(mean: [f64; 3], profile: &StoneProfile) -> Occupancy {
    let [r, g, b] = mean;

    // Warm board wood: red and green both well above blue.
    if r >= profile.bg_min_red
        && r - b >= profile.bg_red_over_blue
        && g - b >= profile.bg_green_over_blue
    {
        return Occupancy::Empty;
    }

    let chroma = mean.iter().fold(f64::MIN, |a, &v| a.max(v))
        - mean.iter().fold(f64::MAX, |a, &v| a.min(v));
    if chroma > profile.chroma_max {
        return Occupancy::Empty;
    }

    let brightness = (r + g + b) / 3.0;
    if brightness < profile.dark_max {
        Occupancy::Black
    } else if brightness > profile.light_min {
        Occupancy::White
    } else {
        Occupancy::Empty
    }
}

/// Patch half-width for a grid: about a third of a cell, never below one.
pub fn patch_half(grid: &Grid) -> u32 {
    ((grid.min_spacing() / 6.0).round() as u32).max(1)
}

/// Classify all 361 intersections with one profile. Rows run in parallel.
pub fn classify_board(img: &RgbImage, grid: &Grid, profile: &StoneProfile) -> BoardSnapshot {
    let half = patch_half(grid);
    let rows: Vec<[Occupancy; BOARD_LINES]> = (0..BOARD_LINES)
        .into_par_iter()
        .map(|row| {
            let mut out = [Occupancy::Empty; BOARD_LINES];
            for col in 0..BOARD_LINES {
                let x = grid.xs()[col];
                let y = grid.ys()[row];
                out[col] = classify_mean(mean_patch(img, x, y, half), profile);
            }
            out
        })
        .collect();

    let mut snapshot = BoardSnapshot::empty();
    for (row, cells) in rows.into_iter().enumerate() {
        snapshot.0[row] = cells;
    }
    snapshot
}

/// Classify the board with the strict profile, falling back to the relaxed
/// one when the strict pass sees no stones at all. Returns the snapshot and
/// the profile name actually used.
pub fn scan_board(
    img: &RgbImage,
    grid: &Grid,
    params: &StoneParams,
) -> (BoardSnapshot, &'static str) {
    let strict = classify_board(img, grid, &params.strict);
    let (black, white) = strict.counts();
    if black + white > 0 {
        debug!(black, white, profile = "strict", "board scanned");
        return (strict, "strict");
    }

    let relaxed = classify_board(img, grid, &params.relaxed);
    let (black, white) = relaxed.counts();
    debug!(black, white, profile = "relaxed", "board scanned");
    (relaxed, "relaxed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_filled_circle_mut;

    #[test]
    fn test_classify_mean_color_symmetry() {
        let strict = StoneProfile::strict();
        assert_eq!(classify_mean([40.0, 40.0, 40.0], &strict), Occupancy::Black);
        assert_eq!(
            classify_mean([220.0, 220.0, 220.0], &strict),
            Occupancy::White
        );
        assert_eq!(
            classify_mean([222.0, 184.0, 120.0], &strict),
            Occupancy::Empty
        );
    }

    #[test]
    fn test_classify_mean_chroma_ceiling() {
        let strict = StoneProfile::strict();
        // Dark but strongly colored, e.g. a red marker glyph.
        assert_eq!(classify_mean([90.0, 10.0, 10.0], &strict), Occupancy::Empty);
    }

    #[test]
    fn test_classify_mean_midtones_stay_empty() {
        let strict = StoneProfile::strict();
        assert_eq!(
            classify_mean([130.0, 130.0, 130.0], &strict),
            Occupancy::Empty
        );
    }

    #[test]
    fn test_classify_board_synthetic() {
        let mut img = RgbImage::from_pixel(1024, 1024, image::Rgb([222, 184, 120]));
        let grid = Grid::uniform(1023.0);
        let black_at = Coord::new(3, 15).unwrap();
        let white_at = Coord::new(10, 10).unwrap();
        let (bx, by) = grid.point(black_at);
        let (wx, wy) = grid.point(white_at);
        draw_filled_circle_mut(&mut img, (bx as i32, by as i32), 20, image::Rgb([40, 40, 40]));
        draw_filled_circle_mut(
            &mut img,
            (wx as i32, wy as i32),
            20,
            image::Rgb([230, 230, 230]),
        );

        let (snap, profile) = scan_board(&img, &grid, &StoneParams::default());
        assert_eq!(profile, "strict");
        assert_eq!(snap.get(black_at), Occupancy::Black);
        assert_eq!(snap.get(white_at), Occupancy::White);
        assert_eq!(snap.get(Coord::new(0, 0).unwrap()), Occupancy::Empty);
        assert_eq!(snap.counts(), (1, 1));
    }

    #[test]
    fn test_snapshot_diff() {
        let mut a = BoardSnapshot::empty();
        let b = a.clone();
        let c1 = Coord::new(2, 3).unwrap();
        let c2 = Coord::new(18, 0).unwrap();
        a.set(c1, Occupancy::Black);
        a.set(c2, Occupancy::White);
        let changed = a.diff(&b);
        assert_eq!(changed.len(), 2);
        assert!(changed.contains(&c1));
        assert!(changed.contains(&c2));
        assert!(a.diff(&a).is_empty());
    }
}
