//! Board geometry: the pure coordinate math every other stage builds on.
//!
//! Coordinate convention, fixed once and used everywhere: grid index (0, 0)
//! is the top-left intersection. Columns map to the letters `A`..=`S` with
//! `I` *included* (19 letters, none skipped); rows are numbered 1..=19 from
//! top to bottom. So (0, 0) formats as "A1" and (18, 18) as "S19".

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DetectError;

/// Number of lines per axis on the board.
pub const BOARD_LINES: usize = 19;

/// Edge length of the rectified square image, in pixels.
pub const WARP_SIZE: u32 = 1024;

const COLUMN_LETTERS: &[u8; 19] = b"ABCDEFGHIJKLMNOPQRS";

/// A 2D point in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// The board's boundary in the source image.
///
/// Corner order: top-left, top-right, bottom-right, bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad(pub [Point; 4]);

impl Quad {
    /// Build a quadrilateral from a point slice.
    ///
    /// The only validation performed anywhere on corner input: anything
    /// other than exactly four points is `InvalidGeometry`. A malformed but
    /// four-cornered quad is accepted and simply warps to a distorted image.
    pub fn from_points(points: &[Point]) -> Result<Self, DetectError> {
        match points {
            [a, b, c, d] => Ok(Self([*a, *b, *c, *d])),
            other => Err(DetectError::InvalidGeometry(other.len())),
        }
    }

    pub fn corners(&self) -> &[Point; 4] {
        &self.0
    }
}

/// Which side placed the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Player {
    Black,
    White,
}

impl Player {
    /// Move parity fully determines the color: odd moves are Black.
    pub fn from_move_number(n: u32) -> Self {
        if n % 2 == 1 {
            Player::Black
        } else {
            Player::White
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Player::Black => "B",
            Player::White => "W",
        }
    }
}

/// A grid intersection index, `col` and `row` both in 0..=18.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coord {
    pub col: u8,
    pub row: u8,
}

impl Coord {
    pub fn new(col: u8, row: u8) -> Option<Self> {
        if (col as usize) < BOARD_LINES && (row as usize) < BOARD_LINES {
            Some(Self { col, row })
        } else {
            None
        }
    }

    /// Text form, e.g. "A1" for the top-left intersection, "S19" for the
    /// bottom-right one.
    pub fn text(&self) -> String {
        format!("{}{}", COLUMN_LETTERS[self.col as usize] as char, self.row + 1)
    }

    /// Parse the text form back into indices. Accepts lowercase letters.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let mut chars = s.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let col = COLUMN_LETTERS.iter().position(|&c| c as char == letter)?;
        let row: u8 = chars.as_str().parse().ok()?;
        if !(1..=19).contains(&row) {
            return None;
        }
        Coord::new(col as u8, row - 1)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// The 19 + 19 reconstructed grid-line positions in the rectified image.
///
/// `xs` holds the x position of each vertical line (columns, left to right),
/// `ys` the y position of each horizontal line (rows, top to bottom). Both
/// are strictly increasing with 18 gaps approximating a common spacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    xs: Vec<f32>,
    ys: Vec<f32>,
}

impl Grid {
    /// Validates line count and monotonicity; returns `None` otherwise.
    pub fn new(xs: Vec<f32>, ys: Vec<f32>) -> Option<Self> {
        if xs.len() != BOARD_LINES || ys.len() != BOARD_LINES {
            return None;
        }
        if !strictly_increasing(&xs) || !strictly_increasing(&ys) {
            return None;
        }
        Some(Self { xs, ys })
    }

    /// An evenly-spaced grid spanning the full rectified square. Used as the
    /// hand-specified fallback when line reconstruction fails.
    pub fn uniform(size: f32) -> Self {
        Self::uniform_rect(size, size)
    }

    /// An evenly-spaced grid over a rectangle. Crop insets are per-side, so
    /// a cropped rectified image need not stay square; each axis spans its
    /// own dimension.
    pub fn uniform_rect(width: f32, height: f32) -> Self {
        let span = |extent: f32| -> Vec<f32> {
            let step = extent / (BOARD_LINES - 1) as f32;
            (0..BOARD_LINES).map(|i| i as f32 * step).collect()
        };
        Self {
            xs: span(width),
            ys: span(height),
        }
    }

    pub fn xs(&self) -> &[f32] {
        &self.xs
    }

    pub fn ys(&self) -> &[f32] {
        &self.ys
    }

    /// Pixel position of an intersection.
    pub fn point(&self, coord: Coord) -> (f32, f32) {
        (self.xs[coord.col as usize], self.ys[coord.row as usize])
    }

    /// Mean gap between vertical lines.
    pub fn spacing_x(&self) -> f32 {
        (self.xs[BOARD_LINES - 1] - self.xs[0]) / (BOARD_LINES - 1) as f32
    }

    /// Mean gap between horizontal lines.
    pub fn spacing_y(&self) -> f32 {
        (self.ys[BOARD_LINES - 1] - self.ys[0]) / (BOARD_LINES - 1) as f32
    }

    /// The smaller of the two mean spacings; the unit for distance-based
    /// confidence scores.
    pub fn min_spacing(&self) -> f32 {
        self.spacing_x().min(self.spacing_y())
    }

    /// Shift the whole grid by a constant offset per axis.
    pub fn translate(&mut self, dx: f32, dy: f32) {
        for x in &mut self.xs {
            *x += dx;
        }
        for y in &mut self.ys {
            *y += dy;
        }
    }

    /// Snap a pixel position to the nearest intersection by exhaustive
    /// search over all 19x19 candidates. Total and deterministic: ties go to
    /// the first candidate in row-major scan order.
    pub fn snap(&self, x: f32, y: f32) -> (Coord, f32) {
        let mut best = Coord { col: 0, row: 0 };
        let mut best_dist = f32::INFINITY;
        for row in 0..BOARD_LINES {
            for col in 0..BOARD_LINES {
                let dx = x - self.xs[col];
                let dy = y - self.ys[row];
                let dist = dx.hypot(dy);
                if dist < best_dist {
                    best_dist = dist;
                    best = Coord {
                        col: col as u8,
                        row: row as u8,
                    };
                }
            }
        }
        (best, best_dist)
    }
}

fn strictly_increasing(values: &[f32]) -> bool {
    values.windows(2).all(|w| w[1] > w[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_text_corners() {
        assert_eq!(Coord::new(0, 0).unwrap().text(), "A1");
        assert_eq!(Coord::new(18, 18).unwrap().text(), "S19");
        // I is not skipped: column 8 is I.
        assert_eq!(Coord::new(8, 0).unwrap().text(), "I1");
    }

    #[test]
    fn test_coord_parse_round_trip() {
        for col in 0..19u8 {
            for row in 0..19u8 {
                let c = Coord::new(col, row).unwrap();
                assert_eq!(Coord::parse(&c.text()), Some(c));
            }
        }
        assert_eq!(Coord::parse("T1"), None);
        assert_eq!(Coord::parse("A20"), None);
        assert_eq!(Coord::parse(""), None);
    }

    #[test]
    fn test_player_parity() {
        assert_eq!(Player::from_move_number(1), Player::Black);
        assert_eq!(Player::from_move_number(7), Player::Black);
        assert_eq!(Player::from_move_number(8), Player::White);
    }

    #[test]
    fn test_quad_requires_four_points() {
        let pts = vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(1.0, 1.0)];
        assert!(matches!(
            Quad::from_points(&pts),
            Err(DetectError::InvalidGeometry(3))
        ));
    }

    #[test]
    fn test_uniform_grid_spacing() {
        let grid = Grid::uniform(1024.0);
        assert_eq!(grid.xs().len(), 19);
        let expected = 1024.0 / 18.0;
        assert!((grid.spacing_x() - expected).abs() < 1e-3);
        assert!((grid.spacing_y() - expected).abs() < 1e-3);
    }

    #[test]
    fn test_uniform_rect_spans_each_axis() {
        let grid = Grid::uniform_rect(614.0, 1023.0);
        assert_eq!(grid.xs()[18], 614.0);
        assert_eq!(grid.ys()[18], 1023.0);
        assert!((grid.spacing_x() - 614.0 / 18.0).abs() < 1e-3);
        assert!((grid.spacing_y() - 1023.0 / 18.0).abs() < 1e-3);
    }

    #[test]
    fn test_snap_is_total_and_deterministic() {
        let grid = Grid::uniform(1024.0);
        for &(x, y) in &[(0.0f32, 0.0f32), (1023.0, 1023.0), (511.7, 28.4), (300.0, 300.0)] {
            let (a, da) = grid.snap(x, y);
            let (b, db) = grid.snap(x, y);
            assert_eq!(a, b);
            assert_eq!(da, db);
            assert!(a.col <= 18 && a.row <= 18);
        }
    }

    #[test]
    fn test_snap_tie_breaks_row_major() {
        let grid = Grid::uniform(1024.0);
        // Exactly between (0,0) and (1,0): the first candidate in row-major
        // order wins.
        let step = 1024.0 / 18.0;
        let (c, _) = grid.snap(step / 2.0, 0.0);
        assert_eq!(c, Coord::new(0, 0).unwrap());
    }

    #[test]
    fn test_grid_rejects_non_monotonic() {
        let mut xs: Vec<f32> = (0..19).map(|i| i as f32 * 10.0).collect();
        let ys = xs.clone();
        xs[5] = xs[4];
        assert!(Grid::new(xs, ys).is_none());
    }
}
