//! Move resolution: turning a stone-center estimate into a board coordinate
//! with a confidence score, plus the move-number and color policy.
//!
//! Color is fully determined by move parity when a hint is present. Without
//! one, the stone counts decide: black leads by one after its own move, so a
//! lead means Black moved last.

use serde::Serialize;

use crate::geometry::{Coord, Grid, Player};
use crate::stones::{BoardSnapshot, Occupancy};

/// A 19x19 game cannot exceed this many moves in our model.
pub const MAX_MOVES: u32 = 361;

/// Where the reported move number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MoveSource {
    Hint,
    StoneCount,
}

/// Snap a stone-center estimate to the nearest intersection and score it.
///
/// Confidence is linear in the snap distance: 1.0 at the intersection, 0.0
/// at half a cell away or beyond.
pub fn snap_confidence(grid: &Grid, x: f32, y: f32) -> (Coord, f32, f32) {
    let (coord, dist) = grid.snap(x, y);
    let half_cell = grid.min_spacing() * 0.5;
    let confidence = (1.0 - dist / half_cell).clamp(0.0, 1.0);
    (coord, dist, confidence)
}

/// Add the agreement bonus when an independent cross-check (classified
/// occupancy at the snapped cell matching the expected color) confirms the
/// marker. Clamped so confidence never leaves [0, 1].
pub fn apply_cross_check(confidence: f32, agrees: bool) -> f32 {
    if agrees {
        (confidence + 0.2).min(1.0)
    } else {
        confidence
    }
}

/// Move number: an external hint always wins; otherwise the count of
/// occupied intersections stands in, capped at the board size.
pub fn infer_move_number(hint: Option<u32>, black: usize, white: usize) -> (u32, MoveSource) {
    match hint {
        Some(n) => (n.min(MAX_MOVES), MoveSource::Hint),
        None => (((black + white) as u32).min(MAX_MOVES), MoveSource::StoneCount),
    }
}

/// The color expected to have moved last.
pub fn expected_last_player(hint: Option<u32>, black: usize, white: usize) -> Player {
    match hint {
        Some(n) => Player::from_move_number(n),
        None => {
            if black > white {
                Player::Black
            } else {
                Player::White
            }
        }
    }
}

/// First intersection (row-major) that changed against the previous frame
/// and now holds a stone of the expected color.
pub fn changed_candidate(
    current: &BoardSnapshot,
    prev: &BoardSnapshot,
    expected: Player,
) -> Option<Coord> {
    current
        .diff(prev)
        .into_iter()
        .find(|&c| current.get(c) == Occupancy::of(expected))
}
