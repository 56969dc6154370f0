//! Typed failures for the detection pipeline.

use thiserror::Error;

/// Errors surfaced by the board detection pipeline.
///
/// Only `InvalidGeometry` and `UnsupportedResolution` are fatal for a frame;
/// the grid and marker failures are recovered internally by falling back to
/// degraded strategies where one exists.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The corner quadrilateral does not have exactly four points.
    #[error("board quadrilateral needs 4 corner points, got {0}")]
    InvalidGeometry(usize),

    /// No corner calibration is registered for the input image size.
    #[error("no board calibration registered for resolution {0}")]
    UnsupportedResolution(String),

    /// Line evidence was insufficient to reconstruct 19 lines on both axes.
    #[error("could not reconstruct a 19x19 grid (horizontal: {horizontal}, vertical: {vertical})")]
    GridReconstructionFailed { horizontal: usize, vertical: usize },

    /// Every marker-location strategy was exhausted without a match.
    #[error("no last-move marker found after trying {0} strategies")]
    MarkerNotFound(usize),
}
