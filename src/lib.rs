//! stonewatch - last-move recovery on a 19x19 goban from screen captures.
//!
//! Given a fixed-resolution screenshot of a Go client, the pipeline warps
//! the board region onto a square, reconstructs the grid from line evidence,
//! finds the client's last-move marker glyph, classifies every intersection,
//! and reports the move's coordinate, color, number and a confidence score.
//! All capture, tap and OCR I/O lives outside this crate; callers pass in
//! decoded images and, optionally, a move-number hint and a previous-frame
//! snapshot.

pub mod batch;
pub mod config;
pub mod detector;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod hint;
pub mod marker;
pub mod rectify;
pub mod resolver;
pub mod stones;

pub use config::DetectorConfig;
pub use detector::{Detection, Detector, Diagnostics};
pub use error::DetectError;
pub use geometry::{Coord, Grid, Player, Point, Quad};
pub use stones::{BoardSnapshot, Occupancy};
