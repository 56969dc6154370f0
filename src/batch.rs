//! Offline evaluation over a directory of labeled screenshots.
//!
//! File names carry the ground truth: `<move>-<coord>-<color>.png`, e.g.
//! `127-D16-B.png`, with an optional `_n` suffix for duplicates of the same
//! position. The harness runs detection on every labeled file and reports
//! hit rate plus the distance statistics of the misses, which is what gets
//! watched while tuning thresholds.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::detector::Detector;
use crate::geometry::{Coord, Player};

/// Ground truth parsed from a file name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Label {
    pub move_number: u32,
    pub coord: Coord,
    pub color: Player,
}

/// Parse `<move>-<coord>-<color>[_n].<ext>` into a label.
pub fn parse_label(file_name: &str) -> Option<Label> {
    let stem = file_name.rsplit_once('.')?.0;
    let stem = stem.split('_').next()?;
    let mut parts = stem.split('-');

    let move_number: u32 = parts.next()?.parse().ok()?;
    let coord = Coord::parse(parts.next()?)?;
    let color = match parts.next()? {
        "B" | "b" => Player::Black,
        "W" | "w" => Player::White,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(Label {
        move_number,
        coord,
        color,
    })
}

/// Aggregate results over one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub success_rate: f64,
    /// Number of misses that produced a coordinate at all.
    pub error_count: usize,
    /// Distance statistics of the misses, in grid units.
    pub mean_error: Option<f64>,
    pub rmse: Option<f64>,
    pub max_error: Option<f64>,
    pub min_error: Option<f64>,
}

impl BatchStats {
    /// Build stats from per-case outcomes: whether the case matched the
    /// label, and the coordinate error when a coordinate was produced.
    fn from_outcomes(outcomes: &[(bool, Option<f64>)]) -> Self {
        let total = outcomes.len();
        let success = outcomes.iter().filter(|(ok, _)| *ok).count();
        let errors: Vec<f64> = outcomes
            .iter()
            .filter(|(ok, _)| !ok)
            .filter_map(|(_, e)| *e)
            .collect();

        let (mean_error, rmse, max_error, min_error) = if errors.is_empty() {
            (None, None, None, None)
        } else {
            let n = errors.len() as f64;
            let mean = errors.iter().sum::<f64>() / n;
            let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
            let max = errors.iter().fold(f64::MIN, |a, &b| a.max(b));
            let min = errors.iter().fold(f64::MAX, |a, &b| a.min(b));
            (Some(mean), Some(rmse), Some(max), Some(min))
        };

        Self {
            total,
            success,
            failure: total - success,
            success_rate: if total > 0 {
                success as f64 / total as f64
            } else {
                0.0
            },
            error_count: errors.len(),
            mean_error,
            rmse,
            max_error,
            min_error,
        }
    }
}

/// Run detection over every labeled image in `dir`.
///
/// Unlabeled or non-image files are skipped with a warning; per-frame
/// pipeline errors count as failures without aborting the batch.
pub fn run_batch(dir: &Path, detector: &Detector) -> Result<BatchStats> {
    let mut outcomes: Vec<(bool, Option<f64>)> = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read batch directory {:?}", dir))?;
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let Some(label) = parse_label(name) else {
            warn!(file = name, "skipping image without a parseable label");
            continue;
        };

        let img = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!(file = name, error = %e, "failed to decode, counting as failure");
                outcomes.push((false, None));
                continue;
            }
        };

        let outcome = match detector.detect(&img, Some(label.move_number), None) {
            Ok(d) => {
                let dx = d.coord.col as f64 - label.coord.col as f64;
                let dy = d.coord.row as f64 - label.coord.row as f64;
                let err = dx.hypot(dy);
                let ok = d.coord == label.coord && d.color == label.color;
                if !ok {
                    warn!(
                        file = name,
                        got = %d.coord,
                        want = %label.coord,
                        error = err,
                        "mismatch"
                    );
                }
                (ok, Some(err))
            }
            Err(e) => {
                warn!(file = name, error = %e, "detection failed");
                (false, None)
            }
        };
        outcomes.push(outcome);
    }

    let stats = BatchStats::from_outcomes(&outcomes);
    info!(
        total = stats.total,
        success = stats.success,
        success_rate = stats.success_rate,
        "batch complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        let label = parse_label("127-D16-B.png").unwrap();
        assert_eq!(label.move_number, 127);
        assert_eq!(label.coord, Coord::parse("D16").unwrap());
        assert_eq!(label.color, Player::Black);

        // Duplicate suffix is ignored.
        let dup = parse_label("8-Q3-W_2.jpg").unwrap();
        assert_eq!(dup.move_number, 8);
        assert_eq!(dup.color, Player::White);
    }

    #[test]
    fn test_parse_label_rejects_malformed() {
        assert!(parse_label("screenshot.png").is_none());
        assert!(parse_label("x-D16-B.png").is_none());
        assert!(parse_label("12-Z9-B.png").is_none());
        assert!(parse_label("12-D16-X.png").is_none());
        assert!(parse_label("12-D16-B-extra.png").is_none());
    }

    #[test]
    fn test_stats_from_outcomes() {
        let outcomes = [
            (true, Some(0.0)),
            (false, Some(3.0)),
            (false, Some(4.0)),
            (false, None),
        ];
        let stats = BatchStats::from_outcomes(&outcomes);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 3);
        assert!((stats.success_rate - 0.25).abs() < 1e-9);
        assert_eq!(stats.error_count, 2);
        assert!((stats.mean_error.unwrap() - 3.5).abs() < 1e-9);
        assert!((stats.rmse.unwrap() - 12.5f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.max_error, Some(4.0));
        assert_eq!(stats.min_error, Some(3.0));
    }

    #[test]
    fn test_stats_empty() {
        let stats = BatchStats::from_outcomes(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.rmse.is_none());
    }

    #[test]
    fn test_undecodable_image_counts_as_failure() {
        let dir = std::env::temp_dir().join(format!("stonewatch-batch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        // Labeled name, garbage content: the run must record a failure and
        // keep going rather than abort.
        std::fs::write(dir.join("1-A1-B.png"), b"not an image").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let detector = Detector::new(crate::config::DetectorConfig::default());
        let stats = run_batch(&dir, &detector).expect("batch completes");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 0);
        assert_eq!(stats.failure, 1);
        assert_eq!(stats.error_count, 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
