//! Grid calibration on the rectified square.
//!
//! Reconstructs the 19 vertical and 19 horizontal line positions from image
//! evidence: suppress stone disks (they occlude lines and add circular
//! edges), run Canny + Hough, cluster nearby detections into single lines,
//! then complete the set to exactly 19 per axis by interpolating oversized
//! gaps and extrapolating at the edges. A final small-offset search aligns
//! the finished grid against detected stone centers.

use image::{GrayImage, Luma, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::hough::{detect_lines, LineDetectionOptions, PolarLine};
use tracing::debug;

use crate::error::DetectError;
use crate::geometry::{Grid, BOARD_LINES};

/// Detections closer than this are the same physical line.
const CLUSTER_SPACING: f32 = 10.0;
/// A modal gap below this means the line set is noise, not a grid.
const MIN_GAP: f32 = 5.0;
/// Gaps larger than `modal * GAP_RATIO` hide one or more missing lines.
const GAP_RATIO: f32 = 1.6;
/// Hough votes required to accept a line.
const LINE_VOTES: u32 = 300;
/// Offset refinement search half-width, in pixels.
const REFINE_RANGE: i32 = 10;

/// A stone disk found by the circle sweep.
#[derive(Debug, Clone, Copy)]
struct StoneDisk {
    x: f32,
    y: f32,
    r: f32,
    votes: u32,
}

/// Reconstruct the 19x19 grid from a rectified board image.
///
/// Fails with `GridReconstructionFailed` (carrying the per-axis line counts
/// that survived clustering) when either axis cannot be completed; the
/// caller decides whether to fall back to a uniform grid.
pub fn calibrate(warped: &RgbImage) -> Result<Grid, DetectError> {
    let gray = image::imageops::grayscale(warped);

    let disks = detect_stone_disks(&gray);
    debug!(disks = disks.len(), "circle sweep complete");

    let mut edges = canny(&gray, 50.0, 100.0);
    suppress_disks(&mut edges, &disks);

    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: LINE_VOTES,
            suppression_radius: 8,
        },
    );

    let (mut xs, mut ys) = bucket_lines(&lines);
    xs.sort_by(|a, b| a.total_cmp(b));
    ys.sort_by(|a, b| a.total_cmp(b));
    let xs = cluster_positions(&xs, CLUSTER_SPACING);
    let ys = cluster_positions(&ys, CLUSTER_SPACING);
    debug!(
        vertical = xs.len(),
        horizontal = ys.len(),
        "clustered line candidates"
    );

    let failed = |xs: &[f32], ys: &[f32]| DetectError::GridReconstructionFailed {
        horizontal: ys.len(),
        vertical: xs.len(),
    };

    let full_xs = complete_axis(&xs).ok_or_else(|| failed(&xs, &ys))?;
    let full_ys = complete_axis(&ys).ok_or_else(|| failed(&xs, &ys))?;

    let mut grid = Grid::new(full_xs, full_ys).ok_or_else(|| failed(&xs, &ys))?;
    refine_offset(&mut grid, &disks);
    Ok(grid)
}

/// Split Hough lines into vertical and horizontal position lists.
///
/// Vertical lines sit at theta 0 (or its wrap at 179 with negated r),
/// horizontal ones at theta 90. Integer-degree bins make the tolerance
/// about one and a half degrees.
fn bucket_lines(lines: &[PolarLine]) -> (Vec<f32>, Vec<f32>) {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for line in lines {
        let theta = line.angle_in_degrees;
        if theta <= 1 {
            xs.push(line.r);
        } else if theta >= 179 {
            xs.push(-line.r);
        } else if (89..=91).contains(&theta) {
            ys.push(line.r);
        }
    }
    (xs, ys)
}

/// Merge sorted positions closer than `min_spacing` into their mean.
fn cluster_positions(sorted: &[f32], min_spacing: f32) -> Vec<f32> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] - sorted[j - 1] < min_spacing {
            j += 1;
        }
        let sum: f32 = sorted[i..j].iter().sum();
        out.push(sum / (j - i) as f32);
        i = j;
    }
    out
}

/// The most common rounded gap, returned as the mean of its members.
fn modal_gap(gaps: &[f32]) -> Option<f32> {
    let mut buckets: Vec<(i32, usize, f32)> = Vec::new();
    for &g in gaps {
        let key = g.round() as i32;
        match buckets.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, count, sum)) => {
                *count += 1;
                *sum += g;
            }
            None => buckets.push((key, 1, g)),
        }
    }
    buckets
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(_, count, sum)| sum / *count as f32)
}

/// Complete a clustered axis to exactly 19 strictly increasing positions.
///
/// Oversized gaps (beyond `GAP_RATIO` times the modal gap) are filled by
/// even interpolation; surplus lines are trimmed from whichever end deviates
/// most from the modal spacing; shortfalls extend alternately past the last
/// and before the first line.
fn complete_axis(clustered: &[f32]) -> Option<Vec<f32>> {
    if clustered.len() < 2 {
        return None;
    }
    let gaps: Vec<f32> = clustered.windows(2).map(|w| w[1] - w[0]).collect();
    let spacing = modal_gap(&gaps)?;
    if spacing < MIN_GAP {
        return None;
    }
    let bound = spacing * GAP_RATIO;

    let mut full = vec![clustered[0]];
    for w in clustered.windows(2) {
        let gap = w[1] - w[0];
        if gap > bound {
            let m = ((gap / spacing).round() as usize).max(2);
            for k in 1..m {
                full.push(w[0] + gap * k as f32 / m as f32);
            }
        }
        full.push(w[1]);
    }

    while full.len() > BOARD_LINES {
        let n = full.len();
        let first_dev = ((full[1] - full[0]) - spacing).abs();
        let last_dev = ((full[n - 1] - full[n - 2]) - spacing).abs();
        if first_dev >= last_dev {
            full.remove(0);
        } else {
            full.pop();
        }
    }

    let mut extend_after = true;
    while full.len() < BOARD_LINES {
        if extend_after {
            let last = *full.last()?;
            full.push(last + spacing);
        } else {
            let first = full[0];
            full.insert(0, first - spacing);
        }
        extend_after = !extend_after;
    }

    Some(full)
}

/// Find dark stone disks with a Hough circle sweep over several blur levels.
///
/// The accumulator is downsampled 4x; each radius keeps peaks whose vote
/// count scales with circumference. Duplicates across radii and blur levels
/// are removed by greedy suppression on the strongest candidates.
fn detect_stone_disks(gray: &GrayImage) -> Vec<StoneDisk> {
    let mut candidates = Vec::new();
    for &sigma in &[0.0f32, 1.5, 3.0] {
        let blurred = if sigma > 0.0 {
            gaussian_blur_f32(gray, sigma)
        } else {
            gray.clone()
        };
        let edges = canny(&blurred, 50.0, 100.0);
        candidates.extend(circle_sweep(&edges));
    }
    candidates.sort_by(|a, b| b.votes.cmp(&a.votes));

    let mut kept: Vec<StoneDisk> = Vec::new();
    for c in candidates {
        let close = kept
            .iter()
            .any(|k| (k.x - c.x).hypot(k.y - c.y) < 15.0);
        if !close {
            kept.push(c);
        }
    }
    kept
}

const ACC_DOWNSAMPLE: u32 = 4;
const ANGLE_SAMPLES: usize = 48;

fn circle_sweep(edges: &GrayImage) -> Vec<StoneDisk> {
    let (w, h) = edges.dimensions();
    let aw = (w / ACC_DOWNSAMPLE + 1) as usize;
    let ah = (h / ACC_DOWNSAMPLE + 1) as usize;

    let table: Vec<(f32, f32)> = (0..ANGLE_SAMPLES)
        .map(|i| {
            let t = i as f32 * std::f32::consts::TAU / ANGLE_SAMPLES as f32;
            (t.cos(), t.sin())
        })
        .collect();

    let mut found = Vec::new();
    for r in (16u32..=34).step_by(6) {
        let mut acc = vec![0u32; aw * ah];
        for (x, y, p) in edges.enumerate_pixels() {
            if p.0[0] == 0 {
                continue;
            }
            for &(c, s) in &table {
                let cx = x as f32 - r as f32 * c;
                let cy = y as f32 - r as f32 * s;
                if cx < 0.0 || cy < 0.0 {
                    continue;
                }
                let ix = (cx as u32 / ACC_DOWNSAMPLE) as usize;
                let iy = (cy as u32 / ACC_DOWNSAMPLE) as usize;
                if ix < aw && iy < ah {
                    acc[iy * aw + ix] += 1;
                }
            }
        }

        // A full circle contributes roughly 2*pi*r votes to its center cell.
        let threshold = 3 * r;
        for iy in 0..ah {
            for ix in 0..aw {
                let votes = acc[iy * aw + ix];
                if votes >= threshold {
                    found.push(StoneDisk {
                        x: (ix as u32 * ACC_DOWNSAMPLE + ACC_DOWNSAMPLE / 2) as f32,
                        y: (iy as u32 * ACC_DOWNSAMPLE + ACC_DOWNSAMPLE / 2) as f32,
                        r: r as f32,
                        votes,
                    });
                }
            }
        }
    }
    found
}

/// Remove circular edge evidence and re-assert the occluded intersection.
///
/// Each disk is blanked from the edge map, then a single bright dot at its
/// center lets the line accumulator keep a vote where the stone covers the
/// crossing.
fn suppress_disks(edges: &mut GrayImage, disks: &[StoneDisk]) {
    for d in disks {
        draw_filled_circle_mut(
            edges,
            (d.x as i32, d.y as i32),
            d.r as i32 + 3,
            Luma([0u8]),
        );
        draw_filled_circle_mut(edges, (d.x as i32, d.y as i32), 1, Luma([255u8]));
    }
}

/// Shift the grid by up to `REFINE_RANGE` px per axis so that as many stone
/// centers as possible land within half a cell of an intersection. Ties keep
/// the smallest shift. No-op without detected stones.
fn refine_offset(grid: &mut Grid, disks: &[StoneDisk]) {
    if disks.is_empty() {
        return;
    }
    let half_cell = grid.min_spacing() * 0.5;
    let mut best = (0i32, 0i32);
    let mut best_score = 0usize;

    let mut dy = -REFINE_RANGE;
    while dy <= REFINE_RANGE {
        let mut dx = -REFINE_RANGE;
        while dx <= REFINE_RANGE {
            let score = disks
                .iter()
                .filter(|d| {
                    let nx = nearest_dist(grid.xs(), d.x - dx as f32);
                    let ny = nearest_dist(grid.ys(), d.y - dy as f32);
                    nx.hypot(ny) < half_cell
                })
                .count();
            let shift = dx.abs() + dy.abs();
            let best_shift = best.0.abs() + best.1.abs();
            if score > best_score || (score == best_score && shift < best_shift) {
                best_score = score;
                best = (dx, dy);
            }
            dx += 2;
        }
        dy += 2;
    }

    if best != (0, 0) {
        debug!(dx = best.0, dy = best.1, matched = best_score, "grid offset refined");
        grid.translate(best.0 as f32, best.1 as f32);
    }
}

fn nearest_dist(positions: &[f32], v: f32) -> f32 {
    positions
        .iter()
        .map(|&p| (p - v).abs())
        .fold(f32::INFINITY, f32::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_line_segment_mut;

    #[test]
    fn test_cluster_merges_nearby() {
        let sorted = [100.0, 101.0, 102.0, 160.0, 161.0];
        let out = cluster_positions(&sorted, 10.0);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 101.0).abs() < 1e-3);
        assert!((out[1] - 160.5).abs() < 1e-3);
    }

    #[test]
    fn test_complete_axis_idempotent_on_full_grid() {
        let full: Vec<f32> = (0..19).map(|i| 40.0 + i as f32 * 52.0).collect();
        let out = complete_axis(&full).expect("complete");
        assert_eq!(out.len(), 19);
        for (a, b) in out.iter().zip(full.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_complete_axis_interpolates_missing_line() {
        let mut lines: Vec<f32> = (0..19).map(|i| 40.0 + i as f32 * 52.0).collect();
        let removed = lines.remove(7);
        let out = complete_axis(&lines).expect("complete");
        assert_eq!(out.len(), 19);
        let recovered = out
            .iter()
            .map(|&v| (v - removed).abs())
            .fold(f32::INFINITY, f32::min);
        assert!(recovered < 1.0, "missing line off by {}", recovered);
    }

    #[test]
    fn test_complete_axis_extends_truncated_grid() {
        let lines: Vec<f32> = (0..17).map(|i| 40.0 + i as f32 * 52.0).collect();
        let out = complete_axis(&lines).expect("complete");
        assert_eq!(out.len(), 19);
        for w in out.windows(2) {
            assert!((w[1] - w[0] - 52.0).abs() < 1.0);
        }
    }

    #[test]
    fn test_complete_axis_rejects_noise() {
        assert!(complete_axis(&[100.0]).is_none());
        // Modal gap below the minimum spacing.
        let dense: Vec<f32> = (0..30).map(|i| i as f32 * 2.0).collect();
        assert!(complete_axis(&dense).is_none());
    }

    #[test]
    fn test_modal_gap_prefers_most_common() {
        let gaps = [52.0, 52.1, 51.9, 104.0, 52.0];
        let m = modal_gap(&gaps).unwrap();
        assert!((m - 52.0).abs() < 0.2);
    }

    #[test]
    fn test_calibrate_synthetic_empty_board() {
        let mut img = RgbImage::from_pixel(1024, 1024, image::Rgb([222, 184, 120]));
        let line = image::Rgb([30, 20, 10]);
        let positions: Vec<f32> = (0..19).map(|i| 40.0 + i as f32 * 52.0).collect();
        let lo = positions[0];
        let hi = positions[18];
        for &p in &positions {
            draw_line_segment_mut(&mut img, (p, lo), (p, hi), line);
            draw_line_segment_mut(&mut img, (lo, p), (hi, p), line);
        }

        let grid = calibrate(&img).expect("grid from clean synthetic board");
        for (got, want) in grid.xs().iter().zip(positions.iter()) {
            assert!((got - want).abs() < 2.5, "x {} vs {}", got, want);
        }
        for (got, want) in grid.ys().iter().zip(positions.iter()) {
            assert!((got - want).abs() < 2.5, "y {} vs {}", got, want);
        }
    }
}
