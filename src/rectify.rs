//! Perspective rectification.
//!
//! Maps the board quadrilateral in the source capture onto a fixed
//! axis-aligned 1024x1024 square with a 4-point homography (Direct Linear
//! Transform), sampled with bilinear interpolation. Downstream stages only
//! ever see the rectified square.

use image::RgbImage;

use crate::config::CropInsets;
use crate::error::DetectError;
use crate::geometry::{Point, Quad, WARP_SIZE};

/// 3x3 homography stored row-major, with its inverse for reverse mapping.
#[derive(Debug, Clone)]
pub struct Homography {
    matrix: [f64; 9],
    inverse: [f64; 9],
}

impl Homography {
    /// Compute the homography taking `src` corners to `dst` corners.
    pub fn from_corners(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> Self {
        Self {
            matrix: compute_homography(src, dst),
            inverse: compute_homography(dst, src),
        }
    }

    /// The homography taking a board quadrilateral onto the rectified square.
    pub fn board_to_square(quad: &Quad) -> Self {
        let c = quad.corners();
        let src = [
            (c[0].x, c[0].y),
            (c[1].x, c[1].y),
            (c[2].x, c[2].y),
            (c[3].x, c[3].y),
        ];
        let s = WARP_SIZE as f64;
        let dst = [(0.0, 0.0), (s, 0.0), (s, s), (0.0, s)];
        Self::from_corners(src, dst)
    }

    /// Map a source point into the rectified square.
    #[inline]
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.matrix, x, y)
    }

    /// Map a rectified point back into the source image.
    #[inline]
    pub fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.inverse, x, y)
    }
}

/// Warp the board region of `src` into a `WARP_SIZE` x `WARP_SIZE` square.
///
/// Pure function: the input is never modified, and a degenerate quad simply
/// produces a distorted output rather than an error.
pub fn rectify(src: &RgbImage, quad: &Quad) -> RgbImage {
    let h = Homography::board_to_square(quad);
    let mut out = RgbImage::new(WARP_SIZE, WARP_SIZE);

    for dst_y in 0..WARP_SIZE {
        for dst_x in 0..WARP_SIZE {
            let (sx, sy) = h.unproject(dst_x as f64, dst_y as f64);
            let px = bilinear_sample(src, sx, sy);
            out.put_pixel(dst_x, dst_y, image::Rgb(px));
        }
    }
    out
}

/// Rectify from a raw corner list. Anything other than exactly four points
/// is `InvalidGeometry`; no further validation happens.
pub fn rectify_from_points(src: &RgbImage, corners: &[Point]) -> Result<RgbImage, DetectError> {
    let quad = Quad::from_points(corners)?;
    Ok(rectify(src, &quad))
}

/// Trim fractional insets from a rectified square.
///
/// Returns the input unchanged when all insets are zero. Insets are clamped
/// so at least one pixel survives per axis.
pub fn crop(img: &RgbImage, insets: &CropInsets) -> RgbImage {
    if insets.is_zero() {
        return img.clone();
    }
    let (w, h) = img.dimensions();
    let left = ((insets.left.clamp(0.0, 0.49) * w as f64) as u32).min(w - 1);
    let top = ((insets.top.clamp(0.0, 0.49) * h as f64) as u32).min(h - 1);
    let right = w - ((insets.right.clamp(0.0, 0.49) * w as f64) as u32).min(w - 1 - left);
    let bottom = h - ((insets.bottom.clamp(0.0, 0.49) * h as f64) as u32).min(h - 1 - top);

    let cw = right - left;
    let ch = bottom - top;
    let mut out = RgbImage::new(cw, ch);
    for y in 0..ch {
        for x in 0..cw {
            out.put_pixel(x, y, *img.get_pixel(left + x, top + y));
        }
    }
    out
}

/// Compute a 3x3 homography from 4 point correspondences with the DLT
/// algorithm, solved as an 8x8 linear system.
fn compute_homography(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> [f64; 9] {
    use nalgebra::{SMatrix, SVector};

    let mut a = [0.0f64; 64];
    let mut b = [0.0f64; 8];

    for i in 0..4 {
        let (x, y) = src[i];
        let (xp, yp) = dst[i];
        let r1 = i * 2;
        let r2 = i * 2 + 1;

        a[r1 * 8] = x;
        a[r1 * 8 + 1] = y;
        a[r1 * 8 + 2] = 1.0;
        a[r1 * 8 + 6] = -xp * x;
        a[r1 * 8 + 7] = -xp * y;
        b[r1] = xp;

        a[r2 * 8 + 3] = x;
        a[r2 * 8 + 4] = y;
        a[r2 * 8 + 5] = 1.0;
        a[r2 * 8 + 6] = -yp * x;
        a[r2 * 8 + 7] = -yp * y;
        b[r2] = yp;
    }

    let mat = SMatrix::<f64, 8, 8>::from_row_slice(&a);
    let rhs = SVector::<f64, 8>::from_row_slice(&b);

    match mat.lu().solve(&rhs) {
        Some(h) => [h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0],
        // Degenerate corner set (collinear points): fall back to identity.
        None => [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    }
}

#[inline]
fn apply_homography(h: &[f64; 9], x: f64, y: f64) -> (f64, f64) {
    let w = h[6] * x + h[7] * y + h[8];
    if w.abs() < 1e-10 {
        return (x, y);
    }
    let xp = (h[0] * x + h[1] * y + h[2]) / w;
    let yp = (h[3] * x + h[4] * y + h[5]) / w;
    (xp, yp)
}

/// Bilinear interpolation with edge clamping.
#[inline]
fn bilinear_sample(src: &RgbImage, x: f64, y: f64) -> [u8; 3] {
    let (w, h) = src.dimensions();
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = src.get_pixel(x0, y0).0;
    let p10 = src.get_pixel(x1, y0).0;
    let p01 = src.get_pixel(x0, y1).0;
    let p11 = src.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let value = p00[c] as f64 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f64 * fx * (1.0 - fy)
            + p01[c] as f64 * (1.0 - fx) * fy
            + p11[c] as f64 * fx * fy;
        out[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}
