//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a face crop to the canonical 112×112 ArcFace position using the five
//! InsightFace reference landmarks and least-squares estimation.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Minimum mean squared distance (px²) of source landmarks from their centroid.
const MIN_LANDMARK_SPREAD: f32 = 1.0;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

/// Least-squares similarity transform mapping `src` landmarks onto `dst`.
///
/// Returns `None` when the landmarks are degenerate (e.g. all coincident).
fn estimate_similarity(src: &Landmarks, dst: &Landmarks) -> Option<Similarity> {
    if landmark_spread(src) < MIN_LANDMARK_SPREAD {
        return None;
    }

    // Normal equations for A * [a, b, tx, ty]^T = B, two rows per point:
    //   [sx, -sy, 1, 0] . p = dx
    //   [sy,  sx, 0, 1] . p = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    Some(Similarity { a, b, tx, ty })
}

/// Mean squared distance of the points from their centroid.
fn landmark_spread(points: &Landmarks) -> f32 {
    let n = points.len() as f32;
    let (cx, cy) = points.iter().fold((0.0, 0.0), |(x, y), &(px, py)| (x + px, y + py));
    let (cx, cy) = (cx / n, cy / n);
    let spread = points
        .iter()
        .map(|&(x, y)| (x - cx).powi(2) + (y - cy).powi(2))
        .sum::<f32>()
        / n;
    if spread.is_finite() {
        spread
    } else {
        0.0
    }
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let max_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Inverse-map every output pixel through `t` and sample bilinearly.
///
/// Out-of-bounds samples are black.
fn warp_similarity(src: &RgbImage, t: Similarity, out_size: u32) -> Option<RgbImage> {
    let det = t.a * t.a + t.b * t.b;
    if det < 1e-12 {
        return None;
    }
    let ia = t.a / det;
    let ib = t.b / det;
    let (w, h) = (src.width() as i64, src.height() as i64);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            src.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    Some(RgbImage::from_fn(out_size, out_size, |ox, oy| {
        // src = M^-1 * (dst - t), with M^-1 = [[a, b], [-b, a]] / det
        let dx = ox as f32 - t.tx;
        let dy = oy as f32 - t.ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut px = [0u8; 3];
        for (c, out) in px.iter_mut().enumerate() {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *out = val.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    }))
}

/// Align a face crop to a canonical 112×112 image.
///
/// `landmarks` are in the crop's coordinate space. Returns `None` if they
/// do not define a usable transform; callers fall back to a plain resize.
pub fn align_face(crop: &RgbImage, landmarks: &Landmarks) -> Option<RgbImage> {
    let t = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112)?;
    warp_similarity(crop, t, ALIGNED_SIZE)
}
