//! Anisotropic Gaussian smoothing of a prediction channel.
//!
//! The 3D Gaussian is separable, so [`gaussian_smooth`] convolves with a
//! 1D kernel along each axis in turn. Each axis has its own sigma;
//! an axis with non-positive sigma (or extent 1) is left untouched.
//! Borders replicate the edge voxel.

use ndarray::{ArrayView1, ArrayViewMut1, Axis};

use crate::types::Volume;

/// Kernel half-width in units of sigma.
const TRUNCATE: f64 = 3.0;

/// Normalized 1D Gaussian kernel of odd length `2 * radius + 1`.
///
/// Returns `[1.0]` for non-positive sigma.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    if sigma.is_nan() || sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (TRUNCATE * sigma).ceil().max(1.0) as usize;
    let denom = 2.0 * sigma * sigma;
    let raw: Vec<f64> = (0..=2 * radius)
        .map(|k| {
            let x = k as f64 - radius as f64;
            (-x * x / denom).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|w| (w / sum) as f32).collect()
}

/// Smooth `volume` with per-axis sigmas `[x, y, z]`.
#[must_use = "returns the smoothed volume"]
pub fn gaussian_smooth(volume: &Volume<f32>, sigmas: [f64; 3]) -> Volume<f32> {
    let mut out = volume.view().to_owned();
    for (axis, sigma) in sigmas.into_iter().enumerate() {
        // Array axes run (z, y, x).
        let axis = Axis(2 - axis);
        if out.len_of(axis) < 2 || sigma.is_nan() || sigma <= 0.0 {
            continue;
        }
        let kernel = gaussian_kernel(sigma);
        let src = out.clone();
        for (dst, lane) in out.lanes_mut(axis).into_iter().zip(src.lanes(axis)) {
            convolve_lane(lane, dst, &kernel);
        }
    }
    Volume::from_array(out)
}

/// Convolve one lane with `kernel`, replicating its end voxels.
fn convolve_lane(src: ArrayView1<'_, f32>, mut dst: ArrayViewMut1<'_, f32>, kernel: &[f32]) {
    let n = src.len();
    let radius = kernel.len() / 2;
    for (pos, out) in dst.iter_mut().enumerate() {
        *out = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * src[(pos + k).saturating_sub(radius).min(n - 1)])
            .sum();
    }
}
