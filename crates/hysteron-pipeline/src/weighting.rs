//! Pairwise (Potts) regularization of the thresholded mask.
//!
//! Each voxel picks the label minimizing
//!
//! ```text
//! unary(label) + lambda * #{6-neighbors with a different label}
//! ```
//!
//! where `unary` is zero for the label the threshold assigned and
//! `|p - threshold|` for the other one. Minimization is iterated
//! conditional modes: in-place sweeps in linear order until no voxel
//! flips or [`MAX_SWEEPS`] is reached. `lambda == 0` returns the input.

use crate::threshold::narrow;
use crate::types::{Mask, Volume};

/// Upper bound on ICM sweeps.
pub const MAX_SWEEPS: usize = 10;

/// Result of [`potts_regularize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regularized {
    /// The regularized mask.
    pub mask: Mask,
    /// Voxels whose label differs from the input mask.
    pub flipped: u64,
    /// Sweeps performed (the last one flipped nothing unless capped).
    pub sweeps: usize,
}

/// Regularize `mask` against the smoothed probabilities it was
/// thresholded from.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn potts_regularize(
    mask: &Mask,
    smoothed: &Volume<f32>,
    threshold: f64,
    lambda: f64,
) -> Regularized {
    if lambda.is_nan() || lambda <= 0.0 {
        return Regularized {
            mask: mask.clone(),
            flipped: 0,
            sweeps: 0,
        };
    }

    let threshold = narrow(threshold);
    let shape = mask.shape();
    let initial = mask.as_slice();
    let probs = smoothed.as_slice();
    let mut labels = initial.to_vec();
    let mut sweeps = 0;

    while sweeps < MAX_SWEEPS {
        sweeps += 1;
        let mut changed = false;
        for i in 0..labels.len() {
            let current = labels[i];
            let other = !current;
            let disagree = |label: bool| {
                shape.neighbors(i).filter(|&n| labels[n] != label).count() as f64
            };
            let unary = |label: bool| {
                if label == initial[i] {
                    0.0
                } else {
                    unary_cost(probs[i], threshold)
                }
            };
            let keep = lambda.mul_add(disagree(current), unary(current));
            let flip = lambda.mul_add(disagree(other), unary(other));
            if flip < keep {
                labels[i] = other;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let flipped = labels
        .iter()
        .zip(initial)
        .map(|(a, b)| u64::from(a != b))
        .sum();
    Regularized {
        mask: Volume::from_index_fn(shape, |i| labels[i]),
        flipped,
        sweeps,
    }
}

/// Cost of overriding the thresholded label of a voxel with probability
/// `p`: its distance from the threshold.
fn unary_cost(p: f32, threshold: f32) -> f64 {
    f64::from((p - threshold).abs())
}
