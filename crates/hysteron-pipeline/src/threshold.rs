//! Two-level (hysteresis) thresholding.
//!
//! Voxels above the high threshold form *cores*; the final mask keeps
//! every voxel above the low threshold that is 6-connected to a core.
//! Core voxels are always part of the final mask, even when the low
//! threshold lies above the high one.
//!
//! Thresholds are narrowed to `f32` before comparing, so a voxel equal
//! to a threshold is never above it.

use crate::components::label_components;
use crate::segmentation::Segmentation;
use crate::types::{Mask, Volume};

/// Label the connected regions strictly above `high`.
#[must_use]
pub fn core_objects(smoothed: &Volume<f32>, high: f64) -> Segmentation {
    let high = narrow(high);
    let mask = smoothed.map(|&p| p > high);
    label_components(&mask)
}

/// Grow `cores` through the voxels strictly above `low`.
///
/// Returns the union of every connected component of
/// `(p > low) ∪ core` that contains at least one core voxel.
#[must_use]
pub fn hysteresis(smoothed: &Volume<f32>, cores: &Segmentation, low: f64) -> Mask {
    let low = narrow(low);
    let core_labels = cores.labels().as_slice();
    let candidate = smoothed.zip_map(cores.labels(), |&p, &c| c != 0 || p > low);
    let regions = label_components(&candidate);
    let Some(max) = regions.max_id() else {
        return candidate;
    };

    let mut seeded = vec![false; max.0 as usize + 1];
    for (&region, &core) in regions.labels().as_slice().iter().zip(core_labels) {
        if core != 0 {
            seeded[region as usize] = true;
        }
    }
    regions.labels().map(|&r| r != 0 && seeded[r as usize])
}

/// A threshold in the precision of the probabilities it is compared to.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn narrow(threshold: f64) -> f32 {
    threshold as f32
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Shape;

    fn row(values: &[f32]) -> Volume<f32> {
        Volume::new(Shape::new(values.len(), 1, 1), values.to_vec()).unwrap()
    }

    #[test]
    fn cores_are_strictly_above_high() {
        let p = row(&[0.9, 0.8, 0.2, 0.95]);
        let cores = core_objects(&p, 0.8);
        assert_eq!(cores.labels().as_slice(), &[1, 0, 0, 2]);
    }

    #[test]
    fn voxel_equal_to_high_is_not_a_core() {
        let p = row(&[0.8, 0.3]);
        assert_eq!(core_objects(&p, 0.8).object_count(), 0);
        assert_eq!(core_objects(&p, 0.3).object_count(), 1);
    }

    #[test]
    fn voxel_equal_to_low_is_not_grown() {
        let p = row(&[0.95, 0.3]);
        let cores = core_objects(&p, 0.9);
        let mask = hysteresis(&p, &cores, 0.3);
        assert_eq!(mask.as_slice(), &[true, false]);
    }

    #[test]
    fn high_of_one_yields_no_cores() {
        let p = row(&[1.0, 1.0]);
        assert_eq!(core_objects(&p, 1.0).object_count(), 0);
    }

    #[test]
    fn hysteresis_grows_only_from_cores() {
        // Two low regions; only the left one touches a core.
        let p = row(&[0.6, 0.9, 0.6, 0.1, 0.6, 0.6]);
        let cores = core_objects(&p, 0.8);
        let mask = hysteresis(&p, &cores, 0.5);
        assert_eq!(mask.as_slice(), &[true, true, true, false, false, false]);
    }

    #[test]
    fn lower_low_threshold_grows_more() {
        let p = row(&[0.3, 0.45, 0.9, 0.45, 0.3]);
        let cores = core_objects(&p, 0.8);
        let tight = hysteresis(&p, &cores, 0.4);
        let loose = hysteresis(&p, &cores, 0.2);
        assert_eq!(tight.count(), 3);
        assert_eq!(loose.count(), 5);
    }

    #[test]
    fn cores_survive_low_above_high() {
        let p = row(&[0.7, 0.9, 0.7]);
        let cores = core_objects(&p, 0.8);
        let mask = hysteresis(&p, &cores, 0.95);
        assert_eq!(mask.as_slice(), &[false, true, false]);
    }

    #[test]
    fn no_cores_means_empty_mask() {
        let p = row(&[0.6, 0.7]);
        let cores = core_objects(&p, 0.8);
        assert_eq!(hysteresis(&p, &cores, 0.5).count(), 0);
    }
}
