//! Object labeling and size filtering, the last pipeline stage.

use crate::components::{grow_from_seeds, label_components};
use crate::segmentation::{ObjectId, Segmentation};
use crate::types::Mask;

/// Label the objects of `mask`.
///
/// Without `preserve_identities` every 6-connected component is one
/// object. With it, each core object claims the part of the mask it
/// reaches first, so two cores joined by a bridge stay two objects;
/// mask regions no core reaches become objects of their own.
#[must_use]
pub fn label_objects(mask: &Mask, cores: &Segmentation, preserve_identities: bool) -> Segmentation {
    if !preserve_identities {
        return label_components(mask);
    }
    let grown = grow_from_seeds(cores, mask);
    let offset = grown.max_id().map_or(0, |id| id.0);
    let leftover = mask.zip_map(grown.labels(), |&m, &g| m && g == 0);
    let extra = label_components(&leftover);
    let labels = grown
        .labels()
        .zip_map(extra.labels(), |&g, &e| if e == 0 { g } else { e + offset });
    Segmentation::new(labels).compacted()
}

/// Drop objects with fewer than `min` or more than `max` voxels and
/// renumber the survivors `1..=n`.
///
/// `min > max` keeps nothing.
#[must_use]
pub fn filter_by_size(objects: &Segmentation, min: u32, max: u32) -> Segmentation {
    let sizes = objects.object_sizes();
    let range = u64::from(min)..=u64::from(max);
    objects
        .relabel(|id| {
            if sizes.get(&id).is_some_and(|s| range.contains(s)) {
                id
            } else {
                ObjectId::BACKGROUND
            }
        })
        .compacted()
}
