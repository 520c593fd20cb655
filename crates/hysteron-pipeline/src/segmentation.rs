//! Labeled object segmentations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Mask, Shape, Volume, VolumeError};

/// Identifier of one object in a [`Segmentation`]. `0` is background.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The background label.
    pub const BACKGROUND: Self = Self(0);

    /// Returns `true` for the background label.
    #[must_use]
    pub const fn is_background(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A labeled partition of a volume into objects.
///
/// Every voxel carries the id of the object it belongs to, or
/// [`ObjectId::BACKGROUND`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segmentation {
    labels: Volume<u32>,
}

impl Segmentation {
    /// Wrap a label volume.
    #[must_use]
    pub const fn new(labels: Volume<u32>) -> Self {
        Self { labels }
    }

    /// Build a segmentation from raw labels.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::LengthMismatch`] if `labels` does not fill
    /// `shape`.
    pub fn from_labels(shape: Shape, labels: Vec<u32>) -> Result<Self, VolumeError> {
        Ok(Self::new(Volume::new(shape, labels)?))
    }

    /// An all-background segmentation.
    #[must_use]
    pub fn empty(shape: Shape) -> Self {
        Self::new(Volume::filled(shape, 0))
    }

    /// The volume's extent.
    #[must_use]
    pub fn shape(&self) -> Shape {
        self.labels.shape()
    }

    /// The underlying label volume.
    #[must_use]
    pub const fn labels(&self) -> &Volume<u32> {
        &self.labels
    }

    /// Object at a linear voxel index (background outside the volume).
    #[must_use]
    pub fn object_at(&self, index: usize) -> ObjectId {
        ObjectId(self.labels.as_slice().get(index).copied().unwrap_or(0))
    }

    /// Voxel count of every object.
    #[must_use]
    pub fn object_sizes(&self) -> BTreeMap<ObjectId, u64> {
        let mut sizes = BTreeMap::new();
        for &label in self.labels.as_slice() {
            if label != 0 {
                *sizes.entry(ObjectId(label)).or_insert(0) += 1;
            }
        }
        sizes
    }

    /// Number of distinct objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.object_sizes().len()
    }

    /// Largest object id present, if any.
    #[must_use]
    pub fn max_id(&self) -> Option<ObjectId> {
        self.labels
            .as_slice()
            .iter()
            .copied()
            .filter(|&l| l != 0)
            .max()
            .map(ObjectId)
    }

    /// Foreground mask (every non-background voxel).
    #[must_use]
    pub fn foreground(&self) -> Mask {
        self.labels.map(|&l| l != 0)
    }

    /// Map every object id through `f`. Background is left untouched and
    /// `f` returning background erases the object.
    #[must_use]
    pub fn relabel(&self, mut f: impl FnMut(ObjectId) -> ObjectId) -> Self {
        let mut cache: HashMap<u32, u32> = HashMap::new();
        Self::new(self.labels.map(|&l| {
            if l == 0 {
                return 0;
            }
            *cache.entry(l).or_insert_with(|| f(ObjectId(l)).0)
        }))
    }

    /// Renumber objects `1..=n` in order of first appearance in the
    /// linear voxel layout.
    #[must_use]
    pub fn compacted(&self) -> Self {
        let mut order: HashMap<u32, u32> = HashMap::new();
        for &l in self.labels.as_slice() {
            if l != 0 {
                let next = u32::try_from(order.len() + 1).unwrap_or(u32::MAX);
                order.entry(l).or_insert(next);
            }
        }
        Self::new(self.labels.map(|l| order.get(l).copied().unwrap_or(0)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn seg(labels: &[u32]) -> Segmentation {
        let len = labels.len();
        Segmentation::from_labels(Shape::new(len, 1, 1), labels.to_vec()).unwrap()
    }

    #[test]
    fn sizes_skip_background() {
        let s = seg(&[0, 3, 3, 0, 7]);
        let sizes = s.object_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[&ObjectId(3)], 2);
        assert_eq!(sizes[&ObjectId(7)], 1);
        assert_eq!(s.max_id(), Some(ObjectId(7)));
    }

    #[test]
    fn empty_has_no_objects() {
        let s = Segmentation::empty(Shape::new(2, 2, 2));
        assert_eq!(s.object_count(), 0);
        assert_eq!(s.max_id(), None);
    }

    #[test]
    fn compacted_numbers_by_first_appearance() {
        let s = seg(&[0, 9, 4, 9, 0, 2]);
        assert_eq!(s.compacted(), seg(&[0, 1, 2, 1, 0, 3]));
    }

    #[test]
    fn relabel_can_erase() {
        let s = seg(&[1, 2, 0]);
        let out = s.relabel(|id| if id == ObjectId(2) { ObjectId::BACKGROUND } else { ObjectId(5) });
        assert_eq!(out, seg(&[5, 0, 0]));
    }

    #[test]
    fn object_at_out_of_range_is_background() {
        let s = seg(&[4]);
        assert_eq!(s.object_at(0), ObjectId(4));
        assert_eq!(s.object_at(10), ObjectId::BACKGROUND);
    }
}
