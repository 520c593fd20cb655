//! Carrying object identities across recomputations.
//!
//! After the size filter produces a new segmentation, objects that
//! correspond to objects of the previous segmentation keep their old
//! label. Correspondence is the best intersection-over-union: an old
//! object hands its label to the new object it overlaps most, as long
//! as the ratio exceeds [`LabelTransferPolicy::min_overlap`]. New
//! objects nobody claims get fresh labels above every old one.
//!
//! Two old objects may claim the same new object (a merge). Without
//! `preserve_identities` the best claimant's label wins and the others
//! map onto it. With it, the new object is split along the seed
//! (core) objects when every claimant can be given a seed of its own;
//! if not, an [`TransferDiagnostic::UnresolvedMerge`] is reported and
//! only the best claimant keeps the object.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::components::grow_from_seeds;
use crate::segmentation::{ObjectId, Segmentation};
use crate::types::{Shape, Volume};

/// How previous labels are matched onto a new segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelTransferPolicy {
    /// Minimum overlap ratio (exclusive) for an old object to keep its
    /// label.
    pub min_overlap: f64,
    /// Never let two old objects share one new object.
    pub preserve_identities: bool,
}

impl LabelTransferPolicy {
    /// Default minimum overlap ratio.
    pub const DEFAULT_MIN_OVERLAP: f64 = 0.5;

    /// A policy with the default overlap ratio.
    #[must_use]
    pub const fn new(preserve_identities: bool) -> Self {
        Self {
            min_overlap: Self::DEFAULT_MIN_OVERLAP,
            preserve_identities,
        }
    }

    /// Replace the minimum overlap ratio.
    #[must_use]
    pub const fn with_min_overlap(mut self, min_overlap: f64) -> Self {
        self.min_overlap = min_overlap;
        self
    }

    /// Match `old` labels onto `new` without seed information.
    ///
    /// Merges can never be split here, so with `preserve_identities`
    /// every merge is reported unresolved.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ShapeMismatch`] if the segmentations
    /// cover different volumes.
    pub fn transfer(
        &self,
        old: &Segmentation,
        new: &Segmentation,
    ) -> Result<LabelTransfer, TransferError> {
        self.run(old, new, None)
    }

    /// Match `old` labels onto `new`, splitting merges along `seeds`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ShapeMismatch`] if any of the three
    /// segmentations covers a different volume.
    pub fn transfer_with_seeds(
        &self,
        old: &Segmentation,
        new: &Segmentation,
        seeds: &Segmentation,
    ) -> Result<LabelTransfer, TransferError> {
        if seeds.shape() != new.shape() {
            return Err(TransferError::ShapeMismatch {
                old: new.shape(),
                new: seeds.shape(),
            });
        }
        self.run(old, new, Some(seeds))
    }

    fn run(
        &self,
        old: &Segmentation,
        new: &Segmentation,
        seeds: Option<&Segmentation>,
    ) -> Result<LabelTransfer, TransferError> {
        if old.shape() != new.shape() {
            return Err(TransferError::ShapeMismatch {
                old: old.shape(),
                new: new.shape(),
            });
        }

        let overlaps = Overlaps::count(old, new);
        let mut diagnostics = Vec::new();

        // new object -> claimants, best first
        let mut claims: BTreeMap<ObjectId, Vec<(ObjectId, f64)>> = BTreeMap::new();
        for (&o, &o_size) in &overlaps.old_sizes {
            match overlaps.best_match(o, o_size) {
                Some((n, ratio)) if ratio > self.min_overlap => {
                    claims.entry(n).or_default().push((o, ratio));
                }
                best => diagnostics.push(TransferDiagnostic::ObjectLost {
                    old: o,
                    best_ratio: best.map_or(0.0, |(_, r)| r),
                }),
            }
        }
        for claimants in claims.values_mut() {
            claimants.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        }

        let mut assignments = BTreeMap::new();
        let mut object_labels: HashMap<ObjectId, ObjectId> = HashMap::new();
        let mut splits: HashMap<usize, ObjectId> = HashMap::new();

        for (&n, claimants) in &claims {
            let best = claimants[0].0;
            object_labels.insert(n, best);
            if claimants.len() == 1 {
                assignments.insert(best, best);
                continue;
            }
            if !self.preserve_identities {
                for &(o, _) in claimants {
                    assignments.insert(o, best);
                }
                continue;
            }
            let ids: Vec<ObjectId> = claimants.iter().map(|c| c.0).collect();
            match seeds.and_then(|s| split_object(old, new, s, n, &ids)) {
                Some(parts) => {
                    log::debug!("split {n} between {} previous objects", ids.len());
                    splits.extend(parts);
                    for o in ids {
                        assignments.insert(o, o);
                    }
                }
                None => {
                    assignments.insert(best, best);
                    diagnostics.push(TransferDiagnostic::UnresolvedMerge { new: n, old: ids });
                }
            }
        }

        let mut next = old.max_id().map_or(0, |id| id.0);
        let mut fresh = BTreeSet::new();
        for &n in overlaps.new_sizes.keys() {
            object_labels.entry(n).or_insert_with(|| {
                next += 1;
                fresh.insert(ObjectId(next));
                ObjectId(next)
            });
        }

        let current = new.labels().as_slice();
        let labels = Volume::from_index_fn(new.shape(), |i| {
            let n = current[i];
            if n == 0 {
                return 0;
            }
            splits
                .get(&i)
                .or_else(|| object_labels.get(&ObjectId(n)))
                .map_or(0, |id| id.0)
        });

        Ok(LabelTransfer {
            mapping: LabelMapping { assignments, fresh },
            segmentation: Segmentation::new(labels),
            diagnostics,
        })
    }
}

impl Default for LabelTransferPolicy {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Pairwise overlap counts between two segmentations.
struct Overlaps {
    old_sizes: BTreeMap<ObjectId, u64>,
    new_sizes: BTreeMap<ObjectId, u64>,
    /// old -> (new -> intersecting voxels)
    pairs: HashMap<ObjectId, BTreeMap<ObjectId, u64>>,
}

impl Overlaps {
    fn count(old: &Segmentation, new: &Segmentation) -> Self {
        let mut pairs: HashMap<ObjectId, BTreeMap<ObjectId, u64>> = HashMap::new();
        for (&o, &n) in old.labels().as_slice().iter().zip(new.labels().as_slice()) {
            if o != 0 && n != 0 {
                *pairs
                    .entry(ObjectId(o))
                    .or_default()
                    .entry(ObjectId(n))
                    .or_insert(0) += 1;
            }
        }
        Self {
            old_sizes: old.object_sizes(),
            new_sizes: new.object_sizes(),
            pairs,
        }
    }

    /// New object with the highest IoU against `old`. Ties go to the
    /// lower new id.
    #[allow(clippy::cast_precision_loss)]
    fn best_match(&self, old: ObjectId, old_size: u64) -> Option<(ObjectId, f64)> {
        let candidates = self.pairs.get(&old)?;
        candidates
            .iter()
            .map(|(&n, &inter)| {
                let union = old_size + self.new_sizes.get(&n).copied().unwrap_or(0) - inter;
                (n, inter as f64 / union as f64)
            })
            .fold(None, |best: Option<(ObjectId, f64)>, cand| match best {
                Some(b) if b.1 >= cand.1 => Some(b),
                _ => Some(cand),
            })
    }
}

/// Split new object `target` between `claimants` along the seed objects
/// inside it.
///
/// Each seed component inside `target` goes to the claimant it overlaps
/// most. Succeeds only if every claimant receives at least one seed;
/// the claimants' seeds are then grown through `target`. Voxels no seed
/// reaches go to the first (best) claimant.
fn split_object(
    old: &Segmentation,
    new: &Segmentation,
    seeds: &Segmentation,
    target: ObjectId,
    claimants: &[ObjectId],
) -> Option<Vec<(usize, ObjectId)>> {
    let new_labels = new.labels().as_slice();
    let old_labels = old.labels().as_slice();
    let seed_labels = seeds.labels().as_slice();
    let inside: Vec<usize> = (0..new_labels.len())
        .filter(|&i| new_labels[i] == target.0)
        .collect();

    // seed -> claimant -> overlap
    let mut votes: BTreeMap<u32, BTreeMap<ObjectId, u64>> = BTreeMap::new();
    for &i in &inside {
        let (s, o) = (seed_labels[i], ObjectId(old_labels[i]));
        if s != 0 && claimants.contains(&o) {
            *votes.entry(s).or_default().entry(o).or_insert(0) += 1;
        }
    }
    let owner: HashMap<u32, ObjectId> = votes
        .into_iter()
        .filter_map(|(s, counts)| {
            counts
                .into_iter()
                .fold(None, |best: Option<(ObjectId, u64)>, (o, c)| match best {
                    Some(b) if b.1 >= c => Some(b),
                    _ => Some((o, c)),
                })
                .map(|(o, _)| (s, o))
        })
        .collect();
    if !claimants
        .iter()
        .all(|c| owner.values().any(|o| o == c))
    {
        return None;
    }

    let shape = new.shape();
    let mut mask = vec![false; shape.len()];
    let mut grow_seeds = vec![0_u32; shape.len()];
    for &i in &inside {
        mask[i] = true;
        if let Some(o) = owner.get(&seed_labels[i]) {
            grow_seeds[i] = o.0;
        }
    }
    let grown = grow_from_seeds(
        &Segmentation::new(Volume::from_index_fn(shape, |i| grow_seeds[i])),
        &Volume::from_index_fn(shape, |i| mask[i]),
    );
    let fallback = claimants[0];
    Some(
        inside
            .into_iter()
            .map(|i| {
                let o = grown.object_at(i);
                (i, if o.is_background() { fallback } else { o })
            })
            .collect(),
    )
}

/// Old object → label it carries in the transferred segmentation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    assignments: BTreeMap<ObjectId, ObjectId>,
    fresh: BTreeSet<ObjectId>,
}

impl LabelMapping {
    /// Label that old object `old` maps to, if it survived.
    #[must_use]
    pub fn get(&self, old: ObjectId) -> Option<ObjectId> {
        self.assignments.get(&old).copied()
    }

    /// Old objects mapped onto `label`, in id order.
    #[must_use]
    pub fn sources_of(&self, label: ObjectId) -> Vec<ObjectId> {
        self.assignments
            .iter()
            .filter(|&(_, &l)| l == label)
            .map(|(&o, _)| o)
            .collect()
    }

    /// Every `(old, label)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, ObjectId)> + '_ {
        self.assignments.iter().map(|(&o, &l)| (o, l))
    }

    /// Labels allocated for objects with no predecessor.
    #[must_use]
    pub const fn fresh_labels(&self) -> &BTreeSet<ObjectId> {
        &self.fresh
    }

    /// Returns `true` if every surviving object kept its own label and
    /// no new object appeared.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.fresh.is_empty() && self.assignments.iter().all(|(o, l)| o == l)
    }

    /// Carry per-object annotations across the transfer.
    ///
    /// Annotations of objects that were dropped are returned separately.
    /// When several old objects merged into one label, the annotation of
    /// the object that kept its own label wins.
    #[must_use]
    pub fn carry<A: Clone>(
        &self,
        annotations: &BTreeMap<ObjectId, A>,
    ) -> (BTreeMap<ObjectId, A>, Vec<ObjectId>) {
        let mut carried = BTreeMap::new();
        let mut dropped = Vec::new();
        for (&old, value) in annotations {
            match self.get(old) {
                Some(label) if label == old => {
                    carried.insert(label, value.clone());
                }
                Some(_) => {}
                None => dropped.push(old),
            }
        }
        for (&old, value) in annotations {
            if let Some(label) = self.get(old).filter(|&l| l != old) {
                carried.entry(label).or_insert_with(|| value.clone());
            }
        }
        (carried, dropped)
    }
}

/// Non-fatal findings of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferDiagnostic {
    /// An old object matched no new object well enough.
    ObjectLost {
        /// The lost object.
        old: ObjectId,
        /// Its best overlap ratio (0 if it overlapped nothing).
        best_ratio: f64,
    },
    /// Several old objects claimed one new object and the seeds could
    /// not separate them.
    UnresolvedMerge {
        /// The contested new object (raw id before relabeling).
        new: ObjectId,
        /// All claimants, best first. Only the first keeps its label.
        old: Vec<ObjectId>,
    },
}

impl std::fmt::Display for TransferDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectLost { old, best_ratio } => {
                write!(f, "object {old} lost (best overlap {best_ratio:.2})")
            }
            Self::UnresolvedMerge { new, old } => {
                let names: Vec<String> = old.iter().map(ToString::to_string).collect();
                write!(f, "objects {} merged into {new}", names.join(", "))
            }
        }
    }
}

/// Outcome of a label transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTransfer {
    /// Old → new label assignments.
    pub mapping: LabelMapping,
    /// The new segmentation repainted with persistent labels.
    pub segmentation: Segmentation,
    /// Lost objects and unresolved merges.
    pub diagnostics: Vec<TransferDiagnostic>,
}

/// Errors from [`LabelTransferPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The two segmentations cover different volumes.
    #[error("cannot transfer labels from shape {old} to shape {new}")]
    ShapeMismatch {
        /// Shape of the previous segmentation.
        old: Shape,
        /// Shape of the new segmentation.
        new: Shape,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line(labels: &[u32]) -> Segmentation {
        Segmentation::from_labels(Shape::new(labels.len(), 1, 1), labels.to_vec()).unwrap()
    }

    #[test]
    fn identical_segmentations_map_to_themselves() {
        let seg = line(&[1, 1, 0, 2, 2, 0, 3]);
        let out = LabelTransferPolicy::default().transfer(&seg, &seg).unwrap();
        assert!(out.mapping.is_identity());
        assert_eq!(out.segmentation, seg);
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn renumbered_objects_keep_old_labels() {
        let old = line(&[5, 5, 0, 9, 9]);
        let new = line(&[1, 1, 0, 2, 2]);
        let out = LabelTransferPolicy::default().transfer(&old, &new).unwrap();
        assert_eq!(out.segmentation, old);
        assert_eq!(out.mapping.get(ObjectId(9)), Some(ObjectId(9)));
    }

    #[test]
    fn new_object_gets_fresh_label_above_old() {
        let old = line(&[0, 4, 4, 0, 0]);
        let new = line(&[0, 1, 1, 0, 2]);
        let out = LabelTransferPolicy::default().transfer(&old, &new).unwrap();
        assert_eq!(out.segmentation.labels().as_slice(), &[0, 4, 4, 0, 5]);
        assert!(out.mapping.fresh_labels().contains(&ObjectId(5)));
        assert!(!out.mapping.is_identity());
    }

    #[test]
    fn vanished_object_is_reported_lost() {
        let old = line(&[1, 1, 0, 2, 2]);
        let new = line(&[1, 1, 0, 0, 0]);
        let out = LabelTransferPolicy::default().transfer(&old, &new).unwrap();
        assert_eq!(out.mapping.get(ObjectId(2)), None);
        assert_eq!(
            out.diagnostics,
            vec![TransferDiagnostic::ObjectLost {
                old: ObjectId(2),
                best_ratio: 0.0
            }]
        );
    }

    #[test]
    fn weak_overlap_is_lost() {
        // IoU = 1 / 4.
        let old = line(&[1, 0, 0, 0]);
        let new = line(&[1, 1, 1, 1]);
        let out = LabelTransferPolicy::default().transfer(&old, &new).unwrap();
        assert!(matches!(
            out.diagnostics[0],
            TransferDiagnostic::ObjectLost { best_ratio, .. } if (best_ratio - 0.25).abs() < 1e-9
        ));
        assert_eq!(out.segmentation.labels().as_slice(), &[2, 2, 2, 2]);
    }

    #[test]
    fn merge_without_preserve_maps_both_to_best() {
        let old = line(&[1, 1, 1, 0, 2, 2]);
        let new = line(&[1, 1, 1, 1, 1, 1]);
        let policy = LabelTransferPolicy::default().with_min_overlap(0.3);
        let out = policy.transfer(&old, &new).unwrap();
        assert_eq!(out.mapping.get(ObjectId(1)), Some(ObjectId(1)));
        assert_eq!(out.mapping.get(ObjectId(2)), Some(ObjectId(1)));
        assert_eq!(out.mapping.sources_of(ObjectId(1)).len(), 2);
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn merge_with_preserve_splits_along_seeds() {
        let old = line(&[1, 1, 1, 0, 2, 2]);
        let new = line(&[1, 1, 1, 1, 1, 1]);
        let seeds = line(&[7, 0, 0, 0, 0, 8]);
        let policy = LabelTransferPolicy::new(true).with_min_overlap(0.3);
        let out = policy.transfer_with_seeds(&old, &new, &seeds).unwrap();
        assert_eq!(out.segmentation.labels().as_slice(), &[1, 1, 1, 2, 2, 2]);
        assert_eq!(out.mapping.sources_of(ObjectId(1)), vec![ObjectId(1)]);
        assert_eq!(out.mapping.sources_of(ObjectId(2)), vec![ObjectId(2)]);
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn merge_with_preserve_and_single_seed_is_unresolved() {
        let old = line(&[1, 1, 1, 0, 2, 2]);
        let new = line(&[1, 1, 1, 1, 1, 1]);
        let seeds = line(&[7, 7, 0, 0, 0, 0]);
        let policy = LabelTransferPolicy::new(true).with_min_overlap(0.3);
        let out = policy.transfer_with_seeds(&old, &new, &seeds).unwrap();
        assert_eq!(
            out.diagnostics,
            vec![TransferDiagnostic::UnresolvedMerge {
                new: ObjectId(1),
                old: vec![ObjectId(1), ObjectId(2)],
            }]
        );
        assert_eq!(out.mapping.get(ObjectId(2)), None);
        assert_eq!(out.segmentation.labels().as_slice(), &[1; 6]);
    }

    #[test]
    fn shape_mismatch_is_error() {
        let err = LabelTransferPolicy::default()
            .transfer(&line(&[1, 1]), &line(&[1, 1, 1]))
            .unwrap_err();
        assert!(matches!(err, TransferError::ShapeMismatch { .. }));
    }

    #[test]
    fn annotations_follow_labels() {
        let old = line(&[1, 1, 1, 0, 2, 2, 0, 3]);
        let new = line(&[2, 2, 2, 0, 1, 1, 0, 0]);
        let out = LabelTransferPolicy::default().transfer(&old, &new).unwrap();
        let notes = BTreeMap::from([
            (ObjectId(1), "nucleus"),
            (ObjectId(2), "debris"),
            (ObjectId(3), "cell"),
        ]);
        let (carried, dropped) = out.mapping.carry(&notes);
        assert_eq!(carried[&ObjectId(1)], "nucleus");
        assert_eq!(carried[&ObjectId(2)], "debris");
        assert_eq!(dropped, vec![ObjectId(3)]);
    }

    #[test]
    fn merged_annotation_prefers_surviving_label() {
        let old = line(&[1, 1, 1, 0, 2, 2]);
        let new = line(&[1, 1, 1, 1, 1, 1]);
        let out = LabelTransferPolicy::default()
            .with_min_overlap(0.3)
            .transfer(&old, &new)
            .unwrap();
        let notes = BTreeMap::from([(ObjectId(1), "a"), (ObjectId(2), "b")]);
        let (carried, dropped) = out.mapping.carry(&notes);
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[&ObjectId(1)], "a");
        assert!(dropped.is_empty());
    }
}
