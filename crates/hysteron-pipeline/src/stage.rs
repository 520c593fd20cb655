//! Pipeline stage identifiers and the [`DirtySet`] of stages awaiting
//! recomputation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Total number of stages in the pipeline.
pub const STAGE_COUNT: usize = 5;

/// One ordered step of the thresholding pipeline.
///
/// The derived ordering is pipeline order: every stage reads only from
/// stages that compare less than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    /// Channel selection and anisotropic Gaussian smoothing.
    Smoothing,
    /// High threshold: seed (core) objects.
    CoreThreshold,
    /// Low threshold: hysteresis growth from the cores.
    FinalThreshold,
    /// Pairwise (Potts) regularization weighted by lambda.
    LambdaWeighting,
    /// Object labeling and min/max size filtering.
    SizeFilter,
}

impl PipelineStage {
    /// All stages in pipeline order.
    pub const ALL: [Self; STAGE_COUNT] = [
        Self::Smoothing,
        Self::CoreThreshold,
        Self::FinalThreshold,
        Self::LambdaWeighting,
        Self::SizeFilter,
    ];

    /// Zero-based position in pipeline order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Smoothing => 0,
            Self::CoreThreshold => 1,
            Self::FinalThreshold => 2,
            Self::LambdaWeighting => 3,
            Self::SizeFilter => 4,
        }
    }

    /// Human-readable name (e.g. `"smoothing"`).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Smoothing => "smoothing",
            Self::CoreThreshold => "core threshold",
            Self::FinalThreshold => "final threshold",
            Self::LambdaWeighting => "lambda weighting",
            Self::SizeFilter => "size filter",
        }
    }

    /// The stage directly upstream, or `None` for [`Smoothing`](Self::Smoothing).
    #[must_use]
    pub const fn previous(self) -> Option<Self> {
        match self {
            Self::Smoothing => None,
            Self::CoreThreshold => Some(Self::Smoothing),
            Self::FinalThreshold => Some(Self::CoreThreshold),
            Self::LambdaWeighting => Some(Self::FinalThreshold),
            Self::SizeFilter => Some(Self::LambdaWeighting),
        }
    }

    /// This stage and every stage after it.
    #[must_use]
    pub fn downstream_inclusive(self) -> DirtySet {
        Self::ALL
            .into_iter()
            .filter(|s| *s >= self)
            .collect()
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of stages that must be recomputed.
///
/// A bit set over [`PipelineStage`]; iteration is always in pipeline
/// order regardless of insertion order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirtySet(u8);

impl DirtySet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every stage.
    #[must_use]
    pub const fn all() -> Self {
        Self((1 << STAGE_COUNT) - 1)
    }

    const fn bit(stage: PipelineStage) -> u8 {
        1 << stage.index()
    }

    /// Add a stage.
    pub const fn insert(&mut self, stage: PipelineStage) {
        self.0 |= Self::bit(stage);
    }

    /// Whether `stage` is in the set.
    #[must_use]
    pub const fn contains(self, stage: PipelineStage) -> bool {
        self.0 & Self::bit(stage) != 0
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Stages in `self` but not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns `true` if no stage is dirty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of dirty stages.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// The earliest dirty stage in pipeline order.
    #[must_use]
    pub fn first(self) -> Option<PipelineStage> {
        self.iter().next()
    }

    /// Dirty stages in pipeline order.
    pub fn iter(self) -> impl Iterator<Item = PipelineStage> {
        PipelineStage::ALL
            .into_iter()
            .filter(move |s| self.contains(*s))
    }

    /// Extend the set so that it is closed downstream: if a stage is
    /// dirty, so is every stage after it.
    #[must_use]
    pub fn closed_downstream(self) -> Self {
        self.first()
            .map_or_else(Self::empty, PipelineStage::downstream_inclusive)
    }
}

impl FromIterator<PipelineStage> for DirtySet {
    fn from_iter<I: IntoIterator<Item = PipelineStage>>(iter: I) -> Self {
        let mut set = Self::empty();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

impl Extend<PipelineStage> for DirtySet {
    fn extend<I: IntoIterator<Item = PipelineStage>>(&mut self, iter: I) {
        for stage in iter {
            self.insert(stage);
        }
    }
}

impl fmt::Debug for DirtySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for DirtySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, stage) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(stage.name())?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_in_pipeline_order() {
        for pair in PipelineStage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
        for (i, stage) in PipelineStage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn downstream_of_smoothing_is_everything() {
        assert_eq!(
            PipelineStage::Smoothing.downstream_inclusive(),
            DirtySet::all()
        );
    }

    #[test]
    fn downstream_of_size_filter_is_itself() {
        let set = PipelineStage::SizeFilter.downstream_inclusive();
        assert_eq!(set.len(), 1);
        assert!(set.contains(PipelineStage::SizeFilter));
    }

    #[test]
    fn iteration_ignores_insertion_order() {
        let a: DirtySet = [PipelineStage::SizeFilter, PipelineStage::Smoothing]
            .into_iter()
            .collect();
        let b: DirtySet = [PipelineStage::Smoothing, PipelineStage::SizeFilter]
            .into_iter()
            .collect();
        assert_eq!(a, b);
        assert_eq!(
            a.iter().collect::<Vec<_>>(),
            vec![PipelineStage::Smoothing, PipelineStage::SizeFilter]
        );
    }

    #[test]
    fn closed_downstream_fills_gaps() {
        let set: DirtySet = [PipelineStage::FinalThreshold].into_iter().collect();
        let closed = set.closed_downstream();
        assert_eq!(closed.len(), 3);
        assert!(!closed.contains(PipelineStage::CoreThreshold));
        assert!(DirtySet::empty().closed_downstream().is_empty());
    }

    #[test]
    fn union_and_difference() {
        let a = PipelineStage::LambdaWeighting.downstream_inclusive();
        let b = PipelineStage::CoreThreshold.downstream_inclusive();
        assert_eq!(a.union(b), b);
        assert_eq!(
            b.difference(a).iter().collect::<Vec<_>>(),
            vec![PipelineStage::CoreThreshold, PipelineStage::FinalThreshold]
        );
    }

    #[test]
    fn display_lists_names() {
        let set: DirtySet = [PipelineStage::SizeFilter, PipelineStage::Smoothing]
            .into_iter()
            .collect();
        assert_eq!(set.to_string(), "{smoothing, size filter}");
    }
}
