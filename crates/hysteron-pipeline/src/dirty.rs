//! Parameter → stage invalidation.
//!
//! Each parameter enters the pipeline at exactly one stage (or none).
//! Changing it dirties that stage and everything downstream of it:
//!
//! | parameter | enters at |
//! |-----------|-----------|
//! | channel, sigma x/y/z | smoothing |
//! | high threshold | core threshold |
//! | low threshold | final threshold |
//! | lambda | lambda weighting |
//! | min/max size, preserve identities | size filter |
//! | show debug | (none) |

use crate::params::ParamId;
use crate::stage::{DirtySet, PipelineStage};

/// Static dependency table between parameters and pipeline stages.
///
/// Stateless: every answer is a pure function of its arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtinessTracker;

impl DirtinessTracker {
    /// The first stage that reads `id`, or `None` if no stage does.
    #[must_use]
    pub const fn entry_stage(id: ParamId) -> Option<PipelineStage> {
        match id {
            ParamId::Channel | ParamId::SigmaX | ParamId::SigmaY | ParamId::SigmaZ => {
                Some(PipelineStage::Smoothing)
            }
            ParamId::HighThreshold => Some(PipelineStage::CoreThreshold),
            ParamId::LowThreshold => Some(PipelineStage::FinalThreshold),
            ParamId::Lambda => Some(PipelineStage::LambdaWeighting),
            ParamId::MinSize | ParamId::MaxSize | ParamId::PreserveIdentities => {
                Some(PipelineStage::SizeFilter)
            }
            ParamId::ShowDebug => None,
        }
    }

    /// Parameters read by `stage` itself (not by its upstream stages).
    #[must_use]
    pub fn parameters_of(stage: PipelineStage) -> Vec<ParamId> {
        ParamId::ALL
            .into_iter()
            .filter(|id| Self::entry_stage(*id) == Some(stage))
            .collect()
    }

    /// Stages to recompute after `changed` parameters changed.
    #[must_use]
    pub fn affected_stages(changed: impl IntoIterator<Item = ParamId>) -> DirtySet {
        changed
            .into_iter()
            .filter_map(Self::entry_stage)
            .map(PipelineStage::downstream_inclusive)
            .fold(DirtySet::empty(), DirtySet::union)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(set: DirtySet) -> Vec<PipelineStage> {
        set.iter().collect()
    }

    #[test]
    fn max_size_dirties_only_size_filter() {
        let set = DirtinessTracker::affected_stages([ParamId::MaxSize]);
        assert_eq!(stages(set), vec![PipelineStage::SizeFilter]);
    }

    #[test]
    fn sigma_y_dirties_everything() {
        let set = DirtinessTracker::affected_stages([ParamId::SigmaY]);
        assert_eq!(set, DirtySet::all());
    }

    #[test]
    fn low_threshold_dirties_final_and_below() {
        let set = DirtinessTracker::affected_stages([ParamId::LowThreshold]);
        assert_eq!(
            stages(set),
            vec![
                PipelineStage::FinalThreshold,
                PipelineStage::LambdaWeighting,
                PipelineStage::SizeFilter,
            ]
        );
    }

    #[test]
    fn high_threshold_dirties_core_and_below() {
        let set = DirtinessTracker::affected_stages([ParamId::HighThreshold]);
        assert_eq!(set, PipelineStage::CoreThreshold.downstream_inclusive());
    }

    #[test]
    fn channel_dirties_everything() {
        assert_eq!(
            DirtinessTracker::affected_stages([ParamId::Channel]),
            DirtySet::all()
        );
    }

    #[test]
    fn show_debug_dirties_nothing() {
        assert!(DirtinessTracker::affected_stages([ParamId::ShowDebug]).is_empty());
        assert!(DirtinessTracker::affected_stages(Vec::<ParamId>::new()).is_empty());
    }

    #[test]
    fn union_is_earliest_entry_downstream() {
        let set = DirtinessTracker::affected_stages([ParamId::MinSize, ParamId::Lambda]);
        assert_eq!(set, PipelineStage::LambdaWeighting.downstream_inclusive());
    }

    #[test]
    fn every_result_is_closed_downstream() {
        for id in ParamId::ALL {
            let set = DirtinessTracker::affected_stages([id]);
            assert_eq!(set, set.closed_downstream(), "{id}");
        }
    }

    #[test]
    fn parameters_of_partitions_the_table() {
        let total: usize = PipelineStage::ALL
            .into_iter()
            .map(|s| DirtinessTracker::parameters_of(s).len())
            .sum();
        // Everything except show_debug enters somewhere.
        assert_eq!(total, ParamId::COUNT - 1);
        assert_eq!(
            DirtinessTracker::parameters_of(PipelineStage::LambdaWeighting),
            vec![ParamId::Lambda]
        );
    }
}
