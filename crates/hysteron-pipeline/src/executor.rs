//! Stage execution and the committed output cache.
//!
//! A [`StageExecutor`] computes one stage from its inputs. The
//! coordinator drives it stage by stage over a private copy of the
//! committed [`StageOutputs`], so nothing a run produces is visible
//! until the whole run is committed.
//!
//! Every stored output carries a fingerprint: a SipHash over the stage,
//! the parameters that stage reads, and the fingerprint of its upstream
//! output (or the input id for the first stage). A planned stage whose
//! fingerprint matches the committed one is reused instead of
//! recomputed, so undoing an edit before the next run costs nothing.

use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use siphasher::sip::SipHasher13;

use crate::diagnostics::{StageDiagnostics, StageMetrics, StageRecord};
use crate::dirty::DirtinessTracker;
use crate::params::ParamValue;
use crate::segmentation::Segmentation;
use crate::stage::{DirtySet, PipelineStage, STAGE_COUNT};
use crate::types::{Mask, Predictions, StageError, StageFailure, ThresholdConfig, Volume};
use crate::{size_filter, smooth, threshold, weighting};

/// The product of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Smoothed prediction channel.
    Smoothed(Arc<Volume<f32>>),
    /// Labeled core objects.
    Cores(Arc<Segmentation>),
    /// Hysteresis foreground mask.
    Foreground(Arc<Mask>),
    /// Regularized foreground mask.
    Regularized(Arc<Mask>),
    /// Final size-filtered objects.
    Objects(Arc<Segmentation>),
}

impl StageOutput {
    /// The stage that produces this kind of output.
    #[must_use]
    pub const fn stage(&self) -> PipelineStage {
        match self {
            Self::Smoothed(_) => PipelineStage::Smoothing,
            Self::Cores(_) => PipelineStage::CoreThreshold,
            Self::Foreground(_) => PipelineStage::FinalThreshold,
            Self::Regularized(_) => PipelineStage::LambdaWeighting,
            Self::Objects(_) => PipelineStage::SizeFilter,
        }
    }
}

/// A freshly computed stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedStage {
    /// The output.
    pub output: StageOutput,
    /// What the computation produced, for diagnostics.
    pub metrics: StageMetrics,
}

/// A stored stage output.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSlot {
    /// Hash of everything the output was computed from.
    pub fingerprint: u64,
    /// The output itself.
    pub output: StageOutput,
    /// Timing and metrics of the computation that produced it.
    pub diagnostics: StageDiagnostics,
}

/// One output slot per stage.
///
/// Cloning is cheap: outputs are reference counted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutputs {
    slots: [Option<StageSlot>; STAGE_COUNT],
}

impl StageOutputs {
    /// The slot of `stage`, if it has been computed.
    #[must_use]
    pub fn get(&self, stage: PipelineStage) -> Option<&StageSlot> {
        self.slots[stage.index()].as_ref()
    }

    /// Stages with no output.
    #[must_use]
    pub fn missing(&self) -> DirtySet {
        PipelineStage::ALL
            .into_iter()
            .filter(|s| self.get(*s).is_none())
            .collect()
    }

    /// The smoothed channel.
    #[must_use]
    pub fn smoothed(&self) -> Option<&Volume<f32>> {
        match self.get(PipelineStage::Smoothing).map(|s| &s.output) {
            Some(StageOutput::Smoothed(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// The core objects.
    #[must_use]
    pub fn cores(&self) -> Option<&Segmentation> {
        match self.get(PipelineStage::CoreThreshold).map(|s| &s.output) {
            Some(StageOutput::Cores(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// The hysteresis foreground.
    #[must_use]
    pub fn foreground(&self) -> Option<&Mask> {
        match self.get(PipelineStage::FinalThreshold).map(|s| &s.output) {
            Some(StageOutput::Foreground(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// The regularized foreground.
    #[must_use]
    pub fn regularized(&self) -> Option<&Mask> {
        match self.get(PipelineStage::LambdaWeighting).map(|s| &s.output) {
            Some(StageOutput::Regularized(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// The final objects.
    #[must_use]
    pub fn objects(&self) -> Option<&Segmentation> {
        match self.get(PipelineStage::SizeFilter).map(|s| &s.output) {
            Some(StageOutput::Objects(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn insert(&mut self, stage: PipelineStage, slot: StageSlot) {
        self.slots[stage.index()] = Some(slot);
    }
}

/// What a stage computation may read.
#[derive(Debug, Clone, Copy)]
pub struct StageInputs<'a> {
    /// The prediction input.
    pub predictions: &'a Predictions,
    /// Parameter snapshot for this run.
    pub config: &'a ThresholdConfig,
    /// Outputs of the stages already run (or reused) in this run.
    pub outputs: &'a StageOutputs,
}

impl StageInputs<'_> {
    fn need<T>(value: Option<T>, stage: PipelineStage) -> Result<T, StageError> {
        value.ok_or(StageError::MissingInput(stage))
    }

    /// The smoothed channel, or [`StageError::MissingInput`].
    ///
    /// # Errors
    ///
    /// Fails if smoothing has not produced an output.
    pub fn smoothed(&self) -> Result<&Volume<f32>, StageError> {
        Self::need(self.outputs.smoothed(), PipelineStage::Smoothing)
    }

    /// The core objects, or [`StageError::MissingInput`].
    ///
    /// # Errors
    ///
    /// Fails if the core threshold has not produced an output.
    pub fn cores(&self) -> Result<&Segmentation, StageError> {
        Self::need(self.outputs.cores(), PipelineStage::CoreThreshold)
    }

    /// The hysteresis foreground, or [`StageError::MissingInput`].
    ///
    /// # Errors
    ///
    /// Fails if the final threshold has not produced an output.
    pub fn foreground(&self) -> Result<&Mask, StageError> {
        Self::need(self.outputs.foreground(), PipelineStage::FinalThreshold)
    }

    /// The regularized foreground, or [`StageError::MissingInput`].
    ///
    /// # Errors
    ///
    /// Fails if lambda weighting has not produced an output.
    pub fn regularized(&self) -> Result<&Mask, StageError> {
        Self::need(self.outputs.regularized(), PipelineStage::LambdaWeighting)
    }
}

/// Computes pipeline stages.
///
/// Implementations must be pure with respect to their inputs: the
/// coordinator reuses outputs whose fingerprint is unchanged.
pub trait StageExecutor: Send + Sync + 'static {
    /// Compute `stage`.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] if the stage cannot be computed; the run
    /// then fails in this stage.
    fn execute(
        &self,
        stage: PipelineStage,
        inputs: &StageInputs<'_>,
    ) -> Result<ComputedStage, StageError>;
}

/// The thresholding pipeline: smoothing, hysteresis, Potts weighting,
/// size filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdExecutor;

impl StageExecutor for ThresholdExecutor {
    fn execute(
        &self,
        stage: PipelineStage,
        inputs: &StageInputs<'_>,
    ) -> Result<ComputedStage, StageError> {
        let config = inputs.config;
        let computed = match stage {
            PipelineStage::Smoothing => {
                let channel = inputs.predictions.channel(config.channel)?;
                let sigmas = config.sigmas();
                ComputedStage {
                    output: StageOutput::Smoothed(Arc::new(smooth::gaussian_smooth(
                        channel, sigmas,
                    ))),
                    metrics: StageMetrics::Smoothing {
                        channel: config.channel,
                        sigmas,
                        shape: channel.shape(),
                    },
                }
            }
            PipelineStage::CoreThreshold => {
                let cores = threshold::core_objects(inputs.smoothed()?, config.high_threshold);
                let metrics = StageMetrics::CoreThreshold {
                    high_threshold: config.high_threshold,
                    core_count: cores.object_count(),
                    core_voxels: cores.foreground().count(),
                };
                ComputedStage {
                    output: StageOutput::Cores(Arc::new(cores)),
                    metrics,
                }
            }
            PipelineStage::FinalThreshold => {
                let mask = threshold::hysteresis(
                    inputs.smoothed()?,
                    inputs.cores()?,
                    config.low_threshold,
                );
                let metrics = StageMetrics::FinalThreshold {
                    low_threshold: config.low_threshold,
                    foreground_voxels: mask.count(),
                };
                ComputedStage {
                    output: StageOutput::Foreground(Arc::new(mask)),
                    metrics,
                }
            }
            PipelineStage::LambdaWeighting => {
                let result = weighting::potts_regularize(
                    inputs.foreground()?,
                    inputs.smoothed()?,
                    config.low_threshold,
                    config.lambda,
                );
                ComputedStage {
                    output: StageOutput::Regularized(Arc::new(result.mask)),
                    metrics: StageMetrics::LambdaWeighting {
                        lambda: config.lambda,
                        flipped_voxels: result.flipped,
                        sweeps: result.sweeps,
                    },
                }
            }
            PipelineStage::SizeFilter => {
                let labeled = size_filter::label_objects(
                    inputs.regularized()?,
                    inputs.cores()?,
                    config.preserve_identities,
                );
                let kept = size_filter::filter_by_size(&labeled, config.min_size, config.max_size);
                let metrics = StageMetrics::SizeFilter {
                    min_size: config.min_size,
                    max_size: config.max_size,
                    preserve_identities: config.preserve_identities,
                    objects_before: labeled.object_count(),
                    objects_after: kept.object_count(),
                };
                ComputedStage {
                    output: StageOutput::Objects(Arc::new(kept)),
                    metrics,
                }
            }
        };
        Ok(computed)
    }
}

/// Fingerprint of `stage` computed under `config` from an upstream
/// output (or input) fingerprinted `upstream`.
#[must_use]
pub fn fingerprint(stage: PipelineStage, config: &ThresholdConfig, upstream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x6879_7374, 0x6572_6f6e);
    hasher.write_usize(stage.index());
    hasher.write_u64(upstream);
    for id in DirtinessTracker::parameters_of(stage) {
        match config.value(id) {
            ParamValue::Int(v) => hasher.write_i64(v),
            ParamValue::Float(v) => hasher.write_u64(v.to_bits()),
            ParamValue::Bool(v) => hasher.write_u8(u8::from(v)),
        }
    }
    hasher.finish()
}

/// How [`run_stages`] ended.
#[derive(Debug)]
pub(crate) enum StagesOutcome {
    Completed {
        outputs: StageOutputs,
        records: Vec<StageRecord>,
        duration: Duration,
    },
    /// Cancelled before `stage` started (`None`: after the last stage).
    Cancelled(Option<PipelineStage>),
    Failed(StageFailure),
}

/// Stages of a run that went to completion.
#[derive(Debug)]
pub(crate) struct CompletedRun {
    pub outputs: StageOutputs,
    pub records: Vec<StageRecord>,
    pub duration: Duration,
}

/// Why a cancellable run stopped early.
enum Interrupted {
    Cancelled(Option<PipelineStage>),
    Failed(StageFailure),
}

impl From<StageFailure> for Interrupted {
    fn from(failure: StageFailure) -> Self {
        Self::Failed(failure)
    }
}

/// Run the stages `dirty` (plus any without committed output, closed
/// downstream) on a copy of `committed`.
///
/// `cancelled` is polled before every stage and once after the last.
pub(crate) fn run_stages(
    executor: &dyn StageExecutor,
    predictions: &Predictions,
    input_id: u64,
    config: &ThresholdConfig,
    committed: &StageOutputs,
    dirty: DirtySet,
    cancelled: &dyn Fn() -> bool,
) -> StagesOutcome {
    let checkpoint = |next: Option<PipelineStage>| {
        if cancelled() {
            Err(Interrupted::Cancelled(next))
        } else {
            Ok(())
        }
    };
    let run = RunPlan {
        executor,
        predictions,
        input_id,
        config,
    };
    match run.execute(committed, dirty, &checkpoint) {
        Ok(CompletedRun {
            outputs,
            records,
            duration,
        }) => StagesOutcome::Completed {
            outputs,
            records,
            duration,
        },
        Err(Interrupted::Cancelled(at)) => StagesOutcome::Cancelled(at),
        Err(Interrupted::Failed(failure)) => StagesOutcome::Failed(failure),
    }
}

/// Run every stage from scratch with no way to cancel.
///
/// # Errors
///
/// Returns the failure of the first stage that fails.
pub(crate) fn run_all_stages(
    executor: &dyn StageExecutor,
    predictions: &Predictions,
    config: &ThresholdConfig,
) -> Result<CompletedRun, StageFailure> {
    let run = RunPlan {
        executor,
        predictions,
        input_id: 0,
        config,
    };
    run.execute(&StageOutputs::default(), DirtySet::all(), &|_| Ok(()))
}

struct RunPlan<'a> {
    executor: &'a dyn StageExecutor,
    predictions: &'a Predictions,
    input_id: u64,
    config: &'a ThresholdConfig,
}

impl RunPlan<'_> {
    /// `checkpoint` is called with the next stage before every stage and
    /// with `None` after the last; an error stops the run.
    fn execute<E: From<StageFailure>>(
        &self,
        committed: &StageOutputs,
        dirty: DirtySet,
        checkpoint: &dyn Fn(Option<PipelineStage>) -> Result<(), E>,
    ) -> Result<CompletedRun, E> {
        let start = web_time::Instant::now();
        let plan = dirty.union(committed.missing()).closed_downstream();
        let mut working = committed.clone();
        let mut records = Vec::with_capacity(plan.len());

        for stage in plan.iter() {
            checkpoint(Some(stage))?;
            let upstream = stage
                .previous()
                .and_then(|p| working.get(p))
                .map_or(self.input_id, |slot| slot.fingerprint);
            let print = fingerprint(stage, self.config, upstream);

            if let Some(slot) = working.get(stage).filter(|s| s.fingerprint == print) {
                log::debug!("{stage}: reusing committed output");
                records.push(StageRecord {
                    stage,
                    reused: true,
                    diagnostics: slot.diagnostics.clone(),
                });
                continue;
            }

            let stage_start = web_time::Instant::now();
            let inputs = StageInputs {
                predictions: self.predictions,
                config: self.config,
                outputs: &working,
            };
            let computed = self
                .executor
                .execute(stage, &inputs)
                .map_err(|source| StageFailure { stage, source })?;
            let diagnostics = StageDiagnostics {
                duration: stage_start.elapsed(),
                metrics: computed.metrics,
            };
            log::debug!("{stage}: computed in {:?}", diagnostics.duration);
            records.push(StageRecord {
                stage,
                reused: false,
                diagnostics: diagnostics.clone(),
            });
            working.insert(
                stage,
                StageSlot {
                    fingerprint: print,
                    output: computed.output,
                    diagnostics,
                },
            );
        }

        checkpoint(None)?;
        Ok(CompletedRun {
            outputs: working,
            records,
            duration: start.elapsed(),
        })
    }
}
