//! hysteron-pipeline: parameter-driven hysteresis thresholding of
//! prediction maps.
//!
//! Turns a multi-channel prediction volume into labeled objects through:
//! smoothing -> core threshold -> final threshold -> lambda weighting ->
//! size filter.
//!
//! The interesting part is the binding between parameters and that
//! pipeline:
//!
//! - [`ParameterStore`] validates writes and announces every accepted
//!   change to its subscribers, in order, before the write returns.
//! - [`DirtinessTracker`] maps changed parameters to the stages that
//!   must be recomputed.
//! - [`RecomputeCoordinator`] runs those stages on a background thread,
//!   cancelling superseded runs and committing outputs atomically.
//! - [`LabelTransferPolicy`] keeps object labels stable across runs.
//!
//! [`Session`] wires the first three together for one applet lifetime.
//! [`process`] runs the whole pipeline synchronously, without any of
//! the above.

pub mod components;
pub mod coordinator;
pub mod diagnostics;
pub mod dirty;
pub mod executor;
pub mod params;
pub mod segmentation;
pub mod session;
pub mod size_filter;
pub mod smooth;
pub mod stage;
pub mod threshold;
pub mod transfer;
pub mod types;
pub mod weighting;

pub use coordinator::{CoordinatorError, RecomputeCoordinator, RunEvent, RunState};
pub use diagnostics::{RunDiagnostics, StageDiagnostics, StageMetrics, StageRecord};
pub use dirty::DirtinessTracker;
pub use executor::{
    ComputedStage, StageExecutor, StageInputs, StageOutput, StageOutputs, StageSlot,
    ThresholdExecutor,
};
pub use params::{
    ParamChange, ParamError, ParamId, ParamKind, ParamSpec, ParamValue, ParameterStore,
    RangeError, SubscriptionId,
};
pub use segmentation::{ObjectId, Segmentation};
pub use session::{Session, SessionError};
pub use stage::{DirtySet, PipelineStage};
pub use transfer::{
    LabelMapping, LabelTransfer, LabelTransferPolicy, TransferDiagnostic, TransferError,
};
pub use types::{
    Mask, Predictions, Shape, StageError, StageFailure, ThresholdConfig, Volume, VolumeError,
};

use executor::{CompletedRun, run_all_stages};

/// Result of a synchronous [`process`] call.
#[derive(Debug, Clone)]
pub struct Processed {
    /// Every stage's output.
    pub outputs: StageOutputs,
    /// Per-stage timing and metrics.
    pub diagnostics: RunDiagnostics,
}

impl Processed {
    /// The final objects.
    #[must_use]
    pub fn objects(&self) -> Option<&Segmentation> {
        self.outputs.objects()
    }
}

/// Run every stage once on the calling thread.
///
/// No caching, cancellation or label transfer is involved; this is the
/// pipeline as a pure function of its inputs.
///
/// # Errors
///
/// Returns the [`StageFailure`] of the first stage that fails, e.g.
/// [`StageError::ChannelOutOfRange`] from smoothing.
pub fn process(
    predictions: &Predictions,
    config: &ThresholdConfig,
) -> Result<Processed, StageFailure> {
    let CompletedRun {
        outputs,
        records,
        duration,
    } = run_all_stages(&ThresholdExecutor, predictions, config)?;
    let object_count = outputs.objects().map_or(0, Segmentation::object_count);
    Ok(Processed {
        outputs,
        diagnostics: RunDiagnostics {
            run_id: 0,
            stages: records,
            total_duration: duration,
            object_count,
            transfer: Vec::new(),
        },
    })
}
