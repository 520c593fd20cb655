//! Serialized, cancellable recomputation on a background thread.
//!
//! Each run moves through `Queued → Running → {Completed | Cancelled |
//! Failed}`. At most one run is `Running`. A request arriving while a
//! run is in flight cancels it (the flag is checked between stages) and
//! queues one run covering the union of both dirty sets; further
//! requests merge into that queued run. Outputs are committed only when
//! a run completes, all at once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::diagnostics::{RunDiagnostics, StageRecord};
use crate::dirty::DirtinessTracker;
use crate::executor::{
    StageExecutor, StageOutput, StageOutputs, StageSlot, StagesOutcome, run_stages,
};
use crate::params::ParamChange;
use crate::segmentation::ObjectId;
use crate::stage::{DirtySet, PipelineStage};
use crate::transfer::{
    LabelMapping, LabelTransfer, LabelTransferPolicy, TransferDiagnostic, TransferError,
};
use crate::types::{Predictions, StageFailure, ThresholdConfig};

/// Lifecycle state of one run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// Waiting for the running run (if any) to finish or cancel.
    Queued,
    /// Computing stages.
    Running,
    /// All planned stages finished and were committed.
    Completed(Arc<RunDiagnostics>),
    /// Superseded by a newer request; nothing was committed.
    Cancelled,
    /// A stage failed; nothing was committed.
    Failed(StageFailure),
}

impl RunState {
    /// Returns `true` for `Completed`, `Cancelled` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Cancelled | Self::Failed(_))
    }
}

/// A run changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    /// Run id, increasing per coordinator.
    pub run_id: u64,
    /// Stages the run was asked to recompute.
    pub stages: DirtySet,
    /// The new state.
    pub state: RunState,
}

/// Errors starting a coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The worker thread could not be spawned.
    #[error("failed to spawn recompute thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
struct Job {
    run_id: u64,
    dirty: DirtySet,
}

struct State {
    config: ThresholdConfig,
    input: Arc<Predictions>,
    input_id: u64,
    min_overlap: f64,
    pending: Option<Job>,
    running: Option<Job>,
    committed: StageOutputs,
    last_failed: Option<DirtySet>,
    last_outcome: Option<RunState>,
    mapping: Option<LabelMapping>,
    annotations: BTreeMap<ObjectId, String>,
    next_run: u64,
    listeners: Vec<mpsc::Sender<RunEvent>>,
    shutdown: bool,
}

impl State {
    fn emit(&mut self, run_id: u64, stages: DirtySet, state: &RunState) {
        let event = RunEvent {
            run_id,
            stages,
            state: state.clone(),
        };
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    const fn is_idle(&self) -> bool {
        self.pending.is_none() && self.running.is_none()
    }
}

struct Shared {
    state: Mutex<State>,
    /// Signals the worker: new work or shutdown.
    work: Condvar,
    /// Signals waiters: the coordinator went idle.
    idle: Condvar,
    cancel: AtomicBool,
    executor: Box<dyn StageExecutor>,
    /// Runs on the worker just before label transfer.
    #[cfg(test)]
    transfer_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Shared {
    fn new(executor: Box<dyn StageExecutor>, input: Predictions, config: ThresholdConfig) -> Self {
        Self {
            state: Mutex::new(State {
                config,
                input: Arc::new(input),
                input_id: 0,
                min_overlap: LabelTransferPolicy::DEFAULT_MIN_OVERLAP,
                pending: None,
                running: None,
                committed: StageOutputs::default(),
                last_failed: None,
                last_outcome: None,
                mapping: None,
                annotations: BTreeMap::new(),
                next_run: 1,
                listeners: Vec::new(),
                shutdown: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            cancel: AtomicBool::new(false),
            executor,
            #[cfg(test)]
            transfer_hook: None,
        }
    }
}

/// Owns the pipeline's committed outputs and the thread that
/// recomputes them.
///
/// Dropping the coordinator cancels any run in flight and joins the
/// worker.
pub struct RecomputeCoordinator {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RecomputeCoordinator {
    /// Start a coordinator over `input`. Nothing runs until the first
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Spawn`] if the worker thread cannot
    /// be started.
    pub fn spawn(
        executor: impl StageExecutor,
        input: Predictions,
        config: ThresholdConfig,
    ) -> Result<Self, CoordinatorError> {
        Self::start(Shared::new(Box::new(executor), input, config))
    }

    fn start(shared: Shared) -> Result<Self, CoordinatorError> {
        let shared = Arc::new(shared);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("hysteron-recompute".into())
            .spawn(move || worker_loop(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Apply a parameter change and queue the stages it dirties.
    ///
    /// Returns the dirty set (empty for parameters no stage reads).
    pub fn notify(&self, change: &ParamChange) -> DirtySet {
        let dirty = DirtinessTracker::affected_stages([change.id]);
        let mut st = self.shared.state.lock();
        if !st.config.apply_change(change) {
            log::warn!(
                "ignoring {} = {}: value does not fit the parameter",
                change.id,
                change.new
            );
            return DirtySet::empty();
        }
        self.enqueue(&mut st, dirty);
        dirty
    }

    /// Queue a run over `dirty` (extended downstream), cancelling any
    /// run in flight. An empty set is ignored.
    pub fn request(&self, dirty: DirtySet) {
        let mut st = self.shared.state.lock();
        self.enqueue(&mut st, dirty);
    }

    /// Re-queue the stages of the last run if it failed.
    ///
    /// Returns `false` if there is nothing to retry.
    pub fn retry(&self) -> bool {
        let mut st = self.shared.state.lock();
        let Some(dirty) = st.last_failed.take() else {
            return false;
        };
        log::info!("retrying {dirty}");
        self.enqueue(&mut st, dirty);
        true
    }

    /// Replace the prediction input and recompute everything.
    ///
    /// Committed outputs stay visible until the new run completes.
    pub fn set_input(&self, input: Predictions) {
        let mut st = self.shared.state.lock();
        st.input = Arc::new(input);
        st.input_id += 1;
        self.enqueue(&mut st, DirtySet::all());
    }

    /// Set the minimum overlap ratio used by label transfer.
    pub fn set_min_overlap(&self, min_overlap: f64) {
        self.shared.state.lock().min_overlap = min_overlap;
    }

    /// Block until nothing is queued or running and return the state
    /// the last run ended in (`None` if no run ever ended).
    #[must_use = "returns the last run outcome"]
    pub fn wait_idle(&self) -> Option<RunState> {
        let mut st = self.shared.state.lock();
        while !st.is_idle() {
            self.shared.idle.wait(&mut st);
        }
        st.last_outcome.clone()
    }

    /// Returns `true` if nothing is queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().is_idle()
    }

    /// Receive every run event from now on.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.state.lock().listeners.push(tx);
        rx
    }

    /// The committed outputs.
    #[must_use]
    pub fn outputs(&self) -> StageOutputs {
        self.shared.state.lock().committed.clone()
    }

    /// The parameters the next run will use.
    #[must_use]
    pub fn config(&self) -> ThresholdConfig {
        self.shared.state.lock().config.clone()
    }

    /// Label mapping produced by the last transfer, if any.
    #[must_use]
    pub fn last_mapping(&self) -> Option<LabelMapping> {
        self.shared.state.lock().mapping.clone()
    }

    /// Attach a class label to a committed object. Annotations follow
    /// their object through later recomputations.
    pub fn annotate(&self, object: ObjectId, label: impl Into<String>) {
        self.shared
            .state
            .lock()
            .annotations
            .insert(object, label.into());
    }

    /// Current object annotations.
    #[must_use]
    pub fn annotations(&self) -> BTreeMap<ObjectId, String> {
        self.shared.state.lock().annotations.clone()
    }

    fn enqueue(&self, st: &mut State, dirty: DirtySet) {
        if dirty.is_empty() || st.shutdown {
            return;
        }
        let dirty = dirty.closed_downstream();
        if let Some(pending) = st.pending.as_mut() {
            pending.dirty = pending.dirty.union(dirty);
            log::debug!("run {} extended to {}", pending.run_id, pending.dirty);
        } else {
            let mut job = Job {
                run_id: st.next_run,
                dirty,
            };
            st.next_run += 1;
            if let Some(running) = st.running {
                job.dirty = job.dirty.union(running.dirty);
            }
            log::debug!("run {} queued: {}", job.run_id, job.dirty);
            st.pending = Some(job);
            st.emit(job.run_id, job.dirty, &RunState::Queued);
        }
        if let Some(running) = st.running {
            if !self.shared.cancel.swap(true, Ordering::AcqRel) {
                log::debug!("cancelling run {}", running.run_id);
            }
        }
        self.shared.work.notify_one();
    }
}

impl Drop for RecomputeCoordinator {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
            st.pending = None;
        }
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("recompute thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for RecomputeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("RecomputeCoordinator")
            .field("pending", &st.pending.map(|j| j.run_id))
            .field("running", &st.running.map(|j| j.run_id))
            .field("input_id", &st.input_id)
            .finish_non_exhaustive()
    }
}

/// Everything a run reads, captured when it starts.
struct RunSnapshot {
    job: Job,
    config: ThresholdConfig,
    input: Arc<Predictions>,
    input_id: u64,
    min_overlap: f64,
    committed: StageOutputs,
}

/// Label transfer of a completed run: the mapping and its diagnostics.
type Relabeled = Result<(LabelMapping, Vec<TransferDiagnostic>), TransferError>;

fn worker_loop(shared: &Shared) {
    while let Some(snapshot) = next_job(shared) {
        let mut outcome = run_stages(
            shared.executor.as_ref(),
            &snapshot.input,
            snapshot.input_id,
            &snapshot.config,
            &snapshot.committed,
            snapshot.job.dirty,
            &|| shared.cancel.load(Ordering::Acquire),
        );
        let relabeled = match &mut outcome {
            StagesOutcome::Completed {
                outputs, records, ..
            } => transfer_labels(shared, &snapshot, records, outputs),
            _ => None,
        };
        if relabeled.is_some() && shared.cancel.load(Ordering::Acquire) {
            outcome = StagesOutcome::Cancelled(None);
        }
        finish(shared, snapshot, outcome, relabeled);
    }
    log::debug!("recompute thread exiting");
}

/// Wait for a queued run and mark it `Running`. `None` on shutdown.
fn next_job(shared: &Shared) -> Option<RunSnapshot> {
    let mut st = shared.state.lock();
    let job = loop {
        if st.shutdown {
            return None;
        }
        if let Some(job) = st.pending.take() {
            break job;
        }
        shared.work.wait(&mut st);
    };
    shared.cancel.store(false, Ordering::Release);
    st.running = Some(job);
    log::debug!("run {} running: {}", job.run_id, job.dirty);
    st.emit(job.run_id, job.dirty, &RunState::Running);
    Some(RunSnapshot {
        job,
        config: st.config.clone(),
        input: Arc::clone(&st.input),
        input_id: st.input_id,
        min_overlap: st.min_overlap,
        committed: st.committed.clone(),
    })
}

fn finish(
    shared: &Shared,
    snapshot: RunSnapshot,
    outcome: StagesOutcome,
    relabeled: Option<Relabeled>,
) {
    let job = snapshot.job;
    let mut st = shared.state.lock();
    st.running = None;
    let state = match outcome {
        StagesOutcome::Completed {
            outputs,
            records,
            duration,
        } => {
            let transfer = relabeled.map_or_else(Vec::new, |r| commit_labels(&mut st, r));
            let diagnostics = RunDiagnostics {
                run_id: job.run_id,
                stages: records,
                total_duration: duration,
                object_count: outputs.objects().map_or(0, |o| o.object_count()),
                transfer,
            };
            log::info!(
                "run {} completed in {:?}: {} objects",
                job.run_id,
                duration,
                diagnostics.object_count
            );
            st.committed = outputs;
            st.last_failed = None;
            RunState::Completed(Arc::new(diagnostics))
        }
        StagesOutcome::Cancelled(at) => {
            match at {
                Some(stage) => log::debug!("run {} cancelled before {stage}", job.run_id),
                None => log::debug!("run {} cancelled after last stage", job.run_id),
            }
            RunState::Cancelled
        }
        StagesOutcome::Failed(failure) => {
            log::warn!("run {} failed: {failure}", job.run_id);
            st.last_failed = Some(job.dirty);
            RunState::Failed(failure)
        }
    };
    st.emit(job.run_id, job.dirty, &state);
    st.last_outcome = Some(state);
    if st.is_idle() {
        shared.idle.notify_all();
    }
}

/// Relabel the new objects after the previously committed ones.
///
/// Runs without the state lock: the committed objects only change when
/// this worker commits. Returns `None` if the run did not recompute the
/// objects or there is nothing to transfer from.
fn transfer_labels(
    shared: &Shared,
    snapshot: &RunSnapshot,
    records: &[StageRecord],
    outputs: &mut StageOutputs,
) -> Option<Relabeled> {
    let recomputed = records
        .iter()
        .any(|r| r.stage == PipelineStage::SizeFilter && !r.reused);
    if !recomputed {
        return None;
    }
    let (Some(old), Some(new), Some(cores)) = (
        snapshot.committed.objects(),
        outputs.objects(),
        outputs.cores(),
    ) else {
        return None;
    };
    #[cfg(test)]
    if let Some(hook) = &shared.transfer_hook {
        hook();
    }
    #[cfg(not(test))]
    let _ = shared;

    let policy = LabelTransferPolicy::new(snapshot.config.preserve_identities)
        .with_min_overlap(snapshot.min_overlap);
    let LabelTransfer {
        mapping,
        segmentation,
        diagnostics,
    } = match policy.transfer_with_seeds(old, new, cores) {
        Ok(t) => t,
        Err(e) => return Some(Err(e)),
    };
    for diag in &diagnostics {
        match diag {
            TransferDiagnostic::UnresolvedMerge { .. } => log::warn!("{diag}"),
            TransferDiagnostic::ObjectLost { .. } => log::info!("{diag}"),
        }
    }

    if let Some(slot) = outputs.get(PipelineStage::SizeFilter) {
        let relabeled = StageSlot {
            fingerprint: slot.fingerprint,
            output: StageOutput::Objects(Arc::new(segmentation)),
            diagnostics: slot.diagnostics.clone(),
        };
        outputs.insert(PipelineStage::SizeFilter, relabeled);
    }
    Some(Ok((mapping, diagnostics)))
}

/// Store the mapping of a committed run and move annotations along.
/// Returns the transfer diagnostics.
fn commit_labels(st: &mut State, relabeled: Relabeled) -> Vec<TransferDiagnostic> {
    let (mapping, diagnostics) = match relabeled {
        Ok(r) => r,
        Err(e) => {
            log::warn!("{e}; object labels and annotations reset");
            st.mapping = None;
            st.annotations.clear();
            return Vec::new();
        }
    };
    let (carried, dropped) = mapping.carry(&st.annotations);
    if !dropped.is_empty() {
        log::info!("dropped annotations of {} lost object(s)", dropped.len());
    }
    st.annotations = carried;
    st.mapping = Some(mapping);
    diagnostics
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::executor::ThresholdExecutor;
    use crate::params::{ParamId, ParamValue};
    use crate::types::{Shape, Volume};

    fn input() -> Predictions {
        let shape = Shape::new(10, 10, 1);
        let channel = Volume::from_fn(shape, |x, y, _| {
            if (2..6).contains(&x) && (2..6).contains(&y) { 0.95 } else { 0.0 }
        });
        Predictions::new(vec![channel]).unwrap()
    }

    fn config() -> ThresholdConfig {
        ThresholdConfig {
            sigma_x: 0.0,
            sigma_y: 0.0,
            sigma_z: 0.0,
            high_threshold: 0.9,
            low_threshold: 0.5,
            min_size: 1,
            ..ThresholdConfig::default()
        }
    }

    fn change(id: ParamId, old: ParamValue, new: ParamValue) -> ParamChange {
        ParamChange { id, old, new }
    }

    #[test]
    fn idle_coordinator_has_no_outcome() {
        let c = RecomputeCoordinator::spawn(ThresholdExecutor, input(), config()).unwrap();
        assert!(c.is_idle());
        assert_eq!(c.wait_idle(), None);
    }

    #[test]
    fn first_request_computes_everything() {
        let c = RecomputeCoordinator::spawn(ThresholdExecutor, input(), config()).unwrap();
        c.request(PipelineStage::SizeFilter.downstream_inclusive());
        let diag = match c.wait_idle() {
            Some(RunState::Completed(diag)) => Some(diag),
            _ => None,
        }
        .unwrap();
        assert_eq!(diag.recomputed().count(), 5);
        assert_eq!(c.outputs().objects().unwrap().object_count(), 1);
    }

    #[test]
    fn show_debug_queues_nothing() {
        let c = RecomputeCoordinator::spawn(ThresholdExecutor, input(), config()).unwrap();
        let dirty = c.notify(&change(
            ParamId::ShowDebug,
            ParamValue::Bool(false),
            ParamValue::Bool(true),
        ));
        assert!(dirty.is_empty());
        assert!(c.config().show_debug);
        assert_eq!(c.wait_idle(), None);
    }

    #[test]
    fn failure_keeps_outputs_and_retry_recovers() {
        let c = RecomputeCoordinator::spawn(ThresholdExecutor, input(), config()).unwrap();
        c.request(DirtySet::all());
        let _ = c.wait_idle();
        let before = c.outputs();

        c.notify(&change(ParamId::Channel, ParamValue::Int(0), ParamValue::Int(2)));
        assert!(matches!(c.wait_idle(), Some(RunState::Failed(_))));
        assert_eq!(c.outputs(), before);

        c.notify(&change(ParamId::Channel, ParamValue::Int(2), ParamValue::Int(0)));
        assert!(matches!(c.wait_idle(), Some(RunState::Completed(_))));
        assert!(!c.retry());
    }

    #[test]
    fn annotations_survive_recompute() {
        let c = RecomputeCoordinator::spawn(ThresholdExecutor, input(), config()).unwrap();
        c.request(DirtySet::all());
        let _ = c.wait_idle();
        c.annotate(ObjectId(1), "nucleus");

        c.notify(&change(
            ParamId::Lambda,
            ParamValue::Float(0.2),
            ParamValue::Float(0.3),
        ));
        let _ = c.wait_idle();
        assert_eq!(c.annotations()[&ObjectId(1)], "nucleus");
        assert!(c.last_mapping().unwrap().is_identity());
    }

    #[test]
    fn events_follow_lifecycle() {
        let c = RecomputeCoordinator::spawn(ThresholdExecutor, input(), config()).unwrap();
        let rx = c.subscribe();
        c.request(DirtySet::all());
        let _ = c.wait_idle();
        let states: Vec<RunState> = rx.try_iter().map(|e| e.state).collect();
        assert_eq!(states.len(), 3);
        assert_eq!(states[0], RunState::Queued);
        assert_eq!(states[1], RunState::Running);
        assert!(matches!(states[2], RunState::Completed(_)));
    }

    #[test]
    fn parameter_writes_do_not_wait_for_label_transfer() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let mut shared = Shared::new(Box::new(ThresholdExecutor), input(), config());
        shared.transfer_hook = Some(Box::new(move || {
            let _ = entered_tx.lock().send(());
            let _ = release_rx.lock().recv();
        }));
        let c = RecomputeCoordinator::start(shared).unwrap();

        // The first run has nothing to transfer from.
        c.request(DirtySet::all());
        let _ = c.wait_idle();

        c.notify(&change(
            ParamId::Lambda,
            ParamValue::Float(0.2),
            ParamValue::Float(0.3),
        ));
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::scope(|s| {
            s.spawn(|| {
                c.notify(&change(
                    ParamId::ShowDebug,
                    ParamValue::Bool(false),
                    ParamValue::Bool(true),
                ));
                done_tx.send(()).unwrap();
            });
            let returned = done_rx.recv_timeout(Duration::from_secs(5)).is_ok();
            release_tx.send(()).unwrap();
            assert!(returned, "notify blocked behind label transfer");
        });

        assert!(c.config().show_debug);
        assert!(matches!(c.wait_idle(), Some(RunState::Completed(_))));
        assert!(c.last_mapping().unwrap().is_identity());
    }

    #[test]
    fn edit_during_transfer_cancels_the_run() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let mut shared = Shared::new(Box::new(ThresholdExecutor), input(), config());
        shared.transfer_hook = Some(Box::new(move || {
            let _ = entered_tx.lock().send(());
            let _ = release_rx.lock().recv();
        }));
        let c = RecomputeCoordinator::start(shared).unwrap();
        c.request(DirtySet::all());
        let _ = c.wait_idle();
        let events = c.subscribe();

        c.notify(&change(
            ParamId::Lambda,
            ParamValue::Float(0.2),
            ParamValue::Float(0.3),
        ));
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        c.notify(&change(
            ParamId::MinSize,
            ParamValue::Int(1),
            ParamValue::Int(2),
        ));
        release_tx.send(()).unwrap();
        // The follow-up run transfers again.
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        release_tx.send(()).unwrap();
        let _ = c.wait_idle();

        let ends: Vec<RunState> = events
            .try_iter()
            .filter(|e| e.state.is_terminal())
            .map(|e| e.state)
            .collect();
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[0], RunState::Cancelled);
        assert!(matches!(ends[1], RunState::Completed(_)));
    }
}
