//! Integration tests: recomputation through a session and coordinator,
//! including cancellation, failure, and concurrent edits.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hysteron_pipeline::{
    ComputedStage, DirtySet, ParamId, PipelineStage, Predictions, RunEvent, RunState, Session,
    Shape, StageError, StageExecutor, StageInputs, ThresholdConfig, ThresholdExecutor, Volume,
    process,
};
use proptest::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two blobs in a 16x10x3 volume.
fn input() -> Predictions {
    let shape = Shape::new(16, 10, 3);
    let channel = Volume::from_fn(shape, |x, y, z| {
        let blob_a = (2..7).contains(&x) && (2..7).contains(&y);
        let blob_b = (9..14).contains(&x) && (3..8).contains(&y);
        if z < 2 && (blob_a || blob_b) {
            0.95
        } else if z < 2 && y == 4 && (7..9).contains(&x) {
            0.55
        } else {
            0.02
        }
    });
    Predictions::new(vec![channel]).unwrap()
}

fn config() -> ThresholdConfig {
    ThresholdConfig {
        sigma_x: 0.5,
        sigma_y: 0.5,
        sigma_z: 0.0,
        high_threshold: 0.8,
        low_threshold: 0.3,
        min_size: 2,
        ..ThresholdConfig::default()
    }
}

/// Records every stage it computes.
#[derive(Default)]
struct Recording {
    log: Arc<Mutex<Vec<PipelineStage>>>,
}

impl StageExecutor for Recording {
    fn execute(
        &self,
        stage: PipelineStage,
        inputs: &StageInputs<'_>,
    ) -> Result<ComputedStage, StageError> {
        self.log.lock().unwrap().push(stage);
        ThresholdExecutor.execute(stage, inputs)
    }
}

/// Blocks the first `blocks` computations of `stage` until released.
struct Gated {
    stage: PipelineStage,
    blocks: AtomicUsize,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl StageExecutor for Gated {
    fn execute(
        &self,
        stage: PipelineStage,
        inputs: &StageInputs<'_>,
    ) -> Result<ComputedStage, StageError> {
        if stage == self.stage
            && self
                .blocks
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
        {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        ThresholdExecutor.execute(stage, inputs)
    }
}

/// Fails `stage` while `failing` is set.
struct Flaky {
    stage: PipelineStage,
    failing: Arc<AtomicBool>,
}

impl StageExecutor for Flaky {
    fn execute(
        &self,
        stage: PipelineStage,
        inputs: &StageInputs<'_>,
    ) -> Result<ComputedStage, StageError> {
        if stage == self.stage && self.failing.load(Ordering::Acquire) {
            return Err(StageError::Compute("solver diverged".into()));
        }
        ThresholdExecutor.execute(stage, inputs)
    }
}

#[test]
fn low_threshold_change_recomputes_final_weighting_and_size_only() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = Recording {
        log: Arc::clone(&log),
    };
    // Defaults: sigma 1.0 on every axis, high 1.0, low 0.0.
    let mut session =
        Session::with_executor(executor, input(), &ThresholdConfig::default()).unwrap();
    session.start();
    let _ = session.coordinator().wait_idle();
    assert_eq!(log.lock().unwrap().len(), 5);
    log.lock().unwrap().clear();

    session.set(ParamId::LowThreshold, 0.5).unwrap();
    let outcome = session.coordinator().wait_idle();
    assert!(matches!(outcome, Some(RunState::Completed(_))));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            PipelineStage::FinalThreshold,
            PipelineStage::LambdaWeighting,
            PipelineStage::SizeFilter,
        ]
    );
}

#[test]
fn max_size_change_recomputes_size_filter_only() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = Recording {
        log: Arc::clone(&log),
    };
    let mut session = Session::with_executor(executor, input(), &config()).unwrap();
    session.start();
    let _ = session.coordinator().wait_idle();
    log.lock().unwrap().clear();

    session.set(ParamId::MaxSize, 30_i64).unwrap();
    let _ = session.coordinator().wait_idle();
    assert_eq!(*log.lock().unwrap(), vec![PipelineStage::SizeFilter]);
}

#[test]
fn edit_during_run_cancels_it_without_committing() {
    init_logging();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let executor = Gated {
        stage: PipelineStage::CoreThreshold,
        blocks: AtomicUsize::new(1),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let mut session = Session::with_executor(executor, input(), &config()).unwrap();
    let events = session.coordinator().subscribe();

    session.start();
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // Smoothing finished inside the blocked run but must not be visible.
    assert!(session.coordinator().outputs().smoothed().is_none());

    session.set(ParamId::SigmaX, 1.5).unwrap();
    release_tx.send(()).unwrap();
    let outcome = session.coordinator().wait_idle();
    assert!(matches!(outcome, Some(RunState::Completed(_))));

    let events: Vec<RunEvent> = events.try_iter().collect();
    let first_end = events
        .iter()
        .find(|e| e.run_id == 1 && e.state.is_terminal())
        .unwrap();
    assert_eq!(first_end.state, RunState::Cancelled);

    let expected = process(&input(), &session.params().snapshot()).unwrap();
    let committed = session.coordinator().outputs();
    assert_eq!(committed.smoothed(), expected.outputs.smoothed());
    assert_eq!(
        committed.objects().unwrap().foreground(),
        expected.objects().unwrap().foreground()
    );
}

#[test]
fn completed_run_commits_all_stages_together() {
    init_logging();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let executor = Gated {
        stage: PipelineStage::SizeFilter,
        blocks: AtomicUsize::new(1),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let session = Session::with_executor(executor, input(), &config()).unwrap();
    session.start();
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // Four stages are done, none is visible.
    assert_eq!(session.coordinator().outputs().missing(), DirtySet::all());

    release_tx.send(()).unwrap();
    let _ = session.coordinator().wait_idle();
    assert!(session.coordinator().outputs().missing().is_empty());
}

#[test]
fn failed_run_keeps_outputs_until_applied() {
    init_logging();
    let failing = Arc::new(AtomicBool::new(false));
    let executor = Flaky {
        stage: PipelineStage::LambdaWeighting,
        failing: Arc::clone(&failing),
    };
    let mut session = Session::with_executor(executor, input(), &config()).unwrap();
    session.start();
    let _ = session.coordinator().wait_idle();
    let before = session.coordinator().outputs();

    failing.store(true, Ordering::Release);
    session.set(ParamId::Lambda, 0.6).unwrap();
    match session.coordinator().wait_idle() {
        Some(RunState::Failed(failure)) => {
            assert_eq!(failure.stage, PipelineStage::LambdaWeighting);
            assert_eq!(failure.to_string(), "stage lambda weighting failed: solver diverged");
        }
        other => unreachable!("expected failure, got {other:?}"),
    }
    assert_eq!(session.coordinator().outputs(), before);

    failing.store(false, Ordering::Release);
    assert!(session.apply());
    assert!(matches!(
        session.coordinator().wait_idle(),
        Some(RunState::Completed(_))
    ));
    assert_ne!(session.coordinator().outputs(), before);
    assert!(!session.apply());
}

#[test]
fn new_input_recomputes_everything() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = Recording {
        log: Arc::clone(&log),
    };
    let mut session = Session::with_executor(executor, input(), &config()).unwrap();
    session.start();
    let _ = session.coordinator().wait_idle();
    log.lock().unwrap().clear();

    session.set_input(input());
    let _ = session.coordinator().wait_idle();
    assert_eq!(log.lock().unwrap().len(), 5);
    // Same data, so every object keeps its label.
    assert!(session.coordinator().last_mapping().unwrap().is_identity());
}

fn apply_edit(session: &mut Session, param: usize, choice: usize) {
    const LOWS: [f64; 5] = [0.2, 0.3, 0.4, 0.5, 0.6];
    const LAMBDAS: [f64; 5] = [0.0, 0.1, 0.2, 0.3, 0.5];
    const MIN_SIZES: [i64; 5] = [1, 2, 5, 10, 40];
    const SIGMAS: [f64; 5] = [0.0, 0.5, 1.0, 1.5, 2.0];
    match param {
        0 => session.set(ParamId::LowThreshold, LOWS[choice]),
        1 => session.set(ParamId::Lambda, LAMBDAS[choice]),
        2 => session.set(ParamId::MinSize, MIN_SIZES[choice]),
        _ => session.set(ParamId::SigmaX, SIGMAS[choice]),
    }
    .unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, ..ProptestConfig::default() })]

    #[test]
    fn at_most_one_run_is_running(
        edits in prop::collection::vec((0_usize..4, 0_usize..5, 0_u64..400), 1..10)
    ) {
        init_logging();
        let mut session = Session::with_config(input(), &config()).unwrap();
        let events = session.coordinator().subscribe();
        session.start();
        for (param, choice, pause) in edits {
            apply_edit(&mut session, param, choice);
            std::thread::sleep(Duration::from_micros(pause));
        }
        let outcome = session.coordinator().wait_idle();
        prop_assert!(matches!(outcome, Some(RunState::Completed(_))));

        let mut running: Option<u64> = None;
        for event in events.try_iter() {
            match event.state {
                RunState::Running => {
                    prop_assert!(running.is_none(), "run {} started during {:?}", event.run_id, running);
                    running = Some(event.run_id);
                }
                RunState::Queued => {}
                _ => {
                    prop_assert_eq!(running, Some(event.run_id));
                    running = None;
                }
            }
        }
        prop_assert!(running.is_none());

        let expected = process(&input(), &session.params().snapshot()).unwrap();
        let committed = session.coordinator().outputs();
        prop_assert_eq!(
            committed.objects().map(|o| o.foreground()),
            expected.objects().map(|o| o.foreground())
        );
    }
}
