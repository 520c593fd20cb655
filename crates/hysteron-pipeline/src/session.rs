//! One thresholding applet's lifetime: the parameter store wired to
//! the recompute coordinator.

use std::sync::Arc;

use crate::coordinator::{CoordinatorError, RecomputeCoordinator};
use crate::executor::{StageExecutor, StageOutput, ThresholdExecutor};
use crate::params::{ParamChange, ParamError, ParamId, ParamValue, ParameterStore, SubscriptionId};
use crate::stage::{DirtySet, PipelineStage};
use crate::types::{Predictions, ThresholdConfig};

/// Errors opening a [`Session`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The initial configuration holds an invalid value.
    #[error("invalid initial configuration: {0}")]
    Config(#[from] ParamError),

    /// The coordinator could not start.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// A parameter store whose accepted changes drive recomputation.
///
/// Every accepted write is forwarded to the coordinator before the
/// write returns; the coordinator dirties, cancels and queues as
/// needed. Dropping the session stops the coordinator.
pub struct Session {
    store: ParameterStore,
    coordinator: Arc<RecomputeCoordinator>,
    subscription: SubscriptionId,
}

impl Session {
    /// Open a session over `input` with default parameters.
    ///
    /// # Errors
    ///
    /// See [`with_executor`](Self::with_executor).
    pub fn new(input: Predictions) -> Result<Self, SessionError> {
        Self::with_config(input, &ThresholdConfig::default())
    }

    /// Open a session over `input` starting from `config`.
    ///
    /// # Errors
    ///
    /// See [`with_executor`](Self::with_executor).
    pub fn with_config(input: Predictions, config: &ThresholdConfig) -> Result<Self, SessionError> {
        Self::with_executor(ThresholdExecutor, input, config)
    }

    /// Open a session with a custom stage executor.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if a value of `config` is out of
    /// range (the channel range follows the input's channel count) and
    /// [`SessionError::Coordinator`] if the worker cannot start.
    pub fn with_executor(
        executor: impl StageExecutor,
        input: Predictions,
        config: &ThresholdConfig,
    ) -> Result<Self, SessionError> {
        let mut store = ParameterStore::with_channel_count(input.channel_count());
        for id in ParamId::ALL {
            store.set(id, config.value(id))?;
        }
        let coordinator = Arc::new(RecomputeCoordinator::spawn(
            executor,
            input,
            store.snapshot(),
        )?);
        let forward = Arc::clone(&coordinator);
        let subscription = store.subscribe(move |change: &ParamChange| {
            forward.notify(change);
        });
        Ok(Self {
            store,
            coordinator,
            subscription,
        })
    }

    /// Compute every stage that has no committed output.
    pub fn start(&self) {
        self.coordinator.request(DirtySet::all());
    }

    /// Write a parameter; see [`ParameterStore::set`].
    ///
    /// # Errors
    ///
    /// As [`ParameterStore::set`].
    pub fn set(&mut self, id: ParamId, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        self.store.set(id, value)
    }

    /// Parse and write a parameter by name; see
    /// [`ParameterStore::set_from_str`].
    ///
    /// # Errors
    ///
    /// As [`ParameterStore::set_from_str`].
    pub fn set_from_str(&mut self, name: &str, text: &str) -> Result<(), ParamError> {
        self.store.set_from_str(name, text)
    }

    /// Register a listener for accepted parameter changes. It runs after
    /// the coordinator has been notified.
    pub fn subscribe_params(
        &mut self,
        listener: impl FnMut(&ParamChange) + Send + 'static,
    ) -> SubscriptionId {
        self.store.subscribe(listener)
    }

    /// Remove a listener added with
    /// [`subscribe_params`](Self::subscribe_params).
    pub fn unsubscribe_params(&mut self, id: SubscriptionId) -> bool {
        id != self.subscription && self.store.unsubscribe(id)
    }

    /// Replace the prediction input.
    ///
    /// The channel range follows the new input; a channel that no longer
    /// exists resets to `0`.
    pub fn set_input(&mut self, input: Predictions) {
        self.store.set_channel_count(input.channel_count());
        self.coordinator.set_input(input);
    }

    /// Re-run the last failed run ("Apply"). Returns `false` if the last
    /// run did not fail.
    pub fn apply(&self) -> bool {
        self.coordinator.retry()
    }

    /// The parameter store (read-only; writes go through the session).
    #[must_use]
    pub const fn params(&self) -> &ParameterStore {
        &self.store
    }

    /// The recompute coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &RecomputeCoordinator {
        &self.coordinator
    }

    /// Committed outputs the presentation layer should show: every stage
    /// when `show_debug` is set, otherwise only the final objects.
    #[must_use]
    pub fn visible_outputs(&self) -> Vec<(PipelineStage, StageOutput)> {
        let show_all = self.store.get(ParamId::ShowDebug) == ParamValue::Bool(true);
        let outputs = self.coordinator.outputs();
        PipelineStage::ALL
            .into_iter()
            .filter(|&s| show_all || s == PipelineStage::SizeFilter)
            .filter_map(|s| outputs.get(s).map(|slot| (s, slot.output.clone())))
            .collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::coordinator::RunState;
    use crate::types::{Shape, Volume};

    fn input(channels: usize) -> Predictions {
        let shape = Shape::new(8, 8, 1);
        let channel = Volume::from_fn(shape, |x, y, _| {
            if (2..6).contains(&x) && (2..6).contains(&y) { 0.95 } else { 0.0 }
        });
        Predictions::new(vec![channel; channels]).unwrap()
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

    #[test]
    fn invalid_initial_config_is_rejected() {
        let bad = ThresholdConfig {
            channel: 4,
            ..config()
        };
        let err = Session::with_config(input(2), &bad).unwrap_err();
        assert!(matches!(err, SessionError::Config(ParamError::Range(_))));
    }

    #[test]
    fn parameter_write_reaches_coordinator() {
        let mut session = Session::with_config(input(1), &config()).unwrap();
        session.start();
        let _ = session.coordinator().wait_idle();

        session.set(ParamId::MinSize, 100_i64).unwrap();
        assert_eq!(session.coordinator().config().min_size, 100);
        assert!(matches!(
            session.coordinator().wait_idle(),
            Some(RunState::Completed(_))
        ));
        let outputs = session.coordinator().outputs();
        assert_eq!(outputs.objects().unwrap().object_count(), 0);
    }

    #[test]
    fn debug_flag_controls_visible_outputs() {
        let mut session = Session::with_config(input(1), &config()).unwrap();
        session.start();
        let _ = session.coordinator().wait_idle();
        assert_eq!(session.visible_outputs().len(), 1);

        session.set(ParamId::ShowDebug, true).unwrap();
        assert_eq!(session.visible_outputs().len(), 5);
    }

    #[test]
    fn shrinking_input_resets_channel() {
        let mut session = Session::with_config(input(3), &config()).unwrap();
        session.set(ParamId::Channel, 2_i64).unwrap();
        session.set_input(input(1));
        assert_eq!(session.params().get(ParamId::Channel), ParamValue::Int(0));
        assert_eq!(session.coordinator().config().channel, 0);
        assert!(matches!(
            session.coordinator().wait_idle(),
            Some(RunState::Completed(_))
        ));
    }

    #[test]
    fn internal_subscription_cannot_be_removed() {
        let mut session = Session::new(input(1)).unwrap();
        let id = session.subscribe_params(|_| {});
        assert!(session.unsubscribe_params(id));
        assert!(!session.unsubscribe_params(session.subscription));
    }
}
