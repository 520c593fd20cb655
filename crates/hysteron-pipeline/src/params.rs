//! Typed thresholding parameters and the [`ParameterStore`] that owns
//! their live values.
//!
//! The store is the single writer of parameter state. Every accepted
//! write that changes a value is announced to subscribers synchronously,
//! in write order, before [`ParameterStore::set`] returns. Writes outside
//! a parameter's declared range are rejected, never clamped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::ThresholdConfig;

/// Largest value accepted by the object-size parameters (`2^31 - 1`).
pub const MAX_OBJECT_SIZE: i64 = 2_147_483_647;

/// Upper bound of the channel parameter before the input is known.
pub const MAX_CHANNEL: i64 = 255;

/// Identity of one thresholding parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParamId {
    /// Prediction channel to threshold.
    Channel,
    /// Smoothing sigma along X.
    SigmaX,
    /// Smoothing sigma along Y.
    SigmaY,
    /// Smoothing sigma along Z.
    SigmaZ,
    /// Core (seed) threshold.
    HighThreshold,
    /// Final (growth) threshold.
    LowThreshold,
    /// Pairwise potential weight.
    Lambda,
    /// Minimum object size.
    MinSize,
    /// Maximum object size.
    MaxSize,
    /// "Don't merge objects".
    PreserveIdentities,
    /// Show intermediate results.
    ShowDebug,
}

impl ParamId {
    /// Number of parameters.
    pub const COUNT: usize = 11;

    /// Every parameter, in panel order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Channel,
        Self::SigmaX,
        Self::SigmaY,
        Self::SigmaZ,
        Self::HighThreshold,
        Self::LowThreshold,
        Self::Lambda,
        Self::MinSize,
        Self::MaxSize,
        Self::PreserveIdentities,
        Self::ShowDebug,
    ];

    const fn slot(self) -> usize {
        self as usize
    }

    /// Canonical name (e.g. `"sigma_x"`).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::SigmaX => "sigma_x",
            Self::SigmaY => "sigma_y",
            Self::SigmaZ => "sigma_z",
            Self::HighThreshold => "high_threshold",
            Self::LowThreshold => "low_threshold",
            Self::Lambda => "lambda",
            Self::MinSize => "min_size",
            Self::MaxSize => "max_size",
            Self::PreserveIdentities => "preserve_identities",
            Self::ShowDebug => "show_debug",
        }
    }

    /// Object name of the control bound to this parameter in the panel form.
    #[must_use]
    pub const fn widget(self) -> &'static str {
        match self {
            Self::Channel => "inputChannelComboBox",
            Self::SigmaX => "sigmaSpinBox_X",
            Self::SigmaY => "sigmaSpinBox_Y",
            Self::SigmaZ => "sigmaSpinBox_Z",
            Self::HighThreshold => "highThresholdSpinBox",
            Self::LowThreshold => "lowThresholdSpinBox",
            Self::Lambda => "lambdaSpinBoxGC",
            Self::MinSize => "minSizeSpinBox",
            Self::MaxSize => "maxSizeSpinBox",
            Self::PreserveIdentities => "preserveIdentitiesCheckbox",
            Self::ShowDebug => "showDebugCheckbox",
        }
    }

    /// Static metadata for this parameter.
    #[must_use]
    pub const fn spec(self) -> ParamSpec {
        let (kind, min, max, default, tooltip) = match self {
            Self::Channel => (
                ParamKind::Int,
                ParamValue::Int(0),
                ParamValue::Int(MAX_CHANNEL),
                ParamValue::Int(ThresholdConfig::DEFAULT_CHANNEL as i64),
                "Channel of the prediction maps to threshold.",
            ),
            Self::SigmaX => sigma_spec("Sigma of the Gaussian smoothing along X, in pixels."),
            Self::SigmaY => sigma_spec("Sigma of the Gaussian smoothing along Y, in pixels."),
            Self::SigmaZ => sigma_spec("Sigma of the Gaussian smoothing along Z, in pixels."),
            Self::HighThreshold => (
                ParamKind::Float,
                ParamValue::Float(0.0),
                ParamValue::Float(1.0),
                ParamValue::Float(ThresholdConfig::DEFAULT_HIGH_THRESHOLD),
                "Objects are seeded where the smoothed prediction exceeds this value. \
                 Changing the settings here will cause recomputation: object features \
                 have to be recalculated and labels have to be transferred to the new objects.",
            ),
            Self::LowThreshold => (
                ParamKind::Float,
                ParamValue::Float(0.0),
                ParamValue::Float(1.0),
                ParamValue::Float(ThresholdConfig::DEFAULT_LOW_THRESHOLD),
                "Seeded objects grow over every connected pixel above this value.",
            ),
            Self::Lambda => (
                ParamKind::Float,
                ParamValue::Float(0.0),
                ParamValue::Float(10.0),
                ParamValue::Float(ThresholdConfig::DEFAULT_LAMBDA),
                "Weight of the pairwise potential. Higher values give smoother objects.",
            ),
            Self::MinSize => (
                ParamKind::Int,
                ParamValue::Int(0),
                ParamValue::Int(MAX_OBJECT_SIZE),
                ParamValue::Int(ThresholdConfig::DEFAULT_MIN_SIZE as i64),
                "Objects with fewer pixels are removed.",
            ),
            Self::MaxSize => (
                ParamKind::Int,
                ParamValue::Int(0),
                ParamValue::Int(MAX_OBJECT_SIZE),
                ParamValue::Int(ThresholdConfig::DEFAULT_MAX_SIZE as i64),
                "Objects with more pixels are removed.",
            ),
            Self::PreserveIdentities => (
                ParamKind::Bool,
                ParamValue::Bool(false),
                ParamValue::Bool(true),
                ParamValue::Bool(false),
                "Don't merge objects: separately seeded objects stay separate even where they touch.",
            ),
            Self::ShowDebug => (
                ParamKind::Bool,
                ParamValue::Bool(false),
                ParamValue::Bool(true),
                ParamValue::Bool(false),
                "Show the intermediate result of every stage.",
            ),
        };
        ParamSpec {
            id: self,
            kind,
            min,
            max,
            default,
            tooltip,
        }
    }
}

const fn sigma_spec(
    tooltip: &'static str,
) -> (ParamKind, ParamValue, ParamValue, ParamValue, &'static str) {
    (
        ParamKind::Float,
        ParamValue::Float(0.0),
        ParamValue::Float(100.0),
        ParamValue::Float(ThresholdConfig::DEFAULT_SIGMA),
        tooltip,
    )
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParamId {
    type Err = ParamError;

    /// Accepts either the canonical name or the widget name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s || id.widget() == s)
            .ok_or_else(|| ParamError::UnknownName(s.to_owned()))
    }
}

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// Integer.
    Int,
    /// Floating point.
    Float,
    /// Flag.
    Bool,
}

/// A typed parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Flag value.
    Bool(bool),
}

impl ParamValue {
    /// The value's kind.
    #[must_use]
    pub const fn kind(self) -> ParamKind {
        match self {
            Self::Int(_) => ParamKind::Int,
            Self::Float(_) => ParamKind::Float,
            Self::Bool(_) => ParamKind::Bool,
        }
    }

    /// Whether `self` lies within `[min, max]`. NaN never does.
    fn within(self, min: Self, max: Self) -> bool {
        match (self, min, max) {
            (Self::Int(v), Self::Int(lo), Self::Int(hi)) => lo <= v && v <= hi,
            (Self::Float(v), Self::Float(lo), Self::Float(hi)) => lo <= v && v <= hi,
            (Self::Bool(_), Self::Bool(_), Self::Bool(_)) => true,
            _ => false,
        }
    }

    /// Parse `s` as a value of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::Parse`] if `s` is not a valid literal.
    pub fn parse(kind: ParamKind, s: &str) -> Result<Self, ParamError> {
        let s = s.trim();
        let parsed = match kind {
            ParamKind::Int => s.parse().ok().map(Self::Int),
            ParamKind::Float => s.parse().ok().map(Self::Float),
            ParamKind::Bool => match s {
                "true" | "1" | "on" => Some(Self::Bool(true)),
                "false" | "0" | "off" => Some(Self::Bool(false)),
                _ => None,
            },
        };
        parsed.ok_or_else(|| ParamError::Parse {
            input: s.to_owned(),
            kind,
        })
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Static description of a parameter, as read by the presentation layer
/// to build its controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamSpec {
    /// Parameter identity.
    pub id: ParamId,
    /// Value type.
    pub kind: ParamKind,
    /// Smallest accepted value.
    pub min: ParamValue,
    /// Largest accepted value.
    pub max: ParamValue,
    /// Value at construction.
    pub default: ParamValue,
    /// Tooltip shown next to the control.
    pub tooltip: &'static str,
}

/// An accepted parameter write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamChange {
    /// The parameter written.
    pub id: ParamId,
    /// Value before the write.
    pub old: ParamValue,
    /// Value after the write.
    pub new: ParamValue,
}

/// A write fell outside the parameter's declared bounds.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("{name} = {value} is outside [{min}, {max}]")]
pub struct RangeError {
    /// The parameter written.
    pub name: ParamId,
    /// The rejected value.
    pub value: ParamValue,
    /// Lower bound.
    pub min: ParamValue,
    /// Upper bound.
    pub max: ParamValue,
}

/// Errors writing or looking up parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    /// Value outside the declared range. The stored value is unchanged.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// No parameter has this name or widget name.
    #[error("unknown parameter `{0}`")]
    UnknownName(String),

    /// Value of the wrong type for the parameter.
    #[error("{name} expects {expected:?}, got {found:?}")]
    TypeMismatch {
        /// The parameter written.
        name: ParamId,
        /// The parameter's kind.
        expected: ParamKind,
        /// The supplied value's kind.
        found: ParamKind,
    },

    /// A textual value could not be parsed.
    #[error("cannot parse `{input}` as {kind:?}")]
    Parse {
        /// The rejected text.
        input: String,
        /// The kind it was parsed as.
        kind: ParamKind,
    },
}

/// Handle returned by [`ParameterStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&ParamChange) + Send>;

/// Owner of every live parameter value.
///
/// Created when the applet opens and dropped when it closes. Writes take
/// `&mut self`, so the store is single-writer by construction.
pub struct ParameterStore {
    specs: [ParamSpec; ParamId::COUNT],
    values: [ParamValue; ParamId::COUNT],
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl ParameterStore {
    /// A store holding every parameter's default.
    #[must_use]
    pub fn new() -> Self {
        let specs = ParamId::ALL.map(ParamId::spec);
        let values = specs.map(|s| s.default);
        Self {
            specs,
            values,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// A store whose channel range matches an input with `channels`
    /// channels.
    #[must_use]
    pub fn with_channel_count(channels: usize) -> Self {
        let mut store = Self::new();
        store.narrow_channel_range(channels);
        store
    }

    fn narrow_channel_range(&mut self, channels: usize) {
        let max = i64::try_from(channels.max(1) - 1).unwrap_or(MAX_CHANNEL);
        self.specs[ParamId::Channel.slot()].max = ParamValue::Int(max);
    }

    /// Adjust the channel range to a new input.
    ///
    /// If the current channel no longer exists it is reset to `0`, which
    /// is announced like any other write.
    pub fn set_channel_count(&mut self, channels: usize) {
        self.narrow_channel_range(channels);
        let spec = self.specs[ParamId::Channel.slot()];
        let current = self.values[ParamId::Channel.slot()];
        if !current.within(spec.min, spec.max) {
            self.store_and_notify(ParamId::Channel, ParamValue::Int(0));
        }
    }

    /// Metadata of every parameter, in panel order.
    #[must_use]
    pub fn metadata(&self) -> &[ParamSpec] {
        &self.specs
    }

    /// Metadata of one parameter, reflecting any narrowed range.
    #[must_use]
    pub const fn spec(&self, id: ParamId) -> &ParamSpec {
        &self.specs[id.slot()]
    }

    /// Current value of `id`.
    #[must_use]
    pub const fn get(&self, id: ParamId) -> ParamValue {
        self.values[id.slot()]
    }

    /// Current value of the parameter called `name` (canonical or widget
    /// name).
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::UnknownName`] for an unknown name.
    pub fn get_by_name(&self, name: &str) -> Result<ParamValue, ParamError> {
        Ok(self.get(name.parse()?))
    }

    /// Write `value` to `id`.
    ///
    /// On success every subscriber has seen the change by the time this
    /// returns. Writing the current value is accepted and announces
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::TypeMismatch`] for a value of the wrong kind
    /// and [`ParamError::Range`] for a value outside the declared bounds.
    /// In both cases the stored value is unchanged.
    pub fn set(&mut self, id: ParamId, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        let value = value.into();
        let spec = self.specs[id.slot()];
        if value.kind() != spec.kind {
            return Err(ParamError::TypeMismatch {
                name: id,
                expected: spec.kind,
                found: value.kind(),
            });
        }
        if !value.within(spec.min, spec.max) {
            log::debug!("rejected {id} = {value}: outside [{}, {}]", spec.min, spec.max);
            return Err(RangeError {
                name: id,
                value,
                min: spec.min,
                max: spec.max,
            }
            .into());
        }
        if self.values[id.slot()] != value {
            self.store_and_notify(id, value);
        }
        Ok(())
    }

    /// Write to the parameter called `name` (canonical or widget name).
    ///
    /// # Errors
    ///
    /// As [`set`](Self::set), plus [`ParamError::UnknownName`].
    pub fn set_by_name(
        &mut self,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), ParamError> {
        self.set(name.parse()?, value)
    }

    /// Parse `text` as the named parameter's kind and write it.
    ///
    /// # Errors
    ///
    /// As [`set_by_name`](Self::set_by_name), plus [`ParamError::Parse`].
    pub fn set_from_str(&mut self, name: &str, text: &str) -> Result<(), ParamError> {
        let id: ParamId = name.parse()?;
        let value = ParamValue::parse(self.spec(id).kind, text)?;
        self.set(id, value)
    }

    fn store_and_notify(&mut self, id: ParamId, value: ParamValue) {
        let change = ParamChange {
            id,
            old: self.values[id.slot()],
            new: value,
        };
        self.values[id.slot()] = value;
        log::debug!("{id}: {} -> {}", change.old, change.new);
        for (_, listener) in &mut self.listeners {
            listener(&change);
        }
    }

    /// Register `listener` for every subsequent accepted change.
    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&ParamChange) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Typed snapshot of every current value.
    #[must_use]
    pub fn snapshot(&self) -> ThresholdConfig {
        let mut config = ThresholdConfig::default();
        for id in ParamId::ALL {
            config.apply(id, self.get(id));
        }
        config
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterStore")
            .field("values", &self.snapshot())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ThresholdConfig {
    /// Current value of `id` as a [`ParamValue`].
    #[must_use]
    pub fn value(&self, id: ParamId) -> ParamValue {
        match id {
            ParamId::Channel => ParamValue::Int(i64::from(self.channel)),
            ParamId::SigmaX => ParamValue::Float(self.sigma_x),
            ParamId::SigmaY => ParamValue::Float(self.sigma_y),
            ParamId::SigmaZ => ParamValue::Float(self.sigma_z),
            ParamId::HighThreshold => ParamValue::Float(self.high_threshold),
            ParamId::LowThreshold => ParamValue::Float(self.low_threshold),
            ParamId::Lambda => ParamValue::Float(self.lambda),
            ParamId::MinSize => ParamValue::Int(i64::from(self.min_size)),
            ParamId::MaxSize => ParamValue::Int(i64::from(self.max_size)),
            ParamId::PreserveIdentities => ParamValue::Bool(self.preserve_identities),
            ParamId::ShowDebug => ParamValue::Bool(self.show_debug),
        }
    }

    /// Write `value` into the field for `id`.
    ///
    /// Values are expected to have passed [`ParameterStore`] validation;
    /// a value of the wrong kind or not representable in the field is
    /// ignored and `false` is returned.
    pub fn apply(&mut self, id: ParamId, value: ParamValue) -> bool {
        match (id, value) {
            (ParamId::Channel, ParamValue::Int(v)) => {
                assign(&mut self.channel, u32::try_from(v).ok())
            }
            (ParamId::SigmaX, ParamValue::Float(v)) => assign(&mut self.sigma_x, Some(v)),
            (ParamId::SigmaY, ParamValue::Float(v)) => assign(&mut self.sigma_y, Some(v)),
            (ParamId::SigmaZ, ParamValue::Float(v)) => assign(&mut self.sigma_z, Some(v)),
            (ParamId::HighThreshold, ParamValue::Float(v)) => {
                assign(&mut self.high_threshold, Some(v))
            }
            (ParamId::LowThreshold, ParamValue::Float(v)) => {
                assign(&mut self.low_threshold, Some(v))
            }
            (ParamId::Lambda, ParamValue::Float(v)) => assign(&mut self.lambda, Some(v)),
            (ParamId::MinSize, ParamValue::Int(v)) => {
                assign(&mut self.min_size, u32::try_from(v).ok())
            }
            (ParamId::MaxSize, ParamValue::Int(v)) => {
                assign(&mut self.max_size, u32::try_from(v).ok())
            }
            (ParamId::PreserveIdentities, ParamValue::Bool(v)) => {
                assign(&mut self.preserve_identities, Some(v))
            }
            (ParamId::ShowDebug, ParamValue::Bool(v)) => assign(&mut self.show_debug, Some(v)),
            _ => false,
        }
    }

    /// Apply an accepted change.
    pub fn apply_change(&mut self, change: &ParamChange) -> bool {
        self.apply(change.id, change.new)
    }
}

fn assign<T>(field: &mut T, value: Option<T>) -> bool {
    let Some(value) = value else {
        return false;
    };
    *field = value;
    true
}
