//! Shared types for the hysteron thresholding pipeline.

use ndarray::{Array3, ArrayView3, Zip};
use serde::{Deserialize, Serialize};

use crate::stage::PipelineStage;

/// Extent of a 3D volume in voxels.
///
/// Voxels are stored x-fastest: the linear index of `(x, y, z)` is
/// `(z * y_len + y) * x_len + x`, which is the standard layout of an
/// array with axes `(z, y, x)`. 2D images use `z == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Extent along the X axis.
    pub x: usize,
    /// Extent along the Y axis.
    pub y: usize,
    /// Extent along the Z axis.
    pub z: usize,
}

impl Shape {
    /// Create a new shape.
    #[must_use]
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// The array dimension `(z, y, x)`.
    #[must_use]
    pub const fn dim(self) -> (usize, usize, usize) {
        (self.z, self.y, self.x)
    }

    const fn from_dim((z, y, x): (usize, usize, usize)) -> Self {
        Self { x, y, z }
    }

    /// Total number of voxels.
    #[must_use]
    pub const fn len(self) -> usize {
        self.x * self.y * self.z
    }

    /// Returns `true` if any axis has zero extent.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Linear index of `(x, y, z)`.
    #[must_use]
    pub const fn index(self, x: usize, y: usize, z: usize) -> usize {
        (z * self.y + y) * self.x + x
    }

    /// Coordinates of a linear index.
    #[must_use]
    pub const fn coords(self, index: usize) -> (usize, usize, usize) {
        let x = index % self.x;
        let y = (index / self.x) % self.y;
        let z = index / (self.x * self.y);
        (x, y, z)
    }

    /// The 6-connected neighbors of `index` that lie inside the volume.
    pub fn neighbors(self, index: usize) -> impl Iterator<Item = usize> {
        let (x, y, z) = self.coords(index);
        let row = self.x;
        let plane = self.x * self.y;
        [
            (x > 0).then(|| index - 1),
            (x + 1 < self.x).then(|| index + 1),
            (y > 0).then(|| index - row),
            (y + 1 < self.y).then(|| index + row),
            (z > 0).then(|| index - plane),
            (z + 1 < self.z).then(|| index + plane),
        ]
        .into_iter()
        .flatten()
    }

    /// Neighbors of `index` that precede it in the linear layout
    /// (`-x`, `-y`, `-z`). Used by single-pass labeling.
    pub fn preceding_neighbors(self, index: usize) -> impl Iterator<Item = usize> {
        let (x, y, z) = self.coords(index);
        [
            (x > 0).then(|| index - 1),
            (y > 0).then(|| index - self.x),
            (z > 0).then(|| index - self.x * self.y),
        ]
        .into_iter()
        .flatten()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// A dense single-channel 3D volume backed by an [`Array3`] with axes
/// `(z, y, x)` in standard layout.
///
/// Serialized as `{shape, data}` with `data` in linear order.
/// Deserialization goes through [`Volume::new`], so a volume read from
/// JSON always fills its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    into = "VolumeProxy<T>",
    try_from = "VolumeProxy<T>",
    bound(serialize = "T: Serialize + Clone", deserialize = "T: Deserialize<'de>")
)]
pub struct Volume<T> {
    data: Array3<T>,
}

/// Serde form of [`Volume`].
#[derive(Serialize, Deserialize)]
struct VolumeProxy<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T> TryFrom<VolumeProxy<T>> for Volume<T> {
    type Error = VolumeError;

    fn try_from(proxy: VolumeProxy<T>) -> Result<Self, Self::Error> {
        Self::new(proxy.shape, proxy.data)
    }
}

impl<T: Clone> From<Volume<T>> for VolumeProxy<T> {
    fn from(volume: Volume<T>) -> Self {
        Self {
            shape: volume.shape(),
            data: volume.data.iter().cloned().collect(),
        }
    }
}

/// Binary foreground mask.
pub type Mask = Volume<bool>;

impl<T> Volume<T> {
    /// Wrap voxel data, given in linear order, in a volume.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::LengthMismatch`] if `data.len()` does not
    /// equal `shape.len()`.
    pub fn new(shape: Shape, data: Vec<T>) -> Result<Self, VolumeError> {
        let len = data.len();
        Array3::from_shape_vec(shape.dim(), data)
            .map(|data| Self { data })
            .map_err(|_| VolumeError::LengthMismatch { shape, len })
    }

    /// Build a volume by evaluating `f` at every `(x, y, z)`.
    ///
    /// Evaluation order is unspecified.
    pub fn from_fn(shape: Shape, mut f: impl FnMut(usize, usize, usize) -> T) -> Self {
        Self {
            data: Array3::from_shape_fn(shape.dim(), |(z, y, x)| f(x, y, z)),
        }
    }

    /// Build a volume by evaluating `f` at every linear index.
    pub(crate) fn from_index_fn(shape: Shape, mut f: impl FnMut(usize) -> T) -> Self {
        Self::from_fn(shape, |x, y, z| f(shape.index(x, y, z)))
    }

    /// The volume's extent.
    #[must_use]
    pub fn shape(&self) -> Shape {
        Shape::from_dim(self.data.dim())
    }

    /// Voxel at `(x, y, z)`, or `None` outside the volume.
    #[must_use]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<&T> {
        self.data.get((z, y, x))
    }

    /// The voxels as an array view with axes `(z, y, x)`.
    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, T> {
        self.data.view()
    }

    /// All voxels in linear order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // Every constructor yields standard layout.
        self.data.as_slice().unwrap_or_default()
    }

    /// Apply `f` to every voxel, producing a volume of the same shape.
    ///
    /// Visiting order is unspecified; `f` should not depend on it.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Volume<U> {
        Volume {
            data: self.data.map(f),
        }
    }

    /// Combine two volumes of the same shape voxel by voxel.
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    pub fn zip_map<U, V>(&self, other: &Volume<U>, mut f: impl FnMut(&T, &U) -> V) -> Volume<V> {
        // Standard-layout inputs give a standard-layout result.
        let data = Zip::from(&self.data)
            .and(&other.data)
            .map_collect(|a, b| f(a, b));
        Volume::from_array(data)
    }

    /// Wrap an array with axes `(z, y, x)` in standard layout.
    pub(crate) fn from_array(data: Array3<T>) -> Self {
        debug_assert!(data.is_standard_layout());
        Self { data }
    }
}

impl<T: Clone> Volume<T> {
    /// A volume with every voxel set to `value`.
    #[must_use]
    pub fn filled(shape: Shape, value: T) -> Self {
        Self {
            data: Array3::from_elem(shape.dim(), value),
        }
    }
}

impl Mask {
    /// Number of foreground voxels.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.data.iter().map(|&v| u64::from(v)).sum()
    }
}

/// Multi-channel prediction maps, the pipeline's input.
///
/// Every channel shares one shape. Values are expected in `[0, 1]` but
/// are not validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PredictionsProxy")]
pub struct Predictions {
    channels: Vec<Volume<f32>>,
}

/// Unvalidated serde form of [`Predictions`].
#[derive(Deserialize)]
struct PredictionsProxy {
    channels: Vec<Volume<f32>>,
}

impl TryFrom<PredictionsProxy> for Predictions {
    type Error = VolumeError;

    fn try_from(proxy: PredictionsProxy) -> Result<Self, Self::Error> {
        Self::new(proxy.channels)
    }
}

impl Predictions {
    /// Bundle channels into a prediction input.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NoChannels`] for an empty channel list and
    /// [`VolumeError::ChannelShape`] if channels disagree on shape.
    pub fn new(channels: Vec<Volume<f32>>) -> Result<Self, VolumeError> {
        let Some(first) = channels.first() else {
            return Err(VolumeError::NoChannels);
        };
        let expected = first.shape();
        if let Some((channel, vol)) = channels
            .iter()
            .enumerate()
            .find(|(_, v)| v.shape() != expected)
        {
            return Err(VolumeError::ChannelShape {
                channel,
                expected,
                actual: vol.shape(),
            });
        }
        Ok(Self { channels })
    }

    /// Shape shared by all channels.
    #[must_use]
    pub fn shape(&self) -> Shape {
        self.channels
            .first()
            .map_or(Shape::new(0, 0, 0), Volume::shape)
    }

    /// Number of channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Select one channel.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::ChannelOutOfRange`] if `channel` does not
    /// exist.
    pub fn channel(&self, channel: u32) -> Result<&Volume<f32>, StageError> {
        usize::try_from(channel)
            .ok()
            .and_then(|c| self.channels.get(c))
            .ok_or(StageError::ChannelOutOfRange {
                channel,
                available: self.channels.len(),
            })
    }
}

/// Typed snapshot of every thresholding parameter.
///
/// The [`ParameterStore`](crate::ParameterStore) owns the live values and
/// enforces their ranges; this struct is what the pipeline reads. Fields
/// are public with no validation of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ThresholdConfig {
    /// Index of the prediction channel to threshold.
    pub channel: u32,
    /// Gaussian smoothing sigma along X, in voxels.
    pub sigma_x: f64,
    /// Gaussian smoothing sigma along Y, in voxels.
    pub sigma_y: f64,
    /// Gaussian smoothing sigma along Z, in voxels.
    pub sigma_z: f64,
    /// Core (seed) threshold.
    pub high_threshold: f64,
    /// Final (growth) threshold.
    pub low_threshold: f64,
    /// Weight of the pairwise smoothness potential.
    pub lambda: f64,
    /// Smallest object kept, in voxels.
    pub min_size: u32,
    /// Largest object kept, in voxels.
    pub max_size: u32,
    /// Keep separately seeded objects apart ("don't merge objects").
    pub preserve_identities: bool,
    /// Show intermediate stage outputs. No pipeline effect.
    pub show_debug: bool,
}

impl ThresholdConfig {
    /// Default prediction channel.
    pub const DEFAULT_CHANNEL: u32 = 0;
    /// Default smoothing sigma on every axis.
    pub const DEFAULT_SIGMA: f64 = 1.0;
    /// Default core threshold.
    pub const DEFAULT_HIGH_THRESHOLD: f64 = 1.0;
    /// Default growth threshold.
    pub const DEFAULT_LOW_THRESHOLD: f64 = 0.0;
    /// Default pairwise weight.
    pub const DEFAULT_LAMBDA: f64 = 0.2;
    /// Default minimum object size.
    pub const DEFAULT_MIN_SIZE: u32 = 10;
    /// Default maximum object size.
    pub const DEFAULT_MAX_SIZE: u32 = 1_000_000;

    /// Smoothing sigmas as `[x, y, z]`.
    #[must_use]
    pub const fn sigmas(&self) -> [f64; 3] {
        [self.sigma_x, self.sigma_y, self.sigma_z]
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            channel: Self::DEFAULT_CHANNEL,
            sigma_x: Self::DEFAULT_SIGMA,
            sigma_y: Self::DEFAULT_SIGMA,
            sigma_z: Self::DEFAULT_SIGMA,
            high_threshold: Self::DEFAULT_HIGH_THRESHOLD,
            low_threshold: Self::DEFAULT_LOW_THRESHOLD,
            lambda: Self::DEFAULT_LAMBDA,
            min_size: Self::DEFAULT_MIN_SIZE,
            max_size: Self::DEFAULT_MAX_SIZE,
            preserve_identities: false,
            show_debug: false,
        }
    }
}

/// Errors constructing volumes and prediction inputs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VolumeError {
    /// Voxel data does not fill the declared shape.
    #[error("volume of shape {shape} needs {} voxels, got {len}", shape.len())]
    LengthMismatch {
        /// Declared shape.
        shape: Shape,
        /// Number of voxels supplied.
        len: usize,
    },

    /// Prediction input without any channel.
    #[error("prediction input has no channels")]
    NoChannels,

    /// A channel's shape differs from the first channel's.
    #[error("channel {channel} has shape {actual}, expected {expected}")]
    ChannelShape {
        /// Offending channel index.
        channel: usize,
        /// Shape of channel 0.
        expected: Shape,
        /// Shape of the offending channel.
        actual: Shape,
    },
}

/// Why a single stage computation failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    /// The configured channel does not exist in the input.
    #[error("channel {channel} out of range: input has {available} channel(s)")]
    ChannelOutOfRange {
        /// Requested channel.
        channel: u32,
        /// Number of channels in the input.
        available: usize,
    },

    /// A stage ran before the stage it reads from had any output.
    #[error("no output available from upstream stage {0}")]
    MissingInput(PipelineStage),

    /// Any other computation failure.
    #[error("{0}")]
    Compute(String),
}

/// A run failed in `stage`.
///
/// Outputs committed by earlier runs stay valid; the run can be retried
/// once the cause is addressed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("stage {stage} failed: {source}")]
pub struct StageFailure {
    /// The stage that failed.
    pub stage: PipelineStage,
    /// The underlying cause.
    #[source]
    pub source: StageError,
}
