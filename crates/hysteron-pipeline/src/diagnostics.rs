//! Run diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every completed run carries a [`RunDiagnostics`] listing the stages
//! it planned, whether each was recomputed or reused from the committed
//! outputs, and what each one produced.
//!
//! Timestamps are captured via the `web-time` crate. Durations are
//! serialized as fractional seconds (`f64`) for JSON compatibility,
//! since `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stage::PipelineStage;
use crate::transfer::TransferDiagnostic;
use crate::types::Shape;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics for a single stage computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Gaussian smoothing.
    Smoothing {
        /// Channel read from the prediction input.
        channel: u32,
        /// Sigmas `[x, y, z]`.
        sigmas: [f64; 3],
        /// Volume extent.
        shape: Shape,
    },
    /// Core (high) threshold.
    CoreThreshold {
        /// Threshold applied.
        high_threshold: f64,
        /// Number of core objects.
        core_count: usize,
        /// Voxels above the threshold.
        core_voxels: u64,
    },
    /// Final (low, hysteresis) threshold.
    FinalThreshold {
        /// Threshold applied.
        low_threshold: f64,
        /// Foreground voxels after growing from the cores.
        foreground_voxels: u64,
    },
    /// Pairwise regularization.
    LambdaWeighting {
        /// Pairwise weight.
        lambda: f64,
        /// Voxels whose label changed.
        flipped_voxels: u64,
        /// ICM sweeps performed.
        sweeps: usize,
    },
    /// Object labeling and size filter.
    SizeFilter {
        /// Smallest object kept.
        min_size: u32,
        /// Largest object kept.
        max_size: u32,
        /// Whether core objects were kept apart.
        preserve_identities: bool,
        /// Objects before filtering.
        objects_before: usize,
        /// Objects after filtering.
        objects_after: usize,
    },
}

/// One planned stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage.
    pub stage: PipelineStage,
    /// `true` if the committed output was reused instead of recomputed.
    /// The diagnostics then describe the run that produced it.
    pub reused: bool,
    /// Timing and metrics.
    pub diagnostics: StageDiagnostics,
}

/// Diagnostics collected from one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Run id, increasing per coordinator.
    pub run_id: u64,
    /// Planned stages in pipeline order.
    pub stages: Vec<StageRecord>,
    /// Wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Objects in the final segmentation.
    pub object_count: usize,
    /// Label transfer findings (empty when nothing was transferred).
    pub transfer: Vec<TransferDiagnostic>,
}

impl RunDiagnostics {
    /// Stages recomputed by this run.
    pub fn recomputed(&self) -> impl Iterator<Item = PipelineStage> + '_ {
        self.stages.iter().filter(|r| !r.reused).map(|r| r.stage)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Run {} Diagnostics\n{}", self.run_id, "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<18} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for record in &self.stages {
            let name = record.stage.name();
            let details = format_metrics(&record.diagnostics.metrics);
            if record.reused {
                lines.push(format!("{name:<18} {:>10} {:>10}  {details}", "reused", "-"));
                continue;
            }
            let ms = duration_ms(record.diagnostics.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            lines.push(format!("{name:<18} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!("Objects: {}", self.object_count));
        for diag in &self.transfer {
            lines.push(format!("  {diag}"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Smoothing {
            channel,
            sigmas,
            shape,
        } => format!(
            "ch={channel} sigma=({:.2}, {:.2}, {:.2}) {shape}",
            sigmas[0], sigmas[1], sigmas[2]
        ),
        StageMetrics::CoreThreshold {
            high_threshold,
            core_count,
            core_voxels,
        } => format!("high={high_threshold:.3} cores={core_count} voxels={core_voxels}"),
        StageMetrics::FinalThreshold {
            low_threshold,
            foreground_voxels,
        } => format!("low={low_threshold:.3} foreground={foreground_voxels}"),
        StageMetrics::LambdaWeighting {
            lambda,
            flipped_voxels,
            sweeps,
        } => format!("lambda={lambda:.2} flipped={flipped_voxels} sweeps={sweeps}"),
        StageMetrics::SizeFilter {
            min_size,
            max_size,
            preserve_identities,
            objects_before,
            objects_after,
        } => {
            let mode = if *preserve_identities { " preserve" } else { "" };
            format!("[{min_size}, {max_size}]{mode} objects={objects_before}->{objects_after}")
        }
    }
}
