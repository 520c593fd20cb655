//! hysteron-bench: CLI tool for replaying parameter edits against the
//! thresholding pipeline.
//!
//! Opens a session over a prediction volume (a JSON file or a synthetic
//! blob volume), computes it once, then applies a sequence of parameter
//! edits, printing the diagnostics of every completed run. Useful for:
//!
//! - Checking which stages an edit recomputes and which are reused
//! - Tuning thresholds, sigmas, lambda and size bounds
//! - Watching object labels survive recomputation
//! - Exercising cancellation with `--no-wait`
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin hysteron-bench -- [OPTIONS] [INPUT_JSON]
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use clap::Parser;
use hysteron_pipeline::{
    PipelineStage, Predictions, RunDiagnostics, RunEvent, RunState, Session, Shape,
    ThresholdConfig, Volume,
};

/// Parameter-edit replay and diagnostics for hysteron.
///
/// Runs the thresholding pipeline on a prediction volume, then replays
/// `--set` edits and prints per-stage timing and counts for every run.
#[derive(Parser)]
#[command(name = "hysteron-bench", version)]
struct Cli {
    /// Path to a JSON prediction volume. A synthetic volume is used when
    /// omitted.
    input: Option<PathBuf>,

    /// Synthetic volume extent as `X,Y,Z`.
    #[arg(long, value_delimiter = ',', num_args = 3, default_values_t = [64, 64, 8])]
    size: Vec<usize>,

    /// Number of blobs in the synthetic volume.
    #[arg(long, default_value_t = 6)]
    blobs: usize,

    /// Prediction channel.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_CHANNEL)]
    channel: u32,

    /// Smoothing sigma along X.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_SIGMA)]
    sigma_x: f64,

    /// Smoothing sigma along Y.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_SIGMA)]
    sigma_y: f64,

    /// Smoothing sigma along Z.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_SIGMA)]
    sigma_z: f64,

    /// Core threshold.
    #[arg(long, default_value_t = 0.8)]
    high: f64,

    /// Final threshold.
    #[arg(long, default_value_t = 0.4)]
    low: f64,

    /// Pairwise weight.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_LAMBDA)]
    lambda: f64,

    /// Smallest object kept, in voxels.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_MIN_SIZE)]
    min_size: u32,

    /// Largest object kept, in voxels.
    #[arg(long, default_value_t = ThresholdConfig::DEFAULT_MAX_SIZE)]
    max_size: u32,

    /// Keep separately seeded objects apart.
    #[arg(long)]
    preserve_identities: bool,

    /// Print every stage's output summary, not just the objects.
    #[arg(long)]
    show_debug: bool,

    /// Minimum overlap ratio for an object to keep its label.
    #[arg(long, default_value_t = hysteron_pipeline::LabelTransferPolicy::DEFAULT_MIN_OVERLAP)]
    min_overlap: f64,

    /// Parameter edit `NAME=VALUE`, applied in order after the first run.
    /// Names are parameter or widget names (`low_threshold`,
    /// `lowThresholdSpinBox`).
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_edit)]
    edits: Vec<(String, String)>,

    /// Apply all edits back to back instead of waiting for each run.
    #[arg(long)]
    no_wait: bool,

    /// Output diagnostics as JSON instead of human-readable reports.
    #[arg(long)]
    json: bool,

    /// Full threshold config as a JSON string.
    ///
    /// When provided, all other parameter flags are ignored. The JSON
    /// must be a valid `ThresholdConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,
}

fn parse_edit(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))
}

/// Build a [`ThresholdConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<ThresholdConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(ThresholdConfig {
        channel: cli.channel,
        sigma_x: cli.sigma_x,
        sigma_y: cli.sigma_y,
        sigma_z: cli.sigma_z,
        high_threshold: cli.high,
        low_threshold: cli.low,
        lambda: cli.lambda,
        min_size: cli.min_size,
        max_size: cli.max_size,
        preserve_identities: cli.preserve_identities,
        show_debug: cli.show_debug,
    })
}

/// Load the prediction input named on the command line, or build the
/// synthetic one.
fn load_input(cli: &Cli) -> Result<Predictions, String> {
    if let Some(ref path) = cli.input {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        return serde_json::from_str(&text)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }
    let [x, y, z] = <[usize; 3]>::try_from(cli.size.as_slice())
        .map_err(|_| "--size needs exactly three extents".to_owned())?;
    synthetic_blobs(Shape::new(x, y, z), cli.blobs).map_err(|e| e.to_string())
}

/// Spherical blobs on a diagonal lattice with a soft falloff, plus a
/// second channel holding the complement.
#[allow(clippy::cast_precision_loss)]
fn synthetic_blobs(shape: Shape, blobs: usize) -> Result<Predictions, hysteron_pipeline::VolumeError> {
    let count = blobs.max(1);
    let radius = (shape.x.min(shape.y) as f64 / (2.0 * count as f64).sqrt() / 2.0).max(1.5);
    let centers: Vec<[f64; 3]> = (0..count)
        .map(|i| {
            let t = (i as f64 + 0.5) / count as f64;
            let u = ((i * 7 + 3) % count) as f64 / count as f64;
            [
                t * shape.x as f64,
                (u + 0.5 / count as f64) * shape.y as f64,
                shape.z as f64 / 2.0,
            ]
        })
        .collect();
    let foreground = Volume::from_fn(shape, |x, y, z| {
        let p = [x as f64, y as f64, z as f64];
        let nearest = centers
            .iter()
            .map(|c| {
                let d: f64 = c.iter().zip(p).map(|(a, b)| (a - b) * (a - b)).sum();
                d.sqrt()
            })
            .fold(f64::INFINITY, f64::min);
        #[allow(clippy::cast_possible_truncation)]
        let v = (1.0 / (1.0 + ((nearest - radius) * 1.5).exp())) as f32;
        v
    });
    let background = foreground.map(|&v| 1.0 - v);
    Predictions::new(vec![foreground, background])
}

fn print_run(diagnostics: &RunDiagnostics, json: bool) -> Result<(), String> {
    if json {
        let text = serde_json::to_string_pretty(diagnostics)
            .map_err(|e| format!("Error serializing diagnostics: {e}"))?;
        println!("{text}");
    } else {
        println!("{}", diagnostics.report());
        println!();
    }
    Ok(())
}

/// Runs that ended since the session started, read from its run events.
struct RunLog {
    events: mpsc::Receiver<RunEvent>,
    completed: Vec<RunDiagnostics>,
    failed: bool,
}

impl RunLog {
    fn new(session: &Session) -> Self {
        Self {
            events: session.coordinator().subscribe(),
            completed: Vec::new(),
            failed: false,
        }
    }

    /// Wait for the session to go idle and print every run that ended
    /// since the last call. An edit that queued nothing adds no run.
    fn settle(&mut self, session: &Session, cli: &Cli) -> Result<(), String> {
        let _ = session.coordinator().wait_idle();
        let ended: Vec<RunEvent> = self
            .events
            .try_iter()
            .filter(|e| e.state.is_terminal())
            .collect();
        if ended.is_empty() {
            eprintln!("No new run");
            return Ok(());
        }
        let mut any_completed = false;
        for event in ended {
            match event.state {
                RunState::Completed(diagnostics) => {
                    print_run(&diagnostics, cli.json)?;
                    self.completed.push((*diagnostics).clone());
                    any_completed = true;
                }
                RunState::Failed(failure) => {
                    eprintln!("Run {} failed: {failure}", event.run_id);
                    self.failed = true;
                }
                RunState::Cancelled => log::debug!("run {} cancelled", event.run_id),
                RunState::Queued | RunState::Running => {}
            }
        }
        if any_completed && session.params().snapshot().show_debug {
            print_stage_outputs(session);
        }
        Ok(())
    }
}

fn print_stage_outputs(session: &Session) {
    let outputs = session.coordinator().outputs();
    for stage in PipelineStage::ALL {
        let summary = match stage {
            PipelineStage::Smoothing => outputs.smoothed().map(|v| {
                let max = v.as_slice().iter().copied().fold(f32::NEG_INFINITY, f32::max);
                format!("max={max:.3}")
            }),
            PipelineStage::CoreThreshold => {
                outputs.cores().map(|s| format!("{} cores", s.object_count()))
            }
            PipelineStage::FinalThreshold => {
                outputs.foreground().map(|m| format!("{} voxels", m.count()))
            }
            PipelineStage::LambdaWeighting => {
                outputs.regularized().map(|m| format!("{} voxels", m.count()))
            }
            PipelineStage::SizeFilter => outputs.objects().map(|s| {
                let labels: Vec<String> = s.object_sizes().keys().map(ToString::to_string).collect();
                format!("objects {}", labels.join(" "))
            }),
        };
        eprintln!(
            "  {:<18} {}",
            stage.name(),
            summary.unwrap_or_else(|| "-".to_owned())
        );
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let input = match load_input(&cli) {
        Ok(input) => input,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "Input: {} ({} channel(s))",
        input.shape(),
        input.channel_count()
    );
    eprintln!("Config: {config:#?}");
    eprintln!("Edits: {}", cli.edits.len());
    eprintln!();

    let mut session = match Session::with_config(input, &config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    session.coordinator().set_min_overlap(cli.min_overlap);

    let mut runs = RunLog::new(&session);
    let mut failed = false;

    session.start();
    if let Err(msg) = runs.settle(&session, &cli) {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }

    for (name, value) in &cli.edits {
        eprintln!("--- set {name} = {value} ---");
        log::debug!("applying edit {name}={value}");
        if let Err(e) = session.set_from_str(name, value) {
            eprintln!("Rejected: {e}");
            failed = true;
            continue;
        }
        if cli.no_wait {
            continue;
        }
        if let Err(msg) = runs.settle(&session, &cli) {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    }

    if cli.no_wait && !cli.edits.is_empty() {
        if let Err(msg) = runs.settle(&session, &cli) {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    }

    if runs.completed.len() > 1 && !cli.json {
        print_multi_run_summary(&runs.completed);
    }

    if failed || runs.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Print aggregated statistics across the completed runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[RunDiagnostics]) {
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!(
        "{:<18} {:>10} {:>8} {:>12}",
        "Stage", "Computed", "Reused", "Mean (ms)"
    );
    println!("{}", "-".repeat(52));

    for stage in PipelineStage::ALL {
        let records: Vec<_> = all_diagnostics
            .iter()
            .flat_map(|d| d.stages.iter())
            .filter(|r| r.stage == stage)
            .collect();
        let computed: Vec<f64> = records
            .iter()
            .filter(|r| !r.reused)
            .map(|r| r.diagnostics.duration.as_secs_f64() * 1000.0)
            .collect();
        let reused = records.len() - computed.len();
        let stage_mean = if computed.is_empty() {
            0.0
        } else {
            computed.iter().sum::<f64>() / computed.len() as f64
        };
        println!(
            "{:<18} {:>10} {reused:>8} {stage_mean:>10.3}ms",
            stage.name(),
            computed.len()
        );
    }

    let last = all_diagnostics.last().map_or(0, |d| d.object_count);
    println!();
    println!("Final objects: {last}");
}
