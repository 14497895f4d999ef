//! Logarithmic train/validation curves with sampled hyperparameters.
//!
//! The run attaches this file as its source snapshot, then emits one record of
//! `acc`, `val_acc`, `loss` and `val_loss` per step, pausing after every step.

use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::clock::Clock;
use crate::error::{ExpsimError, Result};
use crate::models::{MetricRecord, RunConfig, RunStatus, Settings, SourceSnapshot};
use crate::tracker::{RunHandle, Tracker};

pub const PROJECT: &str = "launch-test";
pub const OWNER: &str = "allanstevenson";
pub const STEPS: u32 = 20;
pub const BATCH_SIZE: i64 = 128;

pub const METRIC_KEYS: [&str; 4] = ["acc", "val_acc", "loss", "val_loss"];

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParams {
    pub project: String,
    pub owner: Option<String>,
    pub steps: u32,
    /// Pause after every step.
    pub pause: Duration,
    pub settings: Settings,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self {
            project: PROJECT.to_string(),
            owner: Some(OWNER.to_string()),
            steps: STEPS,
            pause: Duration::from_secs(1),
            settings: Settings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparams {
    pub learning_rate: f64,
    pub batch_size: i64,
    pub momentum: f64,
    pub dropout: f64,
}

impl Hyperparams {
    /// Draws learning rate, momentum and dropout, in that order.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            learning_rate: 0.01 * rng.gen::<f64>(),
            batch_size: BATCH_SIZE,
            momentum: 0.1 * rng.gen::<f64>(),
            dropout: 0.4 * rng.gen::<f64>(),
        }
    }

    pub fn to_config(self) -> RunConfig {
        RunConfig::new()
            .with("learning_rate", self.learning_rate)
            .with("batch_size", self.batch_size)
            .with("momentum", self.momentum)
            .with("dropout", self.dropout)
    }

    /// Read the hyperparameters back from a run's configuration.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let float = |key: &str| {
            config
                .get_f64(key)
                .ok_or_else(|| ExpsimError::MissingConfig(key.to_string()))
        };
        Ok(Self {
            learning_rate: float("learning_rate")?,
            batch_size: config
                .get("batch_size")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ExpsimError::MissingConfig("batch_size".to_string()))?,
            momentum: float("momentum")?,
            dropout: float("dropout")?,
        })
    }
}

/// Per-run bias terms: `d1` shifts accuracies, `d2` shifts losses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Displacement {
    pub d1: f64,
    pub d2: f64,
}

impl Displacement {
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            d1: 2.0 * rng.gen::<f64>(),
            d2: 4.0 * rng.gen::<f64>(),
        }
    }
}

/// Metrics for one step. Random draws are consumed left to right, metric by metric.
pub fn step_metrics<R: Rng + ?Sized>(
    step: u32,
    hp: &Hyperparams,
    d: &Displacement,
    rng: &mut R,
) -> MetricRecord {
    let s = step as f64;
    let mut r = || rng.gen::<f64>();
    let growth = |r: f64| (1.0 + s + r).ln();

    let acc = 0.1 + 0.4 * (growth(r()) + r() * hp.learning_rate + r() + d.d1 + r() * hp.momentum);
    let val_acc = 0.1 + 0.5 * (growth(r()) + r() * hp.learning_rate - r() + d.d1);
    let loss = 0.1 + 0.08 * (3.5 - growth(r()) + r() * hp.momentum + r() + d.d2);
    let val_loss = 0.1 + 0.04 * (4.5 - growth(r()) + r() * hp.learning_rate - r() + d.d2);

    MetricRecord::new()
        .with("acc", acc)
        .with("val_acc", val_acc)
        .with("loss", loss)
        .with("val_loss", val_loss)
}

/// Run the simulation. Returns the number of records appended.
pub fn run<T, R, C>(tracker: &T, params: &LaunchParams, rng: &mut R, clock: &C) -> Result<usize>
where
    T: Tracker,
    R: Rng + ?Sized,
    C: Clock + ?Sized,
{
    let mut run = tracker.open_run(
        &params.project,
        params.owner.as_deref(),
        Hyperparams::sample(rng).to_config(),
        &params.settings,
    )?;
    run.snapshot_source(&source())?;

    // The formulas use the configuration as the tracker recorded it.
    let hp = Hyperparams::from_config(run.config())?;

    let d = Displacement::sample(rng);

    let mut emitted = 0;
    for step in 0..params.steps {
        run.append(step_metrics(step, &hp, &d, rng))?;
        emitted += 1;
        clock.sleep(params.pause);
    }

    run.finish(RunStatus::Finished)?;
    info!(project = %params.project, records = emitted, "launch run finished");
    Ok(emitted)
}

/// This module's own source, attached to every launch run.
pub fn source() -> SourceSnapshot {
    SourceSnapshot::new("launch.rs", include_str!("launch.rs"))
}
