//! Exponentially converging accuracy/loss curves over a range of epochs.

use std::io::Write;

use rand::Rng;
use tracing::info;

use crate::error::Result;
use crate::models::{MetricRecord, RunConfig, RunStatus, Settings};
use crate::tracker::{RunHandle, Tracker};

pub const PROJECT: &str = "job_example";

/// Iterations run over `2..epochs`, so the defaults emit nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickstartParams {
    pub epochs: i64,
    pub lr: f64,
}

impl Default for QuickstartParams {
    fn default() -> Self {
        Self {
            epochs: 1,
            lr: 0.01,
        }
    }
}

impl QuickstartParams {
    pub fn config(&self) -> RunConfig {
        RunConfig::new()
            .with("learning_rate", self.lr)
            .with("epochs", self.epochs)
    }

    pub fn settings() -> Settings {
        Settings::default()
            .with_job_creation(true)
            .with_save_code(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: i64,
    pub acc: f64,
    pub loss: f64,
}

impl EpochMetrics {
    pub fn to_record(self) -> MetricRecord {
        MetricRecord::new().with("acc", self.acc).with("loss", self.loss)
    }
}

/// Sample the per-run offset in `[0, 0.2)`.
pub fn sample_offset<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>() / 5.0
}

/// Draws one value for `acc`, then one for `loss`.
pub fn epoch_metrics<R: Rng + ?Sized>(epoch: i64, offset: f64, rng: &mut R) -> EpochMetrics {
    let e = epoch as f64;
    let decay = (-e).exp2();
    let acc = 1.0 - decay - rng.gen::<f64>() / e - offset;
    let loss = decay + rng.gen::<f64>() / e + offset;
    EpochMetrics { epoch, acc, loss }
}

/// Run the simulation, printing progress to `out`. Returns the number of records.
pub fn run<T, R, W>(
    tracker: &T,
    params: &QuickstartParams,
    rng: &mut R,
    out: &mut W,
) -> Result<usize>
where
    T: Tracker,
    R: Rng + ?Sized,
    W: Write,
{
    writeln!(
        out,
        "Training for {} epochs with learning rate {}",
        params.epochs, params.lr
    )?;

    let settings = QuickstartParams::settings();
    let mut run = tracker.open_run(PROJECT, None, params.config(), &settings)?;

    let offset = sample_offset(rng);
    writeln!(out, "lr: {}", params.lr)?;

    let mut emitted = 0;
    for epoch in 2..params.epochs {
        let m = epoch_metrics(epoch, offset, rng);
        writeln!(out, "epoch={}, acc={}, loss={}", m.epoch, m.acc, m.loss)?;
        run.append(m.to_record())?;
        emitted += 1;
    }

    run.finish(RunStatus::Finished)?;
    info!(project = PROJECT, records = emitted, "quickstart run finished");
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn offset_stays_below_a_fifth() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let offset = sample_offset(&mut rng);
            assert!((0.0..0.2).contains(&offset));
        }
    }

    #[test]
    fn decay_and_offset_cancel_in_the_sum() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut replay = rng.clone();
        for epoch in 2..10 {
            let m = epoch_metrics(epoch, 0.13, &mut rng);
            let r_acc: f64 = replay.gen();
            let r_loss: f64 = replay.gen();
            let e = epoch as f64;
            let expected = 1.0 - r_acc / e + r_loss / e;
            assert!((m.acc + m.loss - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn defaults_match_the_fixed_script_parameters() {
        let params = QuickstartParams::default();
        assert_eq!(params.epochs, 1);
        assert_eq!(params.lr, 0.01);
        let config = params.config();
        assert_eq!(config.get_f64("learning_rate"), Some(0.01));
        assert_eq!(config.get_f64("epochs"), Some(1.0));
    }
}
