//! End-to-end tests of the synthetic runs against an in-memory tracker and the
//! local tracker.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use expsim_core::sim::{launch, quickstart, LaunchParams, QuickstartParams};
use expsim_core::{
    storage, ExpsimError, LocalTracker, ManualClock, MetricRecord, RunConfig, RunHandle,
    RunStatus, Settings, SourceSnapshot, Tracker, TrackerConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

#[derive(Debug, Default)]
struct Recorded {
    project: String,
    owner: Option<String>,
    config: RunConfig,
    settings: Option<Settings>,
    records: Vec<MetricRecord>,
    sources: Vec<String>,
    status: Option<RunStatus>,
}

/// Keeps everything a run receives. Can fail after N appends, fail the source
/// snapshot, or hand back a different config than the one it was opened with.
#[derive(Default)]
struct RecordingTracker {
    log: Rc<RefCell<Recorded>>,
    fail_after: Option<usize>,
    fail_snapshot: bool,
    stored_config: Option<RunConfig>,
}

struct RecordingRun {
    log: Rc<RefCell<Recorded>>,
    config: RunConfig,
    fail_after: Option<usize>,
    fail_snapshot: bool,
}

impl Tracker for RecordingTracker {
    type Run = RecordingRun;

    fn open_run(
        &self,
        project: &str,
        owner: Option<&str>,
        config: RunConfig,
        settings: &Settings,
    ) -> expsim_core::error::Result<RecordingRun> {
        {
            let mut log = self.log.borrow_mut();
            log.project = project.to_string();
            log.owner = owner.map(str::to_string);
            log.config = config.clone();
            log.settings = Some(*settings);
        }
        Ok(RecordingRun {
            log: self.log.clone(),
            config: self.stored_config.clone().unwrap_or(config),
            fail_after: self.fail_after,
            fail_snapshot: self.fail_snapshot,
        })
    }
}

impl RunHandle for RecordingRun {
    fn config(&self) -> &RunConfig {
        &self.config
    }

    fn append(&mut self, record: MetricRecord) -> expsim_core::error::Result<()> {
        let mut log = self.log.borrow_mut();
        if Some(log.records.len()) == self.fail_after {
            return Err(ExpsimError::Other("tracker unreachable".to_string()));
        }
        log.records.push(record);
        Ok(())
    }

    fn snapshot_source(&mut self, source: &SourceSnapshot) -> expsim_core::error::Result<()> {
        if self.fail_snapshot {
            return Err(ExpsimError::Other("snapshot rejected".to_string()));
        }
        self.log.borrow_mut().sources.push(source.file_name.clone());
        Ok(())
    }

    fn finish(self, status: RunStatus) -> expsim_core::error::Result<()> {
        self.log.borrow_mut().status = Some(status);
        Ok(())
    }
}

fn run_quickstart(epochs: i64, seed: u64) -> (Recorded, String) {
    let tracker = RecordingTracker::default();
    let params = QuickstartParams { epochs, lr: 0.01 };
    let mut out = Vec::new();
    let emitted = quickstart::run(&tracker, &params, &mut StdRng::seed_from_u64(seed), &mut out)
        .unwrap();
    let log = tracker.log.take();
    assert_eq!(emitted, log.records.len());
    (log, String::from_utf8(out).unwrap())
}

#[test]
fn quickstart_emits_nothing_for_small_epoch_counts() {
    for epochs in [-3, 0, 1, 2] {
        let (log, out) = run_quickstart(epochs, 1);
        assert!(log.records.is_empty(), "epochs={epochs}");
        assert_eq!(log.status, Some(RunStatus::Finished));
        assert!(out.starts_with(&format!(
            "Training for {epochs} epochs with learning rate 0.01\nlr: 0.01\n"
        )));
    }
}

#[test]
fn quickstart_emits_one_record_per_epoch_after_the_first_two() {
    for epochs in 3..12 {
        let (log, _) = run_quickstart(epochs, epochs as u64);
        assert_eq!(log.records.len() as i64, epochs - 2);
    }
}

#[test]
fn quickstart_five_epochs_scenario() {
    let seed = 42;
    let (log, out) = run_quickstart(5, seed);

    assert_eq!(log.project, "job_example");
    assert_eq!(log.owner, None);
    assert_eq!(log.config.get_f64("learning_rate"), Some(0.01));
    assert_eq!(log.config.get_f64("epochs"), Some(5.0));
    assert_eq!(
        log.settings,
        Some(Settings {
            enable_job_creation: true,
            save_code: true
        })
    );
    assert_eq!(log.records.len(), 3);

    // Replay the draws: offset first, then (acc, loss) per epoch.
    let mut replay = StdRng::seed_from_u64(seed);
    let _offset: f64 = replay.gen();
    for (record, epoch) in log.records.iter().zip(2..5) {
        let e = epoch as f64;
        let r_acc: f64 = replay.gen();
        let r_loss: f64 = replay.gen();
        let sum = record.get("acc").unwrap() + record.get("loss").unwrap();
        assert!((sum - (1.0 - r_acc / e + r_loss / e)).abs() < 1e-12);
        assert!(out.contains(&format!("epoch={epoch}, acc=")));
    }
}

#[test]
fn quickstart_propagates_tracker_errors() {
    let tracker = RecordingTracker {
        fail_after: Some(1),
        ..Default::default()
    };
    let params = QuickstartParams { epochs: 6, lr: 0.1 };
    let err = quickstart::run(
        &tracker,
        &params,
        &mut StdRng::seed_from_u64(0),
        &mut std::io::sink(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("tracker unreachable"));
    assert_eq!(tracker.log.borrow().status, None);
}

#[test]
fn launch_emits_twenty_records_and_pauses_after_each() {
    let tracker = RecordingTracker::default();
    let clock = ManualClock::new();
    let emitted = launch::run(
        &tracker,
        &LaunchParams::default(),
        &mut StdRng::seed_from_u64(5),
        &clock,
    )
    .unwrap();

    let log = tracker.log.take();
    assert_eq!(emitted, 20);
    assert_eq!(log.records.len(), 20);
    for record in &log.records {
        let keys: Vec<&str> = record.keys().collect();
        assert_eq!(keys, vec!["acc", "loss", "val_acc", "val_loss"]);
        assert!(record.values.values().all(|v| v.is_finite()));
    }

    assert_eq!(clock.pauses(), vec![Duration::from_secs(1); 20]);
    assert_eq!(clock.elapsed(), Duration::from_secs(20));

    assert_eq!(log.project, "launch-test");
    assert_eq!(log.owner.as_deref(), Some("allanstevenson"));
    assert_eq!(log.sources, vec!["launch.rs"]);
    assert_eq!(log.status, Some(RunStatus::Finished));
}

#[test]
fn launch_propagates_tracker_errors() {
    for k in [0, 1, 7] {
        let tracker = RecordingTracker {
            fail_after: Some(k),
            ..Default::default()
        };
        let clock = ManualClock::new();
        let err = launch::run(
            &tracker,
            &LaunchParams::default(),
            &mut StdRng::seed_from_u64(2),
            &clock,
        )
        .unwrap_err();

        assert!(err.to_string().contains("tracker unreachable"));
        let log = tracker.log.borrow();
        assert_eq!(log.records.len(), k);
        assert_eq!(log.status, None);
        assert_eq!(clock.pauses().len(), k);
    }
}

#[test]
fn launch_stops_when_the_source_snapshot_fails() {
    let tracker = RecordingTracker {
        fail_snapshot: true,
        ..Default::default()
    };
    let clock = ManualClock::new();
    let err = launch::run(
        &tracker,
        &LaunchParams::default(),
        &mut StdRng::seed_from_u64(2),
        &clock,
    )
    .unwrap_err();

    assert!(err.to_string().contains("snapshot rejected"));
    let log = tracker.log.borrow();
    assert!(log.records.is_empty());
    assert_eq!(log.status, None);
    assert!(clock.pauses().is_empty());
}

#[test]
fn launch_formulas_use_the_config_held_by_the_run() {
    let seed = 4;
    let stored = RunConfig::new()
        .with("learning_rate", 0.5)
        .with("batch_size", 128i64)
        .with("momentum", 0.25)
        .with("dropout", 0.1);
    let tracker = RecordingTracker {
        stored_config: Some(stored.clone()),
        ..Default::default()
    };
    let params = LaunchParams {
        steps: 1,
        ..Default::default()
    };
    launch::run(&tracker, &params, &mut StdRng::seed_from_u64(seed), &ManualClock::new()).unwrap();

    // Replay: three config draws, two displacement draws, then the step.
    let mut replay = StdRng::seed_from_u64(seed);
    let _ = launch::Hyperparams::sample(&mut replay);
    let d = launch::Displacement::sample(&mut replay);
    let hp = launch::Hyperparams::from_config(&stored).unwrap();
    let expected = launch::step_metrics(0, &hp, &d, &mut replay);

    let log = tracker.log.borrow();
    assert_eq!(log.records[0].values, expected.values);
}

#[test]
fn launch_fails_when_the_run_config_lacks_a_hyperparameter() {
    let tracker = RecordingTracker {
        stored_config: Some(RunConfig::new().with("learning_rate", 0.01)),
        ..Default::default()
    };
    let err = launch::run(
        &tracker,
        &LaunchParams::default(),
        &mut StdRng::seed_from_u64(0),
        &ManualClock::new(),
    )
    .unwrap_err();
    assert!(matches!(err, ExpsimError::MissingConfig(_)));
    assert!(tracker.log.borrow().records.is_empty());
}

#[test]
fn launch_batch_size_is_always_128() {
    for seed in 0..20 {
        let tracker = RecordingTracker::default();
        let params = LaunchParams {
            steps: 1,
            ..Default::default()
        };
        launch::run(
            &tracker,
            &params,
            &mut StdRng::seed_from_u64(seed),
            &ManualClock::new(),
        )
        .unwrap();
        let config = tracker.log.take().config;
        assert_eq!(config.get("batch_size").and_then(|v| v.as_i64()), Some(128));
        assert_eq!(config.len(), 4);
    }
}

#[test]
fn launch_is_reproducible_from_a_seed() {
    let run = |seed| {
        let tracker = RecordingTracker::default();
        launch::run(
            &tracker,
            &LaunchParams::default(),
            &mut StdRng::seed_from_u64(seed),
            &ManualClock::new(),
        )
        .unwrap();
        let log = tracker.log.take();
        (log.config, log.records.iter().map(|r| r.values.clone()).collect::<Vec<_>>())
    };
    assert_eq!(run(9), run(9));
    assert_ne!(run(9).1, run(10).1);
}

#[test]
fn launch_against_local_tracker_persists_the_run() {
    let tmp = TempDir::new().unwrap();
    let tracker = LocalTracker::new(TrackerConfig::new(tmp.path()));
    let params = LaunchParams {
        pause: Duration::ZERO,
        settings: Settings::default().with_job_creation(true),
        ..Default::default()
    };
    launch::run(&tracker, &params, &mut StdRng::seed_from_u64(1), &ManualClock::new()).unwrap();

    let project_dir = tmp.path().join("launch-test");
    let runs = storage::list_runs(&project_dir).unwrap();
    assert_eq!(runs.len(), 1);
    let run_dir = project_dir.join(&runs[0]);

    let rows = storage::read_metrics(&run_dir.join(storage::METRICS_FILE)).unwrap();
    assert_eq!(rows.len(), 20);
    assert!(rows.iter().all(|row| row["val_loss"].is_f64()));

    let meta = storage::load_run_metadata(&run_dir).unwrap();
    assert_eq!(meta.status, RunStatus::Finished);
    assert_eq!(meta.records, 20);
    assert_eq!(meta.summary.len(), 4);
    assert!(run_dir.join("artifacts/code/launch.rs").exists());
    assert!(run_dir.join(storage::JOB_FILE).exists());
}

#[test]
fn quickstart_against_local_tracker_writes_config() {
    let tmp = TempDir::new().unwrap();
    let tracker = LocalTracker::new(TrackerConfig::new(tmp.path()));
    let params = QuickstartParams { epochs: 5, lr: 0.01 };
    quickstart::run(
        &tracker,
        &params,
        &mut StdRng::seed_from_u64(3),
        &mut std::io::sink(),
    )
    .unwrap();

    let project_dir = tmp.path().join("job_example");
    let runs = storage::list_runs(&project_dir).unwrap();
    let run_dir = project_dir.join(&runs[0]);
    assert_eq!(storage::load_config(&run_dir).unwrap(), params.config());
    let rows = storage::read_metrics(&run_dir.join(storage::METRICS_FILE)).unwrap();
    assert_eq!(rows.len(), 3);
    // No source snapshot, so no job even though job creation is on.
    assert!(!run_dir.join(storage::JOB_FILE).exists());
}
