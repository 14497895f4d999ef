//! The contract between the simulations and an experiment tracker, plus the
//! local file-backed implementation.

use crate::engine::{LogLevel, LoggingEngine};
use crate::error::Result;
use crate::models::{
    MetricRecord, RunConfig, RunSpec, RunStatus, Settings, SourceSnapshot, TrackerConfig,
};

/// Opens runs. Settings are passed per run, never held as global state.
pub trait Tracker {
    type Run: RunHandle;

    fn open_run(
        &self,
        project: &str,
        owner: Option<&str>,
        config: RunConfig,
        settings: &Settings,
    ) -> Result<Self::Run>;
}

/// A run that accepts metric records until it is finished.
pub trait RunHandle {
    fn config(&self) -> &RunConfig;

    /// Append one record. Storage errors surface from [`RunHandle::finish`].
    fn append(&mut self, record: MetricRecord) -> Result<()>;

    /// Attach the invoking program's source to the run.
    fn snapshot_source(&mut self, source: &SourceSnapshot) -> Result<()>;

    /// Flush everything and record the final status.
    fn finish(self, status: RunStatus) -> Result<()>
    where
        Self: Sized;
}

/// Tracker writing runs to `<base_dir>/<project>/<run_name>/`.
#[derive(Debug, Clone)]
pub struct LocalTracker {
    config: TrackerConfig,
}

impl LocalTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }
}

impl Tracker for LocalTracker {
    type Run = LocalRun;

    fn open_run(
        &self,
        project: &str,
        owner: Option<&str>,
        config: RunConfig,
        settings: &Settings,
    ) -> Result<LocalRun> {
        let spec = RunSpec::new(project, owner.map(str::to_string), &self.config);
        let engine = LoggingEngine::new(spec, *settings)?;
        engine.log_params(config.clone())?;
        engine.log_message(
            LogLevel::Info,
            format!("run opened with {} config keys", config.len()),
        )?;
        Ok(LocalRun {
            engine,
            config,
            next_step: 0,
        })
    }
}

/// Run handle of the [`LocalTracker`].
pub struct LocalRun {
    engine: LoggingEngine,
    config: RunConfig,
    next_step: u64,
}

impl LocalRun {
    pub fn spec(&self) -> &RunSpec {
        self.engine.spec()
    }

    /// Persist everything appended so far without finishing the run.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }
}

impl RunHandle for LocalRun {
    fn config(&self) -> &RunConfig {
        &self.config
    }

    fn append(&mut self, mut record: MetricRecord) -> Result<()> {
        let step = *record.step.get_or_insert(self.next_step);
        self.engine.log_metrics(record)?;
        self.next_step = step + 1;
        Ok(())
    }

    fn snapshot_source(&mut self, source: &SourceSnapshot) -> Result<()> {
        self.engine.save_source(source.clone())
    }

    fn finish(self, status: RunStatus) -> Result<()> {
        let level = match status {
            RunStatus::Finished => LogLevel::Info,
            RunStatus::Running => LogLevel::Warn,
            RunStatus::Failed | RunStatus::Crashed => LogLevel::Error,
        };
        self.engine.log_message(level, format!("run finished: {status}"))?;
        self.engine.close(status)
    }
}
