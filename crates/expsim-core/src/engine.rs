//! Async logging engine behind the local tracker.
//!
//! `LoggingEngine::new()` spawns a background tokio task that owns all file handles.
//! `log_metrics()` is a channel send and never blocks the simulation loop.
//! The background task batches records and flushes to Parquet periodically.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::error::{ExpsimError, Result};
use crate::models::{
    JobSpec, MetricRecord, RunConfig, RunMetadata, RunSpec, RunStatus, Settings, SourceSnapshot,
};
use crate::storage;

/// Commands sent to the background logging task.
enum LogCommand {
    /// Log a metric record.
    Metric(MetricRecord),
    /// Write the run configuration.
    Params(RunConfig),
    /// Write a source snapshot into `artifacts/code/`.
    Source(SourceSnapshot),
    /// Log a message to the run log file.
    Log { level: LogLevel, message: String },
    /// Force flush the current buffer to disk.
    Flush(oneshot::Sender<Result<()>>),
    /// Flush everything, write final metadata and stop.
    Shutdown {
        status: RunStatus,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// The non-blocking logging engine.
///
/// Internally holds a sender to a tokio mpsc channel. All heavy I/O
/// happens in a background task on a dedicated tokio runtime thread.
pub struct LoggingEngine {
    sender: mpsc::UnboundedSender<LogCommand>,
    /// Keep the runtime alive as long as the engine exists.
    runtime: Arc<Runtime>,
    /// Set by `close`; later sends fail even if the task has not exited yet.
    closed: AtomicBool,
    spec: RunSpec,
}

impl LoggingEngine {
    /// Create the run directory, write initial metadata and spawn the I/O task.
    pub fn new(spec: RunSpec, settings: Settings) -> Result<Self> {
        let run_dir = spec.run_dir();
        storage::ensure_dir(&run_dir.join(storage::ARTIFACTS_DIR))?;

        let meta = RunMetadata {
            name: spec.run_name.clone(),
            project: spec.project.clone(),
            owner: spec.owner.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ..Default::default()
        };
        storage::save_run_metadata(&run_dir, &meta)?;

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("expsim-io")
                .enable_all()
                .build()
                .map_err(|e| ExpsimError::Other(e.to_string()))?,
        );

        let (sender, receiver) = mpsc::unbounded_channel::<LogCommand>();

        let task = BackgroundTask {
            run_dir,
            settings,
            flush_interval_rows: spec.flush_interval_rows.max(1),
            metric_buffer: Vec::with_capacity(spec.flush_interval_rows * 2),
            log_lines: Vec::new(),
            config: RunConfig::new(),
            last_values: BTreeMap::new(),
            records: 0,
            source: None,
            deferred: None,
            started_at: meta.started_at,
        };
        runtime.spawn(task.run(receiver, spec.flush_interval_ms));

        info!(
            project = %spec.project,
            run = %spec.run_name,
            "LoggingEngine initialized"
        );

        Ok(Self {
            sender,
            runtime,
            closed: AtomicBool::new(false),
            spec,
        })
    }

    /// Queue a metric record. Fails only once the engine has shut down.
    pub fn log_metrics(&self, record: MetricRecord) -> Result<()> {
        self.send(LogCommand::Metric(record))
    }

    /// Queue the run configuration to be written to `config.yaml`.
    pub fn log_params(&self, config: RunConfig) -> Result<()> {
        self.send(LogCommand::Params(config))
    }

    /// Queue a source snapshot to be written under `artifacts/code/`.
    pub fn save_source(&self, source: SourceSnapshot) -> Result<()> {
        self.send(LogCommand::Source(source))
    }

    /// Log a message to the run log.
    pub fn log_message(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.send(LogCommand::Log {
            level,
            message: message.into(),
        })
    }

    /// Force flush the metric buffer to disk and report any deferred storage error.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LogCommand::Flush(tx))?;
        self.runtime
            .block_on(rx)
            .map_err(|_| ExpsimError::ChannelClosed)?
    }

    /// Flush all pending records and write final metadata. Blocks until complete.
    pub fn close(&self, status: RunStatus) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LogCommand::Shutdown { status, reply: tx })?;
        self.closed.store(true, Ordering::SeqCst);
        self.runtime
            .block_on(rx)
            .map_err(|_| ExpsimError::ChannelClosed)?
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, cmd: LogCommand) -> Result<()> {
        if self.is_closed() {
            return Err(ExpsimError::ChannelClosed);
        }
        self.sender.send(cmd).map_err(|_| ExpsimError::ChannelClosed)
    }
}

impl Drop for LoggingEngine {
    fn drop(&mut self) {
        // Runs that were never closed are recorded as crashed.
        let (tx, rx) = oneshot::channel();
        if self
            .send(LogCommand::Shutdown {
                status: RunStatus::Crashed,
                reply: tx,
            })
            .is_ok()
        {
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), rx).await });
        }
    }
}

// ─── Background I/O task ─────────────────────────────────────────────────────

struct BackgroundTask {
    run_dir: PathBuf,
    settings: Settings,
    flush_interval_rows: usize,
    metric_buffer: Vec<MetricRecord>,
    log_lines: Vec<String>,
    config: RunConfig,
    last_values: BTreeMap<String, f64>,
    records: u64,
    source: Option<String>,
    /// First storage error not yet reported to the caller.
    deferred: Option<ExpsimError>,
    started_at: DateTime<Utc>,
}

impl BackgroundTask {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<LogCommand>, flush_ms: u64) {
        let mut flush_ticker = interval(Duration::from_millis(flush_ms.max(1)));
        flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                cmd = receiver.recv() => {
                    match cmd {
                        None => {
                            self.flush_all();
                            break;
                        }
                        Some(LogCommand::Metric(record)) => self.push_metric(record),
                        Some(LogCommand::Params(config)) => {
                            let result = storage::save_config(&self.run_dir, &config);
                            self.defer(result, "save config");
                            self.config = config;
                        }
                        Some(LogCommand::Source(source)) => self.write_source(source),
                        Some(LogCommand::Log { level, message }) => {
                            let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                            self.log_lines.push(format!("[{ts}] [{}] {message}", level.as_str()));
                            if self.log_lines.len() >= 20 {
                                self.flush_logs();
                            }
                        }
                        Some(LogCommand::Flush(reply)) => {
                            self.flush_all();
                            let _ = reply.send(self.take_deferred());
                        }
                        Some(LogCommand::Shutdown { status, reply }) => {
                            self.flush_all();
                            self.finalize(status);
                            let _ = reply.send(self.take_deferred());
                            break;
                        }
                    }
                }

                _ = flush_ticker.tick() => self.flush_all(),
            }
        }
    }

    fn push_metric(&mut self, record: MetricRecord) {
        self.records += 1;
        self.last_values
            .extend(record.values.iter().map(|(k, v)| (k.clone(), *v)));
        self.metric_buffer.push(record);
        if self.metric_buffer.len() >= self.flush_interval_rows {
            self.flush_metrics();
        }
    }

    fn write_source(&mut self, source: SourceSnapshot) {
        if !self.settings.save_code {
            debug!(file = %source.file_name, "save_code disabled, skipping source snapshot");
            return;
        }
        let rel = Path::new(storage::CODE_DIR).join(&source.file_name);
        let dest = self.run_dir.join(storage::ARTIFACTS_DIR).join(&rel);
        let result = dest
            .parent()
            .map_or(Ok(()), storage::ensure_dir)
            .and_then(|_| fs::write(&dest, &source.contents).map_err(ExpsimError::from));
        if result.is_ok() {
            self.source = Some(
                Path::new(storage::ARTIFACTS_DIR)
                    .join(&rel)
                    .to_string_lossy()
                    .to_string(),
            );
        }
        self.defer(result, "save source snapshot");
    }

    fn finalize(&mut self, status: RunStatus) {
        let finished_at = Utc::now();
        let duration = (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;

        let result = storage::load_run_metadata(&self.run_dir).and_then(|mut meta| {
            meta.status = status;
            meta.finished_at = Some(finished_at);
            meta.duration_secs = Some(duration);
            meta.records = self.records;
            meta.summary = self.last_values.clone();
            meta.source = self.source.clone();

            if self.settings.enable_job_creation && status == RunStatus::Finished {
                match &self.source {
                    Some(entrypoint) => {
                        let job = JobSpec {
                            project: meta.project.clone(),
                            owner: meta.owner.clone(),
                            entrypoint: entrypoint.clone(),
                            config: self.config.clone(),
                        };
                        storage::save_job(&self.run_dir, &job)?;
                    }
                    None => debug!("no source snapshot attached, skipping job creation"),
                }
            }

            storage::save_run_metadata(&self.run_dir, &meta)
        });
        self.defer(result, "finalize run metadata");
    }

    fn flush_all(&mut self) {
        self.flush_metrics();
        self.flush_logs();
    }

    fn flush_metrics(&mut self) {
        if self.metric_buffer.is_empty() {
            return;
        }
        let path = self.run_dir.join(storage::METRICS_FILE);
        let result = storage::append_metrics(&path, &self.metric_buffer);
        self.metric_buffer.clear();
        self.defer(result, "flush metrics");
    }

    fn flush_logs(&mut self) {
        if self.log_lines.is_empty() {
            return;
        }
        use std::io::Write;
        let path = self.run_dir.join(storage::LOG_FILE);
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                self.log_lines
                    .iter()
                    .try_for_each(|line| writeln!(f, "{line}"))
            })
            .map_err(ExpsimError::from);
        self.log_lines.clear();
        self.defer(result, "write run log");
    }

    fn defer(&mut self, result: Result<()>, what: &str) {
        if let Err(e) = result {
            error!("Failed to {}: {}", what, e);
            self.deferred.get_or_insert(e);
        }
    }

    fn take_deferred(&mut self) -> Result<()> {
        self.deferred.take().map_or(Ok(()), Err)
    }
}
