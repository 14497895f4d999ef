//! Data models for expsim.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the local tracker keeps its runs and how often it flushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Root directory for all projects
    pub base_dir: PathBuf,
    /// Flush metrics to disk every N rows (default: 50)
    pub flush_interval_rows: usize,
    /// Flush metrics to disk every N milliseconds (default: 500)
    pub flush_interval_ms: u64,
}

impl TrackerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            flush_interval_rows: 50,
            flush_interval_ms: 500,
        }
    }

    pub fn with_flush_interval_rows(mut self, rows: usize) -> Self {
        self.flush_interval_rows = rows;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}

/// Identity and location of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Project the run belongs to (e.g. "launch-test")
    pub project: String,
    /// Owner/entity of the project, if any
    pub owner: Option<String>,
    /// Name of this specific run (auto-generated by [`RunSpec::new`])
    pub run_name: String,
    pub base_dir: PathBuf,
    pub flush_interval_rows: usize,
    pub flush_interval_ms: u64,
}

impl RunSpec {
    pub fn new(project: impl Into<String>, owner: Option<String>, tracker: &TrackerConfig) -> Self {
        let now = chrono::Local::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            project: project.into(),
            owner,
            run_name: format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8]),
            base_dir: tracker.base_dir.clone(),
            flush_interval_rows: tracker.flush_interval_rows,
            flush_interval_ms: tracker.flush_interval_ms,
        }
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = run_name.into();
        self
    }

    pub fn run_dir(&self) -> PathBuf {
        self.project_dir().join(&self.run_name)
    }

    pub fn project_dir(&self) -> PathBuf {
        self.base_dir.join(&self.project)
    }
}

/// Process-independent switches consumed by the tracker when a run is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Write a relaunchable `job.yaml` when a run with a source snapshot finishes.
    pub enable_job_creation: bool,
    /// Persist source snapshots. When off, `snapshot_source` is a no-op.
    pub save_code: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_job_creation: false,
            save_code: true,
        }
    }
}

impl Settings {
    pub fn with_job_creation(mut self, enabled: bool) -> Self {
        self.enable_job_creation = enabled;
        self
    }

    pub fn with_save_code(mut self, enabled: bool) -> Self {
        self.save_code = enabled;
        self
    }
}

/// A single configuration value: float, int or bool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConfigValue {
    /// Numeric view of the value; ints widen, everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}
impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}
impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

/// Hyperparameters of a run. Built once, then handed to the tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ConfigValue::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One set of named scalar values appended to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Assigned by the tracker when left unset.
    pub step: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl MetricRecord {
    pub fn new() -> Self {
        Self {
            step: None,
            timestamp: Utc::now(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl Default for MetricRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Source code attached to a run, usually embedded with `include_str!`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub file_name: String,
    pub contents: String,
}

impl SourceSnapshot {
    pub fn new(file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            contents: contents.into(),
        }
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Crashed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Crashed => write!(f, "CRASHED"),
        }
    }
}

/// Metadata stored alongside a run in `run.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Number of metric records appended.
    #[serde(default)]
    pub records: u64,
    /// Latest value of every metric seen during the run.
    #[serde(default)]
    pub summary: BTreeMap<String, f64>,
    /// Path of the source snapshot, relative to the run directory.
    #[serde(default)]
    pub source: Option<String>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            project: String::new(),
            owner: None,
            status: RunStatus::Crashed,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            records: 0,
            summary: BTreeMap::new(),
            source: None,
        }
    }
}

/// Relaunch description written when job creation is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub project: String,
    pub owner: Option<String>,
    /// Source snapshot path, relative to the run directory.
    pub entrypoint: String,
    pub config: RunConfig,
}
