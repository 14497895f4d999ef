//! expsim-core: synthetic training runs and the tracker they report to.
//!
//! The simulations in [`sim`] only see the [`Tracker`]/[`RunHandle`] contract.
//! [`LocalTracker`] implements it on top of [`LoggingEngine`], where appending a
//! record is a channel send and a background tokio task handles all I/O.

pub mod clock;
pub mod engine;
pub mod error;
pub mod models;
pub mod sim;
pub mod storage;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{LogLevel, LoggingEngine};
pub use error::ExpsimError;
pub use models::{
    ConfigValue, MetricRecord, RunConfig, RunMetadata, RunSpec, RunStatus, Settings, SourceSnapshot,
    TrackerConfig,
};
pub use tracker::{LocalRun, LocalTracker, RunHandle, Tracker};
