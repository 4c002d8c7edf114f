// crates/core/src/lib.rs
//! Monitoring of long-running remote document-processing jobs.
//!
//! - `StatusClient`: one status query per call, normalized into a `StatusSnapshot`
//! - `ProgressAggregator`: per-job history, stall detection and rates
//! - `PollingScheduler`: the per-job polling state machine
//! - `ReportRenderer`: final `Summary` / `BatchReport`
//! - `JobRegistry`: concurrent monitoring of many jobs

pub mod aggregator;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod types;

pub use aggregator::{AggregatedProgress, ProgressAggregator, StallPolicy};
pub use client::{StatusClient, StatusSource};
pub use config::{ClientConfig, MonitorConfig, PollingConfig};
pub use error::{ConfigError, MonitorError, TransportError};
pub use registry::{FinishedJob, JobRegistry};
pub use report::{BatchReport, ReportRenderer, Summary};
pub use scheduler::{PollEvent, PollOptions, PollOutcome, PollState, PollingScheduler};
pub use types::{metric_keys, JobHandle, JobStatus, StatusSnapshot};
