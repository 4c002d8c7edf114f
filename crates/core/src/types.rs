// crates/core/src/types.rs
//! Core data model: job handles, remote statuses and status snapshots.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

/// Metric keys reported by the document-processing service.
pub mod metric_keys {
    pub const CHUNKS_CREATED: &str = "chunks_created";
    pub const IMAGES_EXTRACTED: &str = "images_extracted";
    pub const EMBEDDINGS_GENERATED: &str = "embeddings_generated";
    pub const PAGES_COMPLETED: &str = "pages_completed";
    pub const TOTAL_PAGES: &str = "total_pages";

    /// Keys that are also picked up when reported outside the metrics object.
    pub const KNOWN: &[&str] = &[
        CHUNKS_CREATED,
        IMAGES_EXTRACTED,
        EMBEDDINGS_GENERATED,
        PAGES_COMPLETED,
        TOTAL_PAGES,
    ];
}

/// Status reported by the remote job-tracking endpoint, after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

/// Remote status vocabulary. Endpoints disagree on spelling, so every known
/// variant is listed here rather than guessed at per call site.
const STATUS_ALIASES: &[(&str, JobStatus)] = &[
    ("queued", JobStatus::Queued),
    ("pending", JobStatus::Queued),
    ("waiting", JobStatus::Queued),
    ("running", JobStatus::Running),
    ("processing", JobStatus::Running),
    ("in_progress", JobStatus::Running),
    ("started", JobStatus::Running),
    ("completed", JobStatus::Completed),
    ("complete", JobStatus::Completed),
    ("succeeded", JobStatus::Completed),
    ("success", JobStatus::Completed),
    ("done", JobStatus::Completed),
    ("failed", JobStatus::Failed),
    ("error", JobStatus::Failed),
    ("errored", JobStatus::Failed),
    ("cancelled", JobStatus::Cancelled),
    ("canceled", JobStatus::Cancelled),
    ("aborted", JobStatus::Cancelled),
];

impl JobStatus {
    /// Map a raw remote status string onto a `JobStatus`.
    ///
    /// Matching is case-insensitive and treats `-` and spaces as `_`.
    /// Returns `None` for strings outside the alias table.
    pub fn normalize(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        STATUS_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, status)| *status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one remote asynchronous processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    id: String,
    submitted_at: DateTime<Utc>,
    terminal_states: BTreeSet<JobStatus>,
}

impl JobHandle {
    /// Create a handle for a job submitted now.
    ///
    /// The id is opaque but must contain at least one non-whitespace char.
    pub fn new(id: impl Into<String>) -> Result<Self, MonitorError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MonitorError::EmptyJobId);
        }
        Ok(Self {
            id,
            submitted_at: Utc::now(),
            terminal_states: [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
                .into_iter()
                .collect(),
        })
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = submitted_at;
        self
    }

    /// Override which remote statuses end monitoring.
    ///
    /// `Queued` and `Running` can never be terminal and are ignored.
    pub fn with_terminal_states(mut self, states: impl IntoIterator<Item = JobStatus>) -> Self {
        self.terminal_states = states
            .into_iter()
            .filter(|s| !matches!(s, JobStatus::Queued | JobStatus::Running))
            .collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn terminal_states(&self) -> &BTreeSet<JobStatus> {
        &self.terminal_states
    }

    pub fn is_terminal(&self, status: JobStatus) -> bool {
        self.terminal_states.contains(&status)
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// One observed status reading for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub job_id: String,
    pub observed_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Percentage in `0.0..=100.0`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Error detail reported by the remote job, usually only on `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn new(job_id: impl Into<String>, status: JobStatus, progress: f64) -> Self {
        Self {
            job_id: job_id.into(),
            observed_at: Utc::now(),
            status,
            progress: clamp_progress(progress),
            current_step: None,
            metrics: BTreeMap::new(),
            error: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Same progress percentage and same step label.
    pub fn same_reading(&self, other: &Self) -> bool {
        (self.progress - other.progress).abs() < f64::EPSILON
            && self.current_step == other.current_step
    }
}

/// Clamp a reported percentage into `0..=100`, mapping NaN to 0.
pub(crate) fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}
