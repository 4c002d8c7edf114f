// crates/core/src/report.rs
//! Final summaries for monitored jobs, single and batched.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::aggregator::AggregatedProgress;
use crate::scheduler::{PollOutcome, PollState};
use crate::types::JobHandle;

/// Final report for one job. Produced for every outcome, failures included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub job_id: String,
    pub status: PollState,
    pub submitted_at: DateTime<Utc>,
    #[serde(rename = "elapsedSecs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    /// Successful status readings.
    pub snapshots: usize,
    pub final_progress: Option<f64>,
    pub final_step: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    pub stall_count: u32,
    /// Percentage points per second over the whole run.
    pub progress_rate: f64,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Combined report once every job in a batch is terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub jobs: usize,
    /// Job count per terminal state.
    pub counts: BTreeMap<String, usize>,
    /// Metrics summed across jobs.
    pub metrics: BTreeMap<String, f64>,
    #[serde(rename = "longestElapsedSecs", serialize_with = "as_secs")]
    pub longest_elapsed: Duration,
    pub summaries: Vec<Summary>,
    /// Jobs whose poller died before reaching an outcome.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aborted: Vec<String>,
}

impl BatchReport {
    pub fn count(&self, state: PollState) -> usize {
        self.counts.get(state.as_str()).copied().unwrap_or(0)
    }

    /// True when every job completed. Aborted jobs count against it.
    pub fn all_completed(&self) -> bool {
        self.aborted.is_empty() && self.count(PollState::Completed) == self.jobs
    }
}

pub struct ReportRenderer;

impl ReportRenderer {
    pub fn render(handle: &JobHandle, outcome: &PollOutcome, progress: &AggregatedProgress) -> Summary {
        let last = outcome.last_snapshot().or_else(|| progress.latest());

        let mut errors: Vec<String> = progress
            .transport_errors
            .iter()
            .map(|e| e.to_string())
            .collect();
        if let PollOutcome::Failed { error: Some(e), .. } = outcome {
            errors.push(e.clone());
        }

        Summary {
            job_id: handle.id().to_string(),
            status: outcome.state(),
            submitted_at: handle.submitted_at(),
            elapsed: progress.elapsed(),
            snapshots: progress.len(),
            final_progress: last.map(|s| s.progress),
            final_step: last.and_then(|s| s.current_step.clone()),
            metrics: last.map(|s| s.metrics.clone()).unwrap_or_default(),
            stall_count: progress.stall_count,
            progress_rate: progress.rate_of_change(),
            errors,
            diagnostic: diagnose(outcome, progress),
        }
    }

    /// `aborted` lists jobs that never produced a summary. They count
    /// towards `jobs` but not towards any terminal state.
    pub fn render_batch(mut summaries: Vec<Summary>, mut aborted: Vec<String>) -> BatchReport {
        summaries.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        aborted.sort();

        let mut counts = BTreeMap::new();
        let mut metrics = BTreeMap::new();
        let mut longest_elapsed = Duration::ZERO;
        for summary in &summaries {
            *counts.entry(summary.status.as_str().to_string()).or_insert(0) += 1;
            for (key, value) in &summary.metrics {
                *metrics.entry(key.clone()).or_insert(0.0) += value;
            }
            longest_elapsed = longest_elapsed.max(summary.elapsed);
        }

        BatchReport {
            jobs: summaries.len() + aborted.len(),
            counts,
            metrics,
            longest_elapsed,
            summaries,
            aborted,
        }
    }
}

/// Human-readable explanation for anything other than a clean completion.
fn diagnose(outcome: &PollOutcome, progress: &AggregatedProgress) -> Option<String> {
    let mut parts = Vec::new();
    let elapsed = progress.elapsed().as_secs_f64();

    match outcome {
        PollOutcome::Completed { .. } => {}
        PollOutcome::Failed { error, .. } => {
            parts.push(match error {
                Some(e) => format!("job reported failure: {e}"),
                None => "job reported failure without error detail".to_string(),
            });
            if let Some(stall) = &progress.longest_stall {
                parts.push(format!(
                    "longest stall: progress stuck at {}% for {} consecutive polls",
                    stall.progress, stall.polls
                ));
            }
        }
        PollOutcome::TimedOut { last } => match (last, progress.current_stall()) {
            (_, Some(stall)) => parts.push(match &stall.current_step {
                Some(step) => format!(
                    "progress stuck at {}% for {} consecutive polls (step: {step})",
                    stall.progress, stall.polls
                ),
                None => format!(
                    "progress stuck at {}% for {} consecutive polls",
                    stall.progress, stall.polls
                ),
            }),
            (Some(last), None) => parts.push(format!(
                "no terminal status after {elapsed:.0}s; last progress {}% ({})",
                last.progress,
                last.status
            )),
            (None, None) => parts.push(format!("no status received within {elapsed:.0}s")),
        },
        PollOutcome::TransportExhausted { error } => parts.push(format!(
            "status endpoint unreachable; {} failed queries, last error: {error}",
            progress.transport_errors.len()
        )),
        PollOutcome::Cancelled { last } => parts.push(match last {
            Some(last) => format!("cancelled at {}% ({})", last.progress, last.status),
            None => "cancelled before any status was received".to_string(),
        }),
    }

    if progress.regressions > 0 {
        parts.push(format!("progress went backwards {} times", progress.regressions));
    }
    for jump in &progress.jumps {
        parts.push(format!("suspicious jump from {}% to {}%", jump.from, jump.to));
    }

    (!parts.is_empty()).then(|| parts.join("; "))
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} after {:.1}s ({} snapshots",
            self.job_id,
            self.status,
            self.elapsed.as_secs_f64(),
            self.snapshots
        )?;
        if let Some(p) = self.final_progress {
            write!(f, ", {p}%")?;
        }
        write!(f, ")")?;
        if !self.metrics.is_empty() {
            let metrics: Vec<String> = self.metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "\n  metrics: {}", metrics.join(", "))?;
        }
        if self.stall_count > 0 {
            write!(f, "\n  stalls: {}", self.stall_count)?;
        }
        if let Some(d) = &self.diagnostic {
            write!(f, "\n  diagnostic: {d}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for summary in &self.summaries {
            writeln!(f, "{summary}")?;
        }
        for job_id in &self.aborted {
            writeln!(f, "{job_id}: aborted (poller died without an outcome)")?;
        }
        let mut counts: Vec<String> = self.counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if !self.aborted.is_empty() {
            counts.push(format!("aborted={}", self.aborted.len()));
        }
        write!(
            f,
            "{} jobs ({}), longest {:.1}s",
            self.jobs,
            counts.join(", "),
            self.longest_elapsed.as_secs_f64()
        )?;
        if !self.metrics.is_empty() {
            let metrics: Vec<String> = self.metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "\ntotals: {}", metrics.join(", "))?;
        }
        Ok(())
    }
}
