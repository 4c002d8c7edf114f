// crates/core/src/aggregator.rs
//! Per-job accumulation of status snapshots.
//!
//! `ProgressAggregator` is fed one snapshot per successful poll via
//! [`record`](ProgressAggregator::record). It tracks stalls (identical
//! readings in a row), progress regressions and suspicious jumps, and derives
//! rates from the history. Call [`finish`](ProgressAggregator::finish) once
//! the poll outcome is known.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TransportError;
use crate::types::StatusSnapshot;

/// Thresholds for stall and anomaly detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallPolicy {
    /// Identical readings in a row before the job counts as stalled.
    pub window: usize,
    /// Single-poll increase in percentage points flagged as suspicious.
    pub jump_threshold: Option<f64>,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            window: 3,
            jump_threshold: None,
        }
    }
}

/// A run of identical readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallRecord {
    pub progress: f64,
    pub current_step: Option<String>,
    pub polls: u32,
}

/// A progress increase larger than the configured jump threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressJump {
    pub from: f64,
    pub to: f64,
    pub at: DateTime<Utc>,
}

/// Accumulated state for one job.
///
/// `history` is append-only and in insertion order, which is also temporal
/// order since a job has exactly one poller.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedProgress {
    pub job_id: String,
    pub history: Vec<StatusSnapshot>,
    /// Identical readings in a row that count as a stall.
    pub stall_window: usize,
    /// Length of the trailing run of identical readings.
    pub unchanged_polls: u32,
    /// Number of distinct stall episodes.
    pub stall_count: u32,
    pub longest_stall: Option<StallRecord>,
    pub regressions: u32,
    pub jumps: Vec<ProgressJump>,
    /// Failed queries, in order. Never part of `history`.
    pub transport_errors: Vec<TransportError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AggregatedProgress {
    pub fn latest(&self) -> Option<&StatusSnapshot> {
        self.history.last()
    }

    pub fn earliest(&self) -> Option<&StatusSnapshot> {
        self.history.first()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Percentage points per second between the first and latest snapshot.
    ///
    /// 0 with fewer than two snapshots or no elapsed time between them.
    pub fn rate_of_change(&self) -> f64 {
        match (self.earliest(), self.latest()) {
            (Some(first), Some(last)) => rate(first.progress, last.progress, first.observed_at, last.observed_at),
            _ => 0.0,
        }
    }

    /// Units per second for one metric, e.g. `pages_completed` -> pages/sec.
    pub fn metric_rate(&self, key: &str) -> f64 {
        let first = self
            .history
            .iter()
            .find_map(|s| s.metric(key).map(|v| (v, s.observed_at)));
        let last = self
            .history
            .iter()
            .rev()
            .find_map(|s| s.metric(key).map(|v| (v, s.observed_at)));
        match (first, last) {
            (Some((v0, t0)), Some((v1, t1))) => rate(v0, v1, t0, t1),
            _ => 0.0,
        }
    }

    /// Rate for every metric present in the latest snapshot.
    pub fn metric_rates(&self) -> BTreeMap<String, f64> {
        let Some(latest) = self.latest() else {
            return BTreeMap::new();
        };
        latest
            .metrics
            .keys()
            .map(|k| (k.clone(), self.metric_rate(k)))
            .collect()
    }

    /// Time from start until finish, or until the latest snapshot while
    /// still polling.
    pub fn elapsed(&self) -> Duration {
        let Some(start) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self
            .finished_at
            .or_else(|| self.latest().map(|s| s.observed_at))
            .unwrap_or(start);
        (end - start).to_std().unwrap_or(Duration::ZERO)
    }

    /// The stall in progress at the latest snapshot, if any.
    pub fn current_stall(&self) -> Option<StallRecord> {
        let latest = self.latest()?;
        (self.unchanged_polls as usize >= self.stall_window).then(|| StallRecord {
            progress: latest.progress,
            current_step: latest.current_step.clone(),
            polls: self.unchanged_polls,
        })
    }
}

fn rate(v0: f64, v1: f64, t0: DateTime<Utc>, t1: DateTime<Utc>) -> f64 {
    let secs = (t1 - t0).num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 {
        0.0
    } else {
        (v1 - v0) / secs
    }
}

/// Accumulates snapshots for exactly one job.
pub struct ProgressAggregator {
    policy: StallPolicy,
    progress: AggregatedProgress,
    stalled: bool,
}

impl ProgressAggregator {
    pub fn new(job_id: impl Into<String>, policy: StallPolicy) -> Self {
        Self {
            policy,
            progress: AggregatedProgress {
                job_id: job_id.into(),
                stall_window: policy.window,
                ..AggregatedProgress::default()
            },
            stalled: false,
        }
    }

    pub fn policy(&self) -> &StallPolicy {
        &self.policy
    }

    /// Mark the moment monitoring began.
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.progress.started_at = Some(at);
    }

    /// Append a snapshot and update stall/anomaly tracking.
    pub fn record(&mut self, snapshot: StatusSnapshot) -> &AggregatedProgress {
        let job_id = self.progress.job_id.as_str();

        match self.progress.history.last() {
            Some(prev) => {
                if snapshot.same_reading(prev) {
                    self.progress.unchanged_polls += 1;
                } else {
                    self.progress.unchanged_polls = 1;
                }

                let delta = snapshot.progress - prev.progress;
                if delta < 0.0 {
                    self.progress.regressions += 1;
                    tracing::warn!(
                        job_id,
                        from = prev.progress,
                        to = snapshot.progress,
                        "Progress went backwards"
                    );
                }
                if let Some(threshold) = self.policy.jump_threshold {
                    if delta >= threshold {
                        tracing::warn!(
                            job_id,
                            from = prev.progress,
                            to = snapshot.progress,
                            "Suspicious progress jump"
                        );
                        self.progress.jumps.push(ProgressJump {
                            from: prev.progress,
                            to: snapshot.progress,
                            at: snapshot.observed_at,
                        });
                    }
                }
            }
            None => self.progress.unchanged_polls = 1,
        }

        self.progress.history.push(snapshot);

        let now_stalled = self.progress.unchanged_polls as usize >= self.policy.window;
        if now_stalled {
            if !self.stalled {
                self.progress.stall_count += 1;
                if let Some(latest) = self.progress.latest() {
                    tracing::warn!(
                        job_id = %self.progress.job_id,
                        progress = latest.progress,
                        step = latest.current_step.as_deref().unwrap_or(""),
                        polls = self.progress.unchanged_polls,
                        "Job progress stalled"
                    );
                }
            }
            if let Some(current) = self.progress.current_stall() {
                let longer = self
                    .progress
                    .longest_stall
                    .as_ref()
                    .map_or(true, |l| current.polls > l.polls);
                if longer {
                    self.progress.longest_stall = Some(current);
                }
            }
        }
        self.stalled = now_stalled;

        &self.progress
    }

    /// True when the last `window` snapshots share progress and step label.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn rate_of_change(&self) -> f64 {
        self.progress.rate_of_change()
    }

    /// Record a failed query. History is left untouched.
    pub fn note_transport_error(&mut self, error: TransportError) {
        self.progress.transport_errors.push(error);
    }

    pub fn progress(&self) -> &AggregatedProgress {
        &self.progress
    }

    /// Stamp the moment the poll outcome was decided.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.progress.finished_at = Some(at);
    }

    pub fn into_progress(self) -> AggregatedProgress {
        self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{metric_keys, JobStatus};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn snap(progress: f64, step: &str, at: i64) -> StatusSnapshot {
        StatusSnapshot::new("job", JobStatus::Running, progress)
            .with_step(step)
            .with_observed_at(t(at))
    }

    #[test]
    fn test_three_identical_readings_stall() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        agg.record(snap(5.0, "processing", 0));
        agg.record(snap(5.0, "processing", 5));
        assert!(!agg.is_stalled());
        agg.record(snap(5.0, "processing", 10));
        assert!(agg.is_stalled());
        assert_eq!(agg.progress().stall_count, 1);
        assert_eq!(agg.progress().unchanged_polls, 3);
    }

    #[test]
    fn test_advancing_progress_not_stalled() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        for (i, p) in [5.0, 10.0, 15.0].into_iter().enumerate() {
            agg.record(snap(p, "processing", i as i64 * 5));
        }
        assert!(!agg.is_stalled());
        assert_eq!(agg.progress().stall_count, 0);
    }

    #[test]
    fn test_step_change_breaks_stall() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        agg.record(snap(5.0, "processing", 0));
        agg.record(snap(5.0, "processing", 5));
        agg.record(snap(5.0, "extracting images", 10));
        assert!(!agg.is_stalled());
    }

    #[test]
    fn test_stall_episodes_and_longest() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        let readings = [5.0, 5.0, 5.0, 5.0, 20.0, 20.0, 20.0, 40.0];
        for (i, p) in readings.into_iter().enumerate() {
            agg.record(snap(p, "processing", i as i64));
        }
        let progress = agg.progress();
        assert_eq!(progress.stall_count, 2);
        assert_eq!(
            progress.longest_stall,
            Some(StallRecord {
                progress: 5.0,
                current_step: Some("processing".into()),
                polls: 4,
            })
        );
        assert!(!agg.is_stalled());
    }

    #[test]
    fn test_rate_of_change() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        assert_eq!(agg.rate_of_change(), 0.0);
        agg.record(snap(10.0, "processing", 0));
        assert_eq!(agg.rate_of_change(), 0.0);
        agg.record(snap(30.0, "processing", 10));
        assert_eq!(agg.rate_of_change(), 2.0);
    }

    #[test]
    fn test_rate_of_change_same_timestamp() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        agg.record(snap(10.0, "a", 0));
        agg.record(snap(30.0, "b", 0));
        assert_eq!(agg.rate_of_change(), 0.0);
    }

    #[test]
    fn test_metric_rate_pages_per_sec() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        agg.record(snap(0.0, "start", 0));
        agg.record(snap(10.0, "pages", 5).with_metric(metric_keys::PAGES_COMPLETED, 2.0));
        agg.record(snap(50.0, "pages", 15).with_metric(metric_keys::PAGES_COMPLETED, 12.0));
        assert_eq!(agg.progress().metric_rate(metric_keys::PAGES_COMPLETED), 1.0);
        assert_eq!(agg.progress().metric_rate("missing"), 0.0);
        let rates = agg.progress().metric_rates();
        assert_eq!(rates.get(metric_keys::PAGES_COMPLETED), Some(&1.0));
    }

    #[test]
    fn test_regression_and_jump_detection() {
        let policy = StallPolicy {
            window: 3,
            jump_threshold: Some(50.0),
        };
        let mut agg = ProgressAggregator::new("job", policy);
        agg.record(snap(5.0, "processing", 0));
        agg.record(snap(100.0, "done", 5));
        agg.record(snap(90.0, "done", 10));
        let progress = agg.progress();
        assert_eq!(progress.regressions, 1);
        assert_eq!(progress.jumps.len(), 1);
        assert_eq!(progress.jumps[0].from, 5.0);
        assert_eq!(progress.jumps[0].to, 100.0);
    }

    #[test]
    fn test_transport_errors_do_not_touch_history() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        agg.record(snap(5.0, "processing", 0));
        agg.note_transport_error(TransportError::network("reset"));
        agg.note_transport_error(TransportError::network("reset"));
        assert_eq!(agg.progress().len(), 1);
        assert_eq!(agg.progress().transport_errors.len(), 2);
    }

    #[test]
    fn test_finish_and_elapsed() {
        let mut agg = ProgressAggregator::new("job", StallPolicy::default());
        agg.start(t(0));
        agg.record(snap(5.0, "processing", 5));
        assert_eq!(agg.progress().elapsed(), Duration::from_secs(5));
        agg.finish(t(20));
        let done = agg.into_progress();
        assert_eq!(done.elapsed(), Duration::from_secs(20));
        assert_eq!(done.finished_at, Some(t(20)));
    }

    proptest! {
        #[test]
        fn prop_history_order_and_non_negative_rate(
            steps in prop::collection::vec((0u8..10, 0i64..30), 1..40)
        ) {
            let mut agg = ProgressAggregator::new("job", StallPolicy::default());
            let mut progress = 0.0;
            let mut at = 0;
            let mut expected = Vec::new();
            for (dp, dt) in steps {
                progress = (progress + dp as f64).min(100.0);
                at += dt;
                let s = snap(progress, "processing", at);
                expected.push(s.clone());
                agg.record(s);
            }
            prop_assert_eq!(&agg.progress().history, &expected);
            prop_assert!(agg.rate_of_change() >= 0.0);
        }
    }
}
