// crates/core/src/scheduler.rs
//! Polling state machine for a single job.
//!
//! `Idle -> Polling -> {Completed, Failed, TimedOut, TransportExhausted, Cancelled}`
//!
//! Each iteration waits one interval, queries the [`StatusSource`] and feeds
//! successful snapshots into the job's [`ProgressAggregator`]. Cancellation is
//! cooperative: it is checked at the top of every iteration and interrupts the
//! wait, but never an in-flight query.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregatedProgress, ProgressAggregator, StallPolicy};
use crate::client::StatusSource;
use crate::error::{MonitorError, TransportError};
use crate::report::{ReportRenderer, Summary};
use crate::types::{JobHandle, JobStatus, StatusSnapshot};

/// Per-job polling policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    pub interval: Duration,
    /// Wall-clock budget measured from `start`.
    pub max_duration: Duration,
    /// Consecutive failed queries that end monitoring.
    pub max_consecutive_errors: u32,
    pub stall_window: usize,
    /// Multiplier applied to the interval after every stalled poll.
    /// The interval returns to its base value once progress moves again.
    pub stall_backoff: Option<f64>,
    pub max_interval: Duration,
    pub jump_threshold: Option<f64>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_duration: Duration::from_secs(600),
            max_consecutive_errors: 3,
            stall_window: 3,
            stall_backoff: None,
            max_interval: Duration::from_secs(60),
            jump_threshold: None,
        }
    }
}

impl PollOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_max_consecutive_errors(mut self, n: u32) -> Self {
        self.max_consecutive_errors = n;
        self
    }

    pub fn with_stall_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.stall_backoff = Some(multiplier);
        self.max_interval = max_interval;
        self
    }

    pub fn with_jump_threshold(mut self, points: f64) -> Self {
        self.jump_threshold = Some(points);
        self
    }

    pub fn stall_policy(&self) -> StallPolicy {
        StallPolicy {
            window: self.stall_window,
            jump_threshold: self.jump_threshold,
        }
    }
}

/// Lifecycle of one poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Polling,
    Completed,
    Failed,
    TimedOut,
    TransportExhausted,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Polling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::TransportExhausted => "transport_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of monitoring one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Completed {
        snapshot: StatusSnapshot,
    },
    /// The remote job reported failure.
    Failed {
        error: Option<String>,
        snapshot: StatusSnapshot,
    },
    /// The local time budget ran out.
    TimedOut {
        last: Option<StatusSnapshot>,
    },
    TransportExhausted {
        error: TransportError,
    },
    /// Cancelled locally, or reported cancelled by the remote service.
    Cancelled {
        last: Option<StatusSnapshot>,
    },
}

impl PollOutcome {
    pub fn state(&self) -> PollState {
        match self {
            Self::Completed { .. } => PollState::Completed,
            Self::Failed { .. } => PollState::Failed,
            Self::TimedOut { .. } => PollState::TimedOut,
            Self::TransportExhausted { .. } => PollState::TransportExhausted,
            Self::Cancelled { .. } => PollState::Cancelled,
        }
    }

    pub fn last_snapshot(&self) -> Option<&StatusSnapshot> {
        match self {
            Self::Completed { snapshot } | Self::Failed { snapshot, .. } => Some(snapshot),
            Self::TimedOut { last } | Self::Cancelled { last } => last.as_ref(),
            Self::TransportExhausted { .. } => None,
        }
    }
}

/// Progress update published after every poll and on the terminal transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEvent {
    pub job_id: String,
    pub poll: u32,
    pub state: PollState,
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    pub stalled: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Monotonic clock anchored to wall-clock time at `start`.
///
/// Snapshot timestamps come from here rather than `Utc::now()` so rates and
/// elapsed times never see wall-clock adjustments.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl Anchor {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.wall + chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Drives polling for exactly one job and owns its aggregator.
pub struct PollingScheduler {
    source: Arc<dyn StatusSource>,
    handle: JobHandle,
    options: PollOptions,
    state: PollState,
    aggregator: ProgressAggregator,
    cancel: CancellationToken,
    events: Option<broadcast::Sender<PollEvent>>,
    anchor: Option<Anchor>,
    interval: Duration,
    polls: u32,
    consecutive_errors: u32,
    outcome: Option<PollOutcome>,
}

impl PollingScheduler {
    pub fn new(source: Arc<dyn StatusSource>, handle: JobHandle, options: PollOptions) -> Self {
        let aggregator = ProgressAggregator::new(handle.id(), options.stall_policy());
        let interval = options.interval;
        Self {
            source,
            handle,
            options,
            state: PollState::Idle,
            aggregator,
            cancel: CancellationToken::new(),
            events: None,
            anchor: None,
            interval,
            polls: 0,
            consecutive_errors: 0,
            outcome: None,
        }
    }

    /// Publish a [`PollEvent`] on `tx` after every poll.
    pub fn with_events(mut self, tx: broadcast::Sender<PollEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn progress(&self) -> &AggregatedProgress {
        self.aggregator.progress()
    }

    pub fn outcome(&self) -> Option<&PollOutcome> {
        self.outcome.as_ref()
    }

    /// Token that stops this poller at its next iteration.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Transition `Idle -> Polling`.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        match self.state {
            PollState::Idle => {}
            PollState::Polling => {
                return Err(MonitorError::AlreadyPolling {
                    job_id: self.handle.id().to_string(),
                })
            }
            _ => {
                return Err(MonitorError::AlreadyFinished {
                    job_id: self.handle.id().to_string(),
                })
            }
        }

        let anchor = Anchor::now();
        self.anchor = Some(anchor);
        self.aggregator.start(anchor.wall);
        self.state = PollState::Polling;
        tracing::info!(
            job_id = %self.handle,
            interval_secs = self.options.interval.as_secs_f64(),
            max_duration_secs = self.options.max_duration.as_secs_f64(),
            "Started polling job"
        );
        Ok(())
    }

    /// Poll until a terminal state is reached. Starts the poller if idle.
    pub async fn run(&mut self) -> Result<PollOutcome, MonitorError> {
        match self.state {
            PollState::Idle => self.start()?,
            PollState::Polling => {}
            _ => {
                return Err(MonitorError::AlreadyFinished {
                    job_id: self.handle.id().to_string(),
                })
            }
        }

        let max_duration = self.options.max_duration;
        let outcome = loop {
            if self.cancel.is_cancelled() {
                break PollOutcome::Cancelled {
                    last: self.progress().latest().cloned(),
                };
            }

            let elapsed = self.elapsed();
            if elapsed >= max_duration {
                break PollOutcome::TimedOut {
                    last: self.progress().latest().cloned(),
                };
            }

            let wait = self.interval.min(max_duration - elapsed);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => continue,
                _ = tokio::time::sleep(wait) => {}
            }

            let elapsed = self.elapsed();
            if elapsed >= max_duration {
                continue;
            }

            let query = self.source.query(&self.handle);
            let result = match tokio::time::timeout(max_duration - elapsed, query).await {
                Ok(result) => result,
                Err(_) => continue,
            };

            if let Some(outcome) = self.handle_result(result) {
                break outcome;
            }
        };

        self.finalize(outcome.clone());
        Ok(outcome)
    }

    /// Summary of the finished run. `None` while still polling.
    pub fn summary(&self) -> Option<Summary> {
        let outcome = self.outcome.as_ref()?;
        Some(ReportRenderer::render(&self.handle, outcome, self.progress()))
    }

    /// Release the accumulated state.
    pub fn into_progress(self) -> AggregatedProgress {
        self.aggregator.into_progress()
    }

    fn elapsed(&self) -> Duration {
        self.anchor.map(|a| a.elapsed()).unwrap_or(Duration::ZERO)
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.anchor.map(|a| a.wall_now()).unwrap_or_else(Utc::now)
    }

    fn handle_result(&mut self, result: Result<StatusSnapshot, TransportError>) -> Option<PollOutcome> {
        self.polls += 1;
        match result {
            Ok(mut snapshot) => {
                self.consecutive_errors = 0;
                snapshot.job_id = self.handle.id().to_string();
                snapshot.observed_at = self.wall_now();
                let status = snapshot.status;

                self.aggregator.record(snapshot.clone());
                let stalled = self.aggregator.is_stalled();
                self.adjust_interval(stalled);

                tracing::debug!(
                    job_id = %self.handle,
                    poll = self.polls,
                    status = %status,
                    progress = snapshot.progress,
                    step = snapshot.current_step.as_deref().unwrap_or(""),
                    stalled,
                    "Polled job status"
                );
                self.emit(PollEvent {
                    job_id: self.handle.id().to_string(),
                    poll: self.polls,
                    state: PollState::Polling,
                    status: Some(status),
                    progress: Some(snapshot.progress),
                    current_step: snapshot.current_step.clone(),
                    stalled,
                    error: None,
                    timestamp: snapshot.observed_at,
                });

                if !self.handle.is_terminal(status) {
                    return None;
                }
                match status {
                    JobStatus::Completed => Some(PollOutcome::Completed { snapshot }),
                    JobStatus::Failed => Some(PollOutcome::Failed {
                        error: snapshot.error.clone(),
                        snapshot,
                    }),
                    JobStatus::Cancelled => Some(PollOutcome::Cancelled {
                        last: Some(snapshot),
                    }),
                    JobStatus::Queued | JobStatus::Running => None,
                }
            }
            Err(error) => {
                self.consecutive_errors += 1;
                tracing::warn!(
                    job_id = %self.handle,
                    poll = self.polls,
                    consecutive = self.consecutive_errors,
                    error = %error,
                    "Status query failed"
                );
                self.aggregator.note_transport_error(error.clone());
                self.emit(PollEvent {
                    job_id: self.handle.id().to_string(),
                    poll: self.polls,
                    state: PollState::Polling,
                    status: None,
                    progress: None,
                    current_step: None,
                    stalled: self.aggregator.is_stalled(),
                    error: Some(error.to_string()),
                    timestamp: self.wall_now(),
                });

                (self.consecutive_errors >= self.options.max_consecutive_errors)
                    .then_some(PollOutcome::TransportExhausted { error })
            }
        }
    }

    fn adjust_interval(&mut self, stalled: bool) {
        let Some(multiplier) = self.options.stall_backoff else {
            return;
        };
        // Multipliers below 1.0 or non-finite ones disable backoff.
        if !(multiplier >= 1.0 && multiplier.is_finite()) {
            return;
        }
        if stalled {
            let ceiling = self.options.max_interval.max(self.options.interval);
            self.interval = Duration::try_from_secs_f64(self.interval.as_secs_f64() * multiplier)
                .unwrap_or(ceiling)
                .min(ceiling);
        } else {
            self.interval = self.options.interval;
        }
    }

    fn finalize(&mut self, outcome: PollOutcome) {
        let at = self.wall_now();
        self.aggregator.finish(at);
        self.state = outcome.state();

        let progress = self.progress();
        tracing::info!(
            job_id = %self.handle,
            outcome = %self.state,
            polls = self.polls,
            snapshots = progress.len(),
            transport_errors = progress.transport_errors.len(),
            elapsed_secs = progress.elapsed().as_secs_f64(),
            "Job monitoring finished"
        );

        let last = outcome.last_snapshot();
        self.emit(PollEvent {
            job_id: self.handle.id().to_string(),
            poll: self.polls,
            state: self.state,
            status: last.map(|s| s.status),
            progress: last.map(|s| s.progress),
            current_step: last.and_then(|s| s.current_step.clone()),
            stalled: self.aggregator.is_stalled(),
            error: match &outcome {
                PollOutcome::Failed { error, .. } => error.clone(),
                PollOutcome::TransportExhausted { error } => Some(error.to_string()),
                _ => None,
            },
            timestamp: at,
        });
        self.outcome = Some(outcome);
    }

    fn emit(&self, event: PollEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}
