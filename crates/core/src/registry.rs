// crates/core/src/registry.rs
//! Registry of concurrently monitored jobs.
//!
//! Every registered job gets its own [`PollingScheduler`] running on a tokio
//! task. The registry enforces one active poller per job id and only ever
//! reads finished results, never a poller's in-progress state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::aggregator::AggregatedProgress;
use crate::client::StatusSource;
use crate::error::MonitorError;
use crate::report::{BatchReport, ReportRenderer, Summary};
use crate::scheduler::{PollEvent, PollOptions, PollOutcome, PollState, PollingScheduler};
use crate::types::JobHandle;

/// Everything left once a job reached a terminal state.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub outcome: PollOutcome,
    pub summary: Summary,
    pub progress: AggregatedProgress,
}

struct JobEntry {
    cancel: CancellationToken,
    state_rx: watch::Receiver<PollState>,
    finished: Option<FinishedJob>,
}

type JobMap = HashMap<String, JobEntry>;

/// Tracks monitored jobs and their terminal outcomes.
///
/// Call [`start`](JobRegistry::start) from within a tokio runtime.
pub struct JobRegistry {
    source: Arc<dyn StatusSource>,
    defaults: PollOptions,
    jobs: Arc<RwLock<JobMap>>,
    events_tx: broadcast::Sender<PollEvent>,
}

impl JobRegistry {
    pub fn new(source: Arc<dyn StatusSource>, defaults: PollOptions) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            source,
            defaults,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    /// Start monitoring `handle` with the registry's default options.
    pub fn register(&self, handle: JobHandle) -> Result<(), MonitorError> {
        self.start(handle, self.defaults.clone())
    }

    /// Start monitoring `handle`.
    ///
    /// Rejected with `AlreadyPolling` while a poller for the same id is
    /// active. A finished job may be started again; its previous results
    /// are replaced.
    pub fn start(&self, handle: JobHandle, options: PollOptions) -> Result<(), MonitorError> {
        let job_id = handle.id().to_string();
        let mut jobs = write_jobs(&self.jobs);

        if let Some(existing) = jobs.get(&job_id) {
            if existing.finished.is_none() {
                return Err(MonitorError::AlreadyPolling { job_id });
            }
        }

        let cancel = CancellationToken::new();
        let mut scheduler = PollingScheduler::new(Arc::clone(&self.source), handle, options)
            .with_events(self.events_tx.clone())
            .with_cancel_token(cancel.clone());
        scheduler.start()?;

        let (state_tx, state_rx) = watch::channel(PollState::Polling);
        jobs.insert(
            job_id.clone(),
            JobEntry {
                cancel,
                state_rx,
                finished: None,
            },
        );
        drop(jobs);

        let poll_job_id = job_id.clone();
        let poller = tokio::spawn(async move {
            let outcome = scheduler.run().await?;
            let summary = scheduler.summary().ok_or(MonitorError::Aborted {
                job_id: poll_job_id,
            })?;
            Ok::<_, MonitorError>(FinishedJob {
                outcome,
                summary,
                progress: scheduler.into_progress(),
            })
        });

        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            match poller.await {
                Ok(Ok(finished)) => {
                    let state = finished.outcome.state();
                    if let Some(entry) = write_jobs(&jobs).get_mut(&job_id) {
                        entry.finished = Some(finished);
                    }
                    // Publish only after the result is readable.
                    let _ = state_tx.send(state);
                }
                Ok(Err(e)) => {
                    tracing::error!(job_id = %job_id, error = %e, "Poller ended without an outcome");
                    write_jobs(&jobs).remove(&job_id);
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Poller task died");
                    write_jobs(&jobs).remove(&job_id);
                }
            }
            // Dropping `state_tx` without a terminal state wakes waiters with `Aborted`.
        });

        Ok(())
    }

    /// Request cancellation. Takes effect at the poller's next iteration.
    pub fn cancel(&self, job_id: &str) -> Result<(), MonitorError> {
        let jobs = read_jobs(&self.jobs);
        let entry = jobs.get(job_id).ok_or_else(|| MonitorError::UnknownJob {
            job_id: job_id.to_string(),
        })?;
        entry.cancel.cancel();
        Ok(())
    }

    pub fn cancel_all(&self) {
        for entry in read_jobs(&self.jobs).values() {
            entry.cancel.cancel();
        }
    }

    pub fn state(&self, job_id: &str) -> Option<PollState> {
        read_jobs(&self.jobs)
            .get(job_id)
            .map(|entry| *entry.state_rx.borrow())
    }

    /// Summary for a finished job. `None` while polling or if unknown.
    pub fn summary(&self, job_id: &str) -> Option<Summary> {
        read_jobs(&self.jobs)
            .get(job_id)
            .and_then(|entry| entry.finished.as_ref())
            .map(|f| f.summary.clone())
    }

    /// Full snapshot history of a finished job, for post-mortems.
    pub fn progress(&self, job_id: &str) -> Option<AggregatedProgress> {
        read_jobs(&self.jobs)
            .get(job_id)
            .and_then(|entry| entry.finished.as_ref())
            .map(|f| f.progress.clone())
    }

    /// Ids of jobs that have not reached a terminal state.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_jobs(&self.jobs)
            .iter()
            .filter(|(_, entry)| entry.finished.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_jobs(&self.jobs).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Outcomes of every finished job.
    pub fn all_outcomes(&self) -> HashMap<String, PollOutcome> {
        read_jobs(&self.jobs)
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .finished
                    .as_ref()
                    .map(|f| (id.clone(), f.outcome.clone()))
            })
            .collect()
    }

    /// Wait for one job to reach a terminal state.
    pub async fn wait(&self, job_id: &str) -> Result<Summary, MonitorError> {
        let mut rx = read_jobs(&self.jobs)
            .get(job_id)
            .map(|entry| entry.state_rx.clone())
            .ok_or_else(|| MonitorError::UnknownJob {
                job_id: job_id.to_string(),
            })?;

        if rx.wait_for(|state| state.is_terminal()).await.is_err() {
            return Err(MonitorError::Aborted {
                job_id: job_id.to_string(),
            });
        }

        self.summary(job_id).ok_or_else(|| MonitorError::Aborted {
            job_id: job_id.to_string(),
        })
    }

    /// Wait for every registered job and build the combined report.
    ///
    /// Jobs whose poller died without an outcome are listed as aborted.
    pub async fn wait_all(&self) -> BatchReport {
        let mut summaries = Vec::new();
        let mut aborted = Vec::new();
        for job_id in self.job_ids() {
            match self.wait(&job_id).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "No summary for job");
                    aborted.push(job_id);
                }
            }
        }
        ReportRenderer::render_batch(summaries, aborted)
    }

    /// Remove a finished job and hand back its results.
    /// Active jobs are left in place.
    pub fn take_finished(&self, job_id: &str) -> Option<FinishedJob> {
        let mut jobs = write_jobs(&self.jobs);
        if jobs.get(job_id)?.finished.is_none() {
            return None;
        }
        jobs.remove(job_id).and_then(|entry| entry.finished)
    }

    /// Subscribe to poll events from every job.
    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events_tx.subscribe()
    }
}

fn read_jobs(jobs: &RwLock<JobMap>) -> RwLockReadGuard<'_, JobMap> {
    jobs.read().unwrap_or_else(|e| {
        tracing::error!("RwLock poisoned reading jobs map: {e}");
        e.into_inner()
    })
}

fn write_jobs(jobs: &RwLock<JobMap>) -> RwLockWriteGuard<'_, JobMap> {
    jobs.write().unwrap_or_else(|e| {
        tracing::error!("RwLock poisoned writing jobs map: {e}");
        e.into_inner()
    })
}
