use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::AnalysisHandle;
use crate::cache::FreshnessCache;
use crate::error::{AppError, FetchError};
use crate::fetch::FetchWorker;
use crate::job::{FetchJob, OrchestratorConfig};
use crate::job_queue::{JobQueue, RetrySchedule};
use crate::models::ListingKey;
use crate::traits::{ListingParser, PageFetcher, SnapshotStore};

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent<'a> {
    Started {
        worker_id: &'a str,
        fetch_workers: usize,
    },
    JobDispatched {
        job: &'a FetchJob,
    },
    JobSucceeded {
        job_id: Uuid,
        listing: &'a ListingKey,
        stored: bool,
    },
    JobRetryScheduled {
        job: &'a FetchJob,
        error: &'a FetchError,
        delay: Duration,
    },
    JobDeadLettered {
        job: &'a FetchJob,
        error: &'a FetchError,
    },
    AnalysisDropped {
        listing: &'a ListingKey,
    },
    ShuttingDown {
        worker_id: &'a str,
        in_flight: usize,
    },
    Stopped {
        worker_id: &'a str,
        jobs_released: u64,
    },
}

/// Trait for receiving orchestrator events (decoupled logging).
pub trait OrchestratorReporter: Send + Sync {
    fn report(&self, event: OrchestratorEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl OrchestratorReporter for TracingReporter {
    fn report(&self, event: OrchestratorEvent<'_>) {
        match event {
            OrchestratorEvent::Started {
                worker_id,
                fetch_workers,
            } => {
                tracing::info!(%worker_id, %fetch_workers, "Orchestrator started");
            }
            OrchestratorEvent::JobDispatched { job } => {
                tracing::debug!(
                    job_id = %job.id,
                    listing = %job.listing.key(),
                    attempt = job.attempt,
                    "Job dispatched"
                );
            }
            OrchestratorEvent::JobSucceeded {
                job_id,
                listing,
                stored,
            } => {
                tracing::info!(%job_id, %listing, %stored, "Job succeeded");
            }
            OrchestratorEvent::JobRetryScheduled { job, error, delay } => {
                tracing::warn!(
                    job_id = %job.id,
                    listing = %job.listing.key(),
                    attempt = job.attempt,
                    %error,
                    delay_ms = %delay.as_millis(),
                    "Job failed, retry scheduled"
                );
            }
            OrchestratorEvent::JobDeadLettered { job, error } => {
                tracing::error!(
                    job_id = %job.id,
                    listing = %job.listing.key(),
                    attempt = job.attempt,
                    %error,
                    "Job dead-lettered"
                );
            }
            OrchestratorEvent::AnalysisDropped { listing } => {
                tracing::warn!(%listing, "Analysis stage closed, snapshot left for next change");
            }
            OrchestratorEvent::ShuttingDown {
                worker_id,
                in_flight,
            } => {
                tracing::info!(%worker_id, %in_flight, "Orchestrator shutting down");
            }
            OrchestratorEvent::Stopped {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Orchestrator stopped");
            }
        }
    }
}

/// Pulls fetch jobs from the queue and owns every retry and dead-letter decision.
#[derive(Clone)]
pub struct Orchestrator<Q, S, P, X>
where
    Q: JobQueue,
    S: SnapshotStore,
    P: PageFetcher,
    X: ListingParser,
{
    queue: Q,
    store: S,
    worker: FetchWorker<P, X>,
    freshness: FreshnessCache,
    analysis: AnalysisHandle,
    config: OrchestratorConfig,
}

impl<Q, S, P, X> Orchestrator<Q, S, P, X>
where
    Q: JobQueue,
    S: SnapshotStore,
    P: PageFetcher,
    X: ListingParser,
{
    pub fn new(
        queue: Q,
        store: S,
        worker: FetchWorker<P, X>,
        freshness: FreshnessCache,
        analysis: AnalysisHandle,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            store,
            worker,
            freshness,
            analysis,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run the dispatch loop until cancellation.
    ///
    /// After cancellation, in-flight fetches get `shutdown_grace` to finish;
    /// the rest are aborted and their jobs released back to the queue.
    pub async fn run<R>(&self, cancel: CancellationToken, reporter: Arc<R>) -> Result<(), AppError>
    where
        R: OrchestratorReporter + 'static,
        Q: 'static,
        S: 'static,
        P: 'static,
        X: 'static,
    {
        let worker_id = self.config.worker_id.as_str();
        reporter.report(OrchestratorEvent::Started {
            worker_id,
            fetch_workers: self.config.fetch_workers,
        });

        let slots = Arc::new(Semaphore::new(self.config.fetch_workers.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Fetch task panicked");
                }
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit
                    .map_err(|e| AppError::Generic(format!("worker pool closed: {e}")))?,
                () = cancel.cancelled() => break,
            };

            match self.queue.claim_next(worker_id, Utc::now()).await {
                Ok(Some(job)) => {
                    reporter.report(OrchestratorEvent::JobDispatched { job: &job });
                    let this = self.clone();
                    let reporter = reporter.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = this.process_job(&job, reporter.as_ref()).await {
                            tracing::error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }

        reporter.report(OrchestratorEvent::ShuttingDown {
            worker_id,
            in_flight: in_flight.len(),
        });

        let drain = async { while in_flight.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                "Shutdown grace elapsed, aborting in-flight fetches"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        let jobs_released = self
            .queue
            .release_worker_jobs(worker_id, Utc::now())
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to release jobs on shutdown");
                0
            });

        reporter.report(OrchestratorEvent::Stopped {
            worker_id,
            jobs_released,
        });
        Ok(())
    }

    /// Claim and process one job inline. Returns the job in its new state.
    pub async fn dispatch_once<R: OrchestratorReporter>(
        &self,
        reporter: &R,
    ) -> Result<Option<FetchJob>, AppError> {
        self.dispatch_at(Utc::now(), reporter).await
    }

    /// Like [`dispatch_once`](Self::dispatch_once), claiming as of `now`.
    pub async fn dispatch_at<R: OrchestratorReporter>(
        &self,
        now: DateTime<Utc>,
        reporter: &R,
    ) -> Result<Option<FetchJob>, AppError> {
        let Some(job) = self.queue.claim_next(&self.config.worker_id, now).await? else {
            return Ok(None);
        };
        reporter.report(OrchestratorEvent::JobDispatched { job: &job });
        self.process_job(&job, reporter).await.map(Some)
    }

    async fn process_job<R: OrchestratorReporter + ?Sized>(
        &self,
        job: &FetchJob,
        reporter: &R,
    ) -> Result<FetchJob, AppError> {
        let snapshot = match self.worker.fetch(&job.listing).await {
            Ok(snapshot) => snapshot,
            Err(error) => return self.handle_failure(job, error, reporter).await,
        };

        let put = match self.store.put_if_changed(&snapshot).await {
            Ok(put) => put,
            Err(e) => {
                let error = FetchError::transient(format!("snapshot store failed: {e}"));
                return self.handle_failure(job, error, reporter).await;
            }
        };

        let done = self.queue.mark_succeeded(job.id).await?;
        let listing = job.listing.key();
        self.freshness.mark_completed(listing.clone()).await;
        reporter.report(OrchestratorEvent::JobSucceeded {
            job_id: job.id,
            listing: &listing,
            stored: put.stored,
        });

        if put.stored && !self.analysis.submit(snapshot).await {
            reporter.report(OrchestratorEvent::AnalysisDropped { listing: &listing });
        }
        Ok(done)
    }

    async fn handle_failure<R: OrchestratorReporter + ?Sized>(
        &self,
        job: &FetchJob,
        error: FetchError,
        reporter: &R,
    ) -> Result<FetchJob, AppError> {
        if !error.is_retryable() || job.is_last_attempt(self.config.max_attempts) {
            let failed = self.queue.fail_job(job.id, &error, None).await?;
            reporter.report(OrchestratorEvent::JobDeadLettered {
                job: &failed,
                error: &error,
            });
            return Ok(failed);
        }

        let attempt = job.attempt.saturating_add(1);
        let delay = self.config.backoff.delay_for(error.kind, attempt);
        let retry = RetrySchedule {
            not_before: after(Utc::now(), delay),
            priority_delta: self.config.retry_delta,
        };
        let failed = self.queue.fail_job(job.id, &error, Some(retry)).await?;
        reporter.report(OrchestratorEvent::JobRetryScheduled {
            job: &failed,
            error: &error,
            delay,
        });
        Ok(failed)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
