use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::{AnalysisHandle, AnalysisStage};
use crate::cache::FreshnessCache;
use crate::config::PipelineConfig;
use crate::error::{AppError, ErrorKind};
use crate::fetch::FetchWorker;
use crate::job::{FetchJob, JobState};
use crate::job_queue::JobQueue;
use crate::models::{ListingKey, ListingSnapshot, OpportunityRecord};
use crate::orchestrator::{Orchestrator, OrchestratorReporter};
use crate::rate_governor::RateGovernor;
use crate::rotator::{IdentityRotator, IdentityStats};
use crate::scheduler::{DiscoveryScheduler, DiscoveryTarget};
use crate::traits::{
    DiscoverySource, ListingParser, OpportunityStore, PageFetcher, ShippingEstimator,
    SnapshotStore, ValuePredictor,
};
use crate::util::lock_or_recover;

/// Snapshots buffered between fetching and analysis per fetch worker.
const ANALYSIS_BUFFER_PER_WORKER: usize = 4;
/// Dead letters and suppressed records included in a status report.
const STATUS_RECENT_LIMIT: usize = 20;

/// The adapters a pipeline is assembled from.
pub struct PipelineParts<Q, S, P, X, D, V, H, O> {
    pub queue: Q,
    pub snapshots: S,
    pub fetcher: P,
    pub parser: X,
    pub discovery: D,
    pub predictor: V,
    pub shipping: H,
    pub opportunities: O,
}

/// A dead-lettered job as shown by [`Pipeline::status`].
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub listing: ListingKey,
    pub url: String,
    pub attempt: u32,
    pub kind: Option<ErrorKind>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<FetchJob> for DeadLetter {
    fn from(job: FetchJob) -> Self {
        Self {
            job_id: job.id,
            listing: job.listing.key(),
            url: job.listing.url,
            attempt: job.attempt,
            kind: job.last_error,
            reason: job.last_error_message,
            updated_at: job.updated_at,
        }
    }
}

/// Point-in-time view of the pipeline for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Job count per state, in state-machine order.
    pub jobs: Vec<(JobState, u64)>,
    pub snapshots: u64,
    pub dead_letters: Vec<DeadLetter>,
    pub suppressed: Vec<OpportunityRecord>,
    pub identities: Vec<IdentityStats>,
}

impl PipelineStatus {
    pub fn count(&self, state: JobState) -> u64 {
        self.jobs
            .iter()
            .find(|(s, _)| *s == state)
            .map_or(0, |(_, n)| *n)
    }
}

/// Discovery, fetching and analysis wired together.
///
/// Targets go in through [`submit_discovery_target`](Self::submit_discovery_target),
/// opportunities come out through [`get_opportunities`](Self::get_opportunities).
pub struct Pipeline<Q, S, P, X, D, V, H, O>
where
    Q: JobQueue,
    S: SnapshotStore,
    P: PageFetcher,
    X: ListingParser,
    D: DiscoverySource,
    V: ValuePredictor,
    H: ShippingEstimator,
    O: OpportunityStore,
{
    queue: Q,
    snapshots: S,
    rotator: IdentityRotator,
    scheduler: DiscoveryScheduler<D, Q>,
    orchestrator: Orchestrator<Q, S, P, X>,
    analysis: AnalysisStage<V, H, O>,
    analysis_rx: Mutex<Option<mpsc::Receiver<ListingSnapshot>>>,
}

impl<Q, S, P, X, D, V, H, O> Pipeline<Q, S, P, X, D, V, H, O>
where
    Q: JobQueue + 'static,
    S: SnapshotStore + 'static,
    P: PageFetcher + 'static,
    X: ListingParser + 'static,
    D: DiscoverySource + 'static,
    V: ValuePredictor + 'static,
    H: ShippingEstimator + 'static,
    O: OpportunityStore + 'static,
{
    /// Assemble a pipeline. Fails only on invalid configuration.
    pub fn build(
        parts: PipelineParts<Q, S, P, X, D, V, H, O>,
        config: &PipelineConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let governor = RateGovernor::new(config.rate_governor())?;
        let mut discovery = parts.discovery;
        discovery.share_rate_governor(governor.clone());
        let rotator = IdentityRotator::new(config.identities(), config.rotator())?;
        let worker = FetchWorker::new(
            parts.fetcher,
            parts.parser,
            rotator.clone(),
            governor,
            config.fetch_timeout(),
        );
        let freshness = FreshnessCache::new(config.freshness_window());

        let orchestrator_config = config.orchestrator();
        let (handle, analysis_rx) = AnalysisHandle::channel(
            orchestrator_config.fetch_workers * ANALYSIS_BUFFER_PER_WORKER,
        );
        let orchestrator = Orchestrator::new(
            parts.queue.clone(),
            parts.snapshots.clone(),
            worker,
            freshness.clone(),
            handle,
            orchestrator_config,
        );
        let scheduler = DiscoveryScheduler::new(
            discovery,
            parts.queue.clone(),
            freshness,
            config.weights(),
        );
        let analysis = AnalysisStage::new(
            parts.predictor,
            parts.shipping,
            parts.opportunities,
            config.analysis(),
        );

        Ok(Self {
            queue: parts.queue,
            snapshots: parts.snapshots,
            rotator,
            scheduler,
            orchestrator,
            analysis,
            analysis_rx: Mutex::new(Some(analysis_rx)),
        })
    }

    pub fn scheduler(&self) -> &DiscoveryScheduler<D, Q> {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &Orchestrator<Q, S, P, X> {
        &self.orchestrator
    }

    pub fn analysis(&self) -> &AnalysisStage<V, H, O> {
        &self.analysis
    }

    pub fn submit_discovery_target(&self, target: DiscoveryTarget) -> Result<(), AppError> {
        self.scheduler.submit_target(target)
    }

    /// Emitted opportunities computed after `since`, oldest first.
    pub async fn get_opportunities(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OpportunityRecord>, AppError> {
        self.analysis.store().since(since, limit).await
    }

    pub async fn status(&self) -> Result<PipelineStatus, AppError> {
        let mut jobs = Vec::with_capacity(JobState::ALL.len());
        for state in JobState::ALL {
            jobs.push((state, self.queue.count_by_state(state).await?));
        }
        let dead_letters = self
            .queue
            .list_jobs(Some(JobState::DeadLettered), STATUS_RECENT_LIMIT)
            .await?
            .into_iter()
            .map(DeadLetter::from)
            .collect();
        let suppressed = self.analysis.store().suppressed(STATUS_RECENT_LIMIT).await?;

        Ok(PipelineStatus {
            jobs,
            snapshots: self.snapshots.count().await?,
            dead_letters,
            suppressed,
            identities: self.rotator.stats(),
        })
    }

    /// Run discovery, fetching and analysis until `cancel` fires.
    ///
    /// Shutdown is staged: the scheduler stops enqueueing, the orchestrator
    /// drains its in-flight fetches, then the analysis pool finishes what
    /// was handed to it. Can only be called once per pipeline.
    pub async fn run<R>(&self, cancel: CancellationToken, reporter: Arc<R>) -> Result<(), AppError>
    where
        R: OrchestratorReporter + 'static,
    {
        let analysis_rx = lock_or_recover(&self.analysis_rx, "analysis receiver")
            .take()
            .ok_or_else(|| AppError::Generic("pipeline is already running".to_string()))?;

        let orchestrator_cancel = CancellationToken::new();
        let analysis_cancel = CancellationToken::new();

        let analysis = self.analysis.clone();
        let analysis_token = analysis_cancel.clone();
        let mut analysis_task =
            tokio::spawn(async move { analysis.run(analysis_rx, analysis_token).await });

        let scheduler = self.scheduler.clone();
        let scheduler_token = cancel.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_token).await });

        let orchestrator = self.orchestrator.clone();
        let orchestrator_token = orchestrator_cancel.clone();
        let mut orchestrator_task =
            tokio::spawn(async move { orchestrator.run(orchestrator_token, reporter).await });

        let mut result = Ok(());
        let mut orchestrator_done = false;
        let mut analysis_done = false;
        tokio::select! {
            () = cancel.cancelled() => {}
            joined = &mut orchestrator_task => {
                tracing::error!("Orchestrator exited before shutdown was requested");
                cancel.cancel();
                orchestrator_done = true;
                result = flatten(joined, "orchestrator");
            }
            joined = &mut analysis_task => {
                tracing::error!("Analysis stage exited before shutdown was requested");
                cancel.cancel();
                analysis_done = true;
                result = flatten(joined, "analysis");
            }
        }

        tracing::info!("Pipeline shutting down");
        keep_first_error(&mut result, flatten(scheduler_task.await, "scheduler"));

        orchestrator_cancel.cancel();
        if !orchestrator_done {
            keep_first_error(&mut result, flatten(orchestrator_task.await, "orchestrator"));
        }

        analysis_cancel.cancel();
        if !analysis_done {
            keep_first_error(&mut result, flatten(analysis_task.await, "analysis"));
        }

        tracing::info!("Pipeline stopped");
        result
    }
}

fn flatten(
    joined: Result<Result<(), AppError>, tokio::task::JoinError>,
    stage: &str,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(AppError::Generic(format!("{stage} task failed: {e}"))),
    }
}

fn keep_first_error(result: &mut Result<(), AppError>, next: Result<(), AppError>) {
    if let Err(e) = next {
        if result.is_ok() {
            *result = Err(e);
        } else {
            tracing::error!(error = %e, "Additional error during shutdown");
        }
    }
}
