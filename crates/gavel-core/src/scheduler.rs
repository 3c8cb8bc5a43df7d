use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::FreshnessCache;
use crate::error::AppError;
use crate::job::{NewFetchJob, PriorityWeights};
use crate::job_queue::JobQueue;
use crate::models::{ListingRef, Source};
use crate::traits::DiscoverySource;
use crate::util::lock_or_recover;

/// A search or category to sweep for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTarget {
    pub source: Source,
    /// Query parameters passed to the source, e.g. `q` for a keyword search.
    pub search_params: BTreeMap<String, String>,
    /// Pagination depth limit.
    pub max_pages: u32,
    /// Repeat interval. `None` sweeps once.
    pub cadence: Option<Duration>,
    /// Explicit job priority; falls back to the configured weights.
    pub priority: Option<i32>,
}

impl DiscoveryTarget {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            search_params: BTreeMap::new(),
            max_pages: 5,
            cadence: None,
            priority: None,
        }
    }

    /// Keyword search target.
    pub fn query(source: Source, query: impl Into<String>) -> Self {
        Self::new(source).with_param("q", query)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.search_params.insert(key.into(), value.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = Some(cadence);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Priority for jobs discovered by this target.
    pub fn job_priority(&self, weights: &PriorityWeights) -> i32 {
        self.priority.unwrap_or(if self.cadence.is_some() {
            weights.scheduled
        } else {
            weights.on_demand
        })
    }
}

/// Lazy, restartable walk over a target's result pages.
///
/// Ends at `max_pages` or at the first empty page.
pub struct DiscoveryCursor<D: DiscoverySource> {
    source: D,
    target: DiscoveryTarget,
    next_page: u32,
    exhausted: bool,
}

impl<D: DiscoverySource> DiscoveryCursor<D> {
    pub fn new(source: D, target: DiscoveryTarget) -> Self {
        Self::resume(source, target, 1)
    }

    /// Continue a walk from `page` (1-indexed).
    pub fn resume(source: D, target: DiscoveryTarget, page: u32) -> Self {
        Self {
            source,
            target,
            next_page: page.max(1),
            exhausted: false,
        }
    }

    /// The page the next call will fetch.
    pub fn position(&self) -> u32 {
        self.next_page
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<ListingRef>>, AppError> {
        if self.exhausted || self.next_page > self.target.max_pages {
            return Ok(None);
        }
        let refs = self
            .source
            .discover_page(&self.target, self.next_page)
            .await?;
        if refs.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        self.next_page += 1;
        Ok(Some(refs))
    }

    /// Drain the remaining pages.
    pub async fn collect(mut self) -> Result<Vec<ListingRef>, AppError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

/// Counts from one sweep of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pages: u32,
    pub discovered: usize,
    pub enqueued: usize,
    pub skipped_active: usize,
    pub skipped_fresh: usize,
    /// Set when a page failed and the sweep stopped early.
    pub error: Option<String>,
}

/// Delay before a one-off target whose sweep failed is tried again.
pub const FAILED_SWEEP_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct ScheduledTarget {
    target: DiscoveryTarget,
    next_run: Instant,
}

/// Turns discovery targets into fetch jobs, once or on a cadence.
#[derive(Clone)]
pub struct DiscoveryScheduler<D, Q>
where
    D: DiscoverySource,
    Q: JobQueue,
{
    source: D,
    queue: Q,
    freshness: FreshnessCache,
    weights: PriorityWeights,
    targets: Arc<Mutex<Vec<ScheduledTarget>>>,
    wake: Arc<Notify>,
}

impl<D, Q> DiscoveryScheduler<D, Q>
where
    D: DiscoverySource,
    Q: JobQueue,
{
    pub fn new(source: D, queue: Q, freshness: FreshnessCache, weights: PriorityWeights) -> Self {
        Self {
            source,
            queue,
            freshness,
            weights,
            targets: Arc::new(Mutex::new(Vec::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Register a target; its first sweep is due immediately.
    pub fn submit_target(&self, target: DiscoveryTarget) -> Result<(), AppError> {
        if target.max_pages == 0 {
            return Err(AppError::Generic(
                "discovery target needs max_pages >= 1".to_string(),
            ));
        }
        if target.cadence.is_some_and(|c| c.is_zero()) {
            return Err(AppError::Generic(
                "discovery target cadence must be greater than 0".to_string(),
            ));
        }
        tracing::info!(
            source = %target.source,
            params = ?target.search_params,
            cadence_secs = ?target.cadence.map(|c| c.as_secs()),
            "Discovery target submitted"
        );
        lock_or_recover(&self.targets, "discovery targets").push(ScheduledTarget {
            target,
            next_run: Instant::now(),
        });
        self.wake.notify_one();
        Ok(())
    }

    /// Number of registered targets (one-off ones until they have run).
    pub fn target_count(&self) -> usize {
        lock_or_recover(&self.targets, "discovery targets").len()
    }

    /// Walk `target` and enqueue every listing without an active job or a
    /// recent completion.
    pub async fn sweep(&self, target: &DiscoveryTarget) -> Result<SweepReport, AppError> {
        let priority = target.job_priority(&self.weights);
        let mut cursor = DiscoveryCursor::new(self.source.clone(), target.clone());
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();

        loop {
            let page = match cursor.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        source = %target.source,
                        page = cursor.position(),
                        error = %e,
                        "Discovery page failed, ending sweep"
                    );
                    report.error = Some(e.to_string());
                    break;
                }
            };
            report.pages += 1;

            for listing in page {
                let key = listing.key();
                if !seen.insert(key.clone()) {
                    continue;
                }
                report.discovered += 1;
                if self.queue.has_active(&key).await? {
                    report.skipped_active += 1;
                } else if self.freshness.is_fresh(&key).await {
                    report.skipped_fresh += 1;
                } else {
                    self.queue
                        .enqueue(NewFetchJob::new(listing).with_priority(priority))
                        .await?;
                    report.enqueued += 1;
                }
            }
        }

        tracing::info!(
            source = %target.source,
            pages = report.pages,
            discovered = report.discovered,
            enqueued = report.enqueued,
            skipped_active = report.skipped_active,
            skipped_fresh = report.skipped_fresh,
            "Discovery sweep finished"
        );
        Ok(report)
    }

    /// Sweep every due target once. Recurring targets are rescheduled, one-off
    /// targets removed.
    ///
    /// A sweep that fails on the job queue is logged and reported with its
    /// error; the remaining due targets still run, and a failed one-off
    /// target is kept and retried after [`FAILED_SWEEP_RETRY`].
    pub async fn run_due(&self, now: Instant) -> Vec<SweepReport> {
        let due: Vec<DiscoveryTarget> = {
            let mut targets = lock_or_recover(&self.targets, "discovery targets");
            let due = targets
                .iter()
                .filter(|t| t.next_run <= now)
                .map(|t| t.target.clone())
                .collect();
            targets.retain_mut(|t| {
                if t.next_run > now {
                    return true;
                }
                match t.target.cadence {
                    Some(cadence) => {
                        t.next_run = now + cadence;
                        true
                    }
                    None => false,
                }
            });
            due
        };

        let mut reports = Vec::with_capacity(due.len());
        for target in due {
            match self.sweep(&target).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(
                        source = %target.source,
                        params = ?target.search_params,
                        error = %e,
                        "Discovery sweep failed"
                    );
                    reports.push(SweepReport {
                        error: Some(e.to_string()),
                        ..SweepReport::default()
                    });
                    if target.cadence.is_none() {
                        lock_or_recover(&self.targets, "discovery targets").push(ScheduledTarget {
                            target,
                            next_run: now + FAILED_SWEEP_RETRY,
                        });
                    }
                }
            }
        }
        reports
    }

    fn next_wake(&self) -> Option<Instant> {
        lock_or_recover(&self.targets, "discovery targets")
            .iter()
            .map(|t| t.next_run)
            .min()
    }

    /// Sweep targets as they come due until cancellation.
    ///
    /// Cancellation is checked between sweeps, so no job is enqueued after
    /// the current sweep ends.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AppError> {
        tracing::info!("Discovery scheduler started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.run_due(Instant::now()).await;

            let wake = self.wake.notified();
            match self.next_wake() {
                Some(at) => tokio::select! {
                    () = tokio::time::sleep_until(at) => {}
                    () = wake => {}
                    () = cancel.cancelled() => break,
                },
                None => tokio::select! {
                    () = wake => {}
                    () = cancel.cancelled() => break,
                },
            }
        }
        tracing::info!("Discovery scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::job::{FetchJob, JobState};
    use crate::job_queue::{MemoryJobQueue, RetrySchedule};
    use crate::models::ListingKey;
    use crate::testutil::*;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn scheduler(
        discovery: MockDiscovery,
    ) -> (
        DiscoveryScheduler<MockDiscovery, MemoryJobQueue>,
        MemoryJobQueue,
        FreshnessCache,
    ) {
        let queue = MemoryJobQueue::new();
        let freshness = FreshnessCache::new(Duration::from_secs(300));
        let scheduler = DiscoveryScheduler::new(
            discovery,
            queue.clone(),
            freshness.clone(),
            PriorityWeights::default(),
        );
        (scheduler, queue, freshness)
    }

    /// Memory queue whose next `failures` enqueues fail.
    #[derive(Clone)]
    struct FlakyQueue {
        inner: MemoryJobQueue,
        failures: Arc<AtomicUsize>,
    }

    impl FlakyQueue {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryJobQueue::new(),
                failures: Arc::new(AtomicUsize::new(failures)),
            }
        }
    }

    impl JobQueue for FlakyQueue {
        async fn enqueue(&self, job: NewFetchJob) -> Result<FetchJob, AppError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AppError::DatabaseError("connection refused".to_string()));
            }
            self.inner.enqueue(job).await
        }

        async fn claim_next(
            &self,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<FetchJob>, AppError> {
            self.inner.claim_next(worker_id, now).await
        }

        async fn mark_succeeded(&self, job_id: Uuid) -> Result<FetchJob, AppError> {
            self.inner.mark_succeeded(job_id).await
        }

        async fn fail_job(
            &self,
            job_id: Uuid,
            error: &FetchError,
            retry: Option<RetrySchedule>,
        ) -> Result<FetchJob, AppError> {
            self.inner.fail_job(job_id, error, retry).await
        }

        async fn release_worker_jobs(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
            self.inner.release_worker_jobs(worker_id, now).await
        }

        async fn get_job(&self, job_id: Uuid) -> Result<Option<FetchJob>, AppError> {
            self.inner.get_job(job_id).await
        }

        async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<FetchJob>, AppError> {
            self.inner.list_jobs(state, limit).await
        }

        async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
            self.inner.count_by_state(state).await
        }

        async fn has_active(&self, listing: &ListingKey) -> Result<bool, AppError> {
            self.inner.has_active(listing).await
        }
    }

    fn page(ids: &[&str]) -> Vec<ListingRef> {
        ids.iter().map(|id| test_listing(id)).collect()
    }

    #[tokio::test]
    async fn cursor_stops_at_empty_page() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1", "2"]), page(&["3"]), vec![]]);
        let target = DiscoveryTarget::query(Source::Ebay, "lamp").with_max_pages(10);

        let all = DiscoveryCursor::new(discovery.clone(), target).collect().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(discovery.requested_pages(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cursor_stops_at_max_pages_and_resumes() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1"]), page(&["2"]), page(&["3"])]);
        let target = DiscoveryTarget::query(Source::Ebay, "lamp").with_max_pages(3);

        let mut cursor = DiscoveryCursor::new(discovery.clone(), target.clone());
        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 1);
        assert_eq!(cursor.position(), 2);

        let rest = DiscoveryCursor::resume(discovery.clone(), target, cursor.position())
            .collect()
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(discovery.requested_pages(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sweep_skips_active_and_fresh_listings() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1", "2", "3", "1"])]);
        let (scheduler, queue, freshness) = scheduler(discovery);
        queue.enqueue(NewFetchJob::new(test_listing("1"))).await.unwrap();
        freshness.mark_completed(test_listing("2").key()).await;

        let report = scheduler
            .sweep(&DiscoveryTarget::query(Source::Local, "chair"))
            .await
            .unwrap();

        assert_eq!(
            report,
            SweepReport {
                pages: 1,
                discovered: 3,
                enqueued: 1,
                skipped_active: 1,
                skipped_fresh: 1,
                error: None,
            }
        );
        assert_eq!(queue.count_by_state(JobState::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sweep_uses_priority_weights() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1"])]);
        let (scheduler, queue, _) = scheduler(discovery.clone());

        scheduler
            .sweep(&DiscoveryTarget::query(Source::Ebay, "lamp"))
            .await
            .unwrap();
        let jobs = queue.list_jobs(None, 10).await.unwrap();
        assert_eq!(jobs[0].priority, PriorityWeights::default().on_demand);

        let recurring = DiscoveryTarget::query(Source::Ebay, "lamp").with_cadence(Duration::from_secs(60));
        assert_eq!(
            recurring.job_priority(&PriorityWeights::default()),
            PriorityWeights::default().scheduled
        );
        assert_eq!(recurring.with_priority(99).job_priority(&PriorityWeights::default()), 99);
    }

    #[tokio::test]
    async fn page_error_ends_sweep_with_partial_report() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1", "2"]), page(&["3"])]).failing_on(2);
        let (scheduler, _, _) = scheduler(discovery);

        let report = scheduler
            .sweep(&DiscoveryTarget::query(Source::Ebay, "lamp"))
            .await
            .unwrap();
        assert_eq!(report.enqueued, 2);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn one_off_targets_run_once_and_recurring_are_rescheduled() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1"])]);
        let (scheduler, _, _) = scheduler(discovery);
        scheduler
            .submit_target(DiscoveryTarget::query(Source::Ebay, "once"))
            .unwrap();
        scheduler
            .submit_target(
                DiscoveryTarget::query(Source::Ebay, "often").with_cadence(Duration::from_secs(60)),
            )
            .unwrap();

        let now = Instant::now();
        assert_eq!(scheduler.run_due(now).await.len(), 2);
        assert_eq!(scheduler.target_count(), 1);
        assert!(scheduler.run_due(now).await.is_empty());
        assert_eq!(scheduler.run_due(now + Duration::from_secs(61)).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_sweep_does_not_drop_other_due_targets() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1"])]);
        let queue = FlakyQueue::new(1);
        let scheduler = DiscoveryScheduler::new(
            discovery,
            queue.clone(),
            FreshnessCache::new(Duration::ZERO),
            PriorityWeights::default(),
        );
        scheduler
            .submit_target(DiscoveryTarget::query(Source::Ebay, "first"))
            .unwrap();
        scheduler
            .submit_target(DiscoveryTarget::query(Source::Ebay, "second"))
            .unwrap();

        let now = Instant::now();
        let reports = scheduler.run_due(now).await;
        assert_eq!(reports.len(), 2);
        assert!(reports[0].error.is_some());
        assert_eq!(reports[1].enqueued, 1);

        // The failed one-off target is kept for a later retry.
        assert_eq!(scheduler.target_count(), 1);
        assert!(scheduler.run_due(now).await.is_empty());
        let retried = scheduler.run_due(now + FAILED_SWEEP_RETRY).await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].error, None);
        assert_eq!(scheduler.target_count(), 0);
    }

    #[test]
    fn invalid_targets_are_rejected() {
        let (scheduler, _, _) = scheduler(MockDiscovery::with_pages(vec![]));
        assert!(
            scheduler
                .submit_target(DiscoveryTarget::new(Source::Ebay).with_max_pages(0))
                .is_err()
        );
        assert!(
            scheduler
                .submit_target(DiscoveryTarget::new(Source::Ebay).with_cadence(Duration::ZERO))
                .is_err()
        );
    }

    #[tokio::test]
    async fn run_sweeps_submitted_target_and_stops_on_cancel() {
        let discovery = MockDiscovery::with_pages(vec![page(&["1", "2"])]);
        let (scheduler, queue, _) = scheduler(discovery);
        let cancel = CancellationToken::new();

        let runner = scheduler.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(run_cancel).await });

        scheduler
            .submit_target(DiscoveryTarget::query(Source::Ebay, "lamp"))
            .unwrap();
        for _ in 0..100 {
            if queue.count_by_state(JobState::Pending).await.unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(queue.count_by_state(JobState::Pending).await.unwrap(), 2);
    }
}
