use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, FetchError};
use crate::job::{FetchJob, JobState, NewFetchJob};
use crate::models::ListingKey;
use crate::util::lock_or_recover;

/// When and how a failed job runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub not_before: DateTime<Utc>,
    /// Added to the job's priority.
    pub priority_delta: i32,
}

/// Durable queue of fetch jobs.
///
/// Implementations must claim atomically and keep at most one job per
/// listing in `Dispatched` at any time. Every transition is guarded by the
/// job's current state, so a terminal job can never come back.
pub trait JobQueue: Send + Sync + Clone {
    fn enqueue(&self, job: NewFetchJob) -> impl Future<Output = Result<FetchJob, AppError>> + Send;

    /// Atomically claim the highest-priority due job whose listing has no
    /// other job in flight. Due retries pass through `Pending` here.
    ///
    /// Returns `None` if nothing is claimable.
    fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<FetchJob>, AppError>> + Send;

    fn mark_succeeded(&self, job_id: Uuid) -> impl Future<Output = Result<FetchJob, AppError>> + Send;

    /// Record a failed attempt: `attempt` is incremented, then the job moves
    /// to `RetryScheduled` if `retry` is given, or to `DeadLettered` otherwise.
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &FetchError,
        retry: Option<RetrySchedule>,
    ) -> impl Future<Output = Result<FetchJob, AppError>> + Send;

    /// Return every job dispatched to `worker_id` to `RetryScheduled`, due
    /// at `now`, without counting an attempt. Used on shutdown.
    fn release_worker_jobs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get_job(&self, job_id: Uuid) -> impl Future<Output = Result<Option<FetchJob>, AppError>> + Send;

    /// Most recently updated jobs first.
    fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<FetchJob>, AppError>> + Send;

    fn count_by_state(&self, state: JobState) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Whether the listing has a job that is not yet terminal.
    fn has_active(&self, listing: &ListingKey) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Terminal jobs kept for `get_job` and `list_jobs` by default.
pub const DEFAULT_FINISHED_RETAINED: usize = 1024;

struct QueueState {
    /// Pending, dispatched and retry-scheduled jobs.
    active: HashMap<Uuid, FetchJob>,
    /// Non-terminal job count per listing.
    per_listing: HashMap<ListingKey, usize>,
    /// Listings with a job in `Dispatched`.
    dispatched: HashSet<ListingKey>,
    /// Most recent terminal jobs, oldest first.
    finished: VecDeque<FetchJob>,
    /// Lifetime count per terminal state, including evicted jobs.
    finished_totals: HashMap<JobState, u64>,
    retain_finished: usize,
}

impl QueueState {
    fn new(retain_finished: usize) -> Self {
        Self {
            active: HashMap::new(),
            per_listing: HashMap::new(),
            dispatched: HashSet::new(),
            finished: VecDeque::new(),
            finished_totals: HashMap::new(),
            retain_finished,
        }
    }

    fn active_mut(&mut self, job_id: Uuid, to: JobState) -> Result<&mut FetchJob, AppError> {
        if !self.active.contains_key(&job_id) {
            return Err(self.not_active(job_id, to));
        }
        self.active
            .get_mut(&job_id)
            .ok_or(AppError::JobNotFound(job_id))
    }

    fn not_active(&self, job_id: Uuid, to: JobState) -> AppError {
        match self.finished.iter().find(|j| j.id == job_id) {
            Some(job) => AppError::InvalidTransition {
                job_id,
                from: job.state.to_string(),
                to: to.to_string(),
            },
            None => AppError::JobNotFound(job_id),
        }
    }

    /// Move a job that just reached a terminal state out of the active set.
    fn finish(&mut self, job_id: Uuid) -> Option<FetchJob> {
        let job = self.active.remove(&job_id)?;
        let key = job.listing.key();
        self.dispatched.remove(&key);
        if let Some(count) = self.per_listing.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.per_listing.remove(&key);
            }
        }
        *self.finished_totals.entry(job.state).or_default() += 1;
        self.finished.push_back(job.clone());
        while self.finished.len() > self.retain_finished {
            self.finished.pop_front();
        }
        Some(job)
    }
}

/// Job queue held in process memory.
///
/// All state sits behind one lock, which is the serialization point for
/// claims and for the dispatched set. Terminal jobs leave the active set at
/// once; only the most recent ones are kept, while `count_by_state` still
/// reports lifetime totals for terminal states.
#[derive(Clone)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::with_finished_retained(DEFAULT_FINISHED_RETAINED)
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finished_retained(retain: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new(retain))),
        }
    }

    /// Jobs currently held, active and retained terminal ones together.
    pub fn len(&self) -> usize {
        let state = lock_or_recover(&self.state, "job queue");
        state.active.len() + state.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewFetchJob) -> Result<FetchJob, AppError> {
        let job = FetchJob::from_new(job, Utc::now());
        let mut state = lock_or_recover(&self.state, "job queue");
        *state.per_listing.entry(job.listing.key()).or_default() += 1;
        state.active.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FetchJob>, AppError> {
        let mut state = lock_or_recover(&self.state, "job queue");
        let QueueState {
            active, dispatched, ..
        } = &mut *state;

        let next = active
            .values()
            .filter(|j| j.is_due(now) && !dispatched.contains(&j.listing.key()))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.not_before.cmp(&b.not_before))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let job = state.active_mut(job_id, JobState::Dispatched)?;
        if job.state == JobState::RetryScheduled {
            job.state = JobState::Pending;
        }
        job.state.check_transition(job_id, JobState::Dispatched)?;
        job.state = JobState::Dispatched;
        job.worker_id = Some(worker_id.to_string());
        job.updated_at = now;
        let claimed = job.clone();
        state.dispatched.insert(claimed.listing.key());
        Ok(Some(claimed))
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<FetchJob, AppError> {
        let mut state = lock_or_recover(&self.state, "job queue");
        let job = state.active_mut(job_id, JobState::Succeeded)?;
        job.state.check_transition(job_id, JobState::Succeeded)?;
        job.state = JobState::Succeeded;
        job.worker_id = None;
        job.updated_at = Utc::now();
        state.finish(job_id).ok_or(AppError::JobNotFound(job_id))
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &FetchError,
        retry: Option<RetrySchedule>,
    ) -> Result<FetchJob, AppError> {
        let mut state = lock_or_recover(&self.state, "job queue");
        let next = if retry.is_some() {
            JobState::RetryScheduled
        } else {
            JobState::DeadLettered
        };
        let job = state.active_mut(job_id, next)?;
        job.state.check_transition(job_id, next)?;

        job.state = next;
        job.attempt = job.attempt.saturating_add(1);
        job.last_error = Some(error.kind);
        job.last_error_message = Some(error.message.clone());
        job.worker_id = None;
        job.updated_at = Utc::now();
        match retry {
            Some(retry) => {
                job.not_before = retry.not_before;
                job.priority = job.priority.saturating_add(retry.priority_delta);
                let failed = job.clone();
                state.dispatched.remove(&failed.listing.key());
                Ok(failed)
            }
            None => state.finish(job_id).ok_or(AppError::JobNotFound(job_id)),
        }
    }

    async fn release_worker_jobs(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = lock_or_recover(&self.state, "job queue");
        let QueueState {
            active, dispatched, ..
        } = &mut *state;

        let mut released = 0;
        for job in active.values_mut().filter(|j| {
            j.state == JobState::Dispatched && j.worker_id.as_deref() == Some(worker_id)
        }) {
            job.state = JobState::RetryScheduled;
            job.not_before = now;
            job.worker_id = None;
            job.updated_at = now;
            dispatched.remove(&job.listing.key());
            released += 1;
        }
        Ok(released)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<FetchJob>, AppError> {
        let state = lock_or_recover(&self.state, "job queue");
        Ok(state
            .active
            .get(&job_id)
            .or_else(|| state.finished.iter().rev().find(|j| j.id == job_id))
            .cloned())
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<FetchJob>, AppError> {
        let queue = lock_or_recover(&self.state, "job queue");
        let mut jobs: Vec<_> = queue
            .active
            .values()
            .chain(queue.finished.iter())
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let queue = lock_or_recover(&self.state, "job queue");
        if state.is_terminal() {
            return Ok(queue.finished_totals.get(&state).copied().unwrap_or(0));
        }
        Ok(queue.active.values().filter(|j| j.state == state).count() as u64)
    }

    async fn has_active(&self, listing: &ListingKey) -> Result<bool, AppError> {
        Ok(lock_or_recover(&self.state, "job queue")
            .per_listing
            .contains_key(listing))
    }
}
