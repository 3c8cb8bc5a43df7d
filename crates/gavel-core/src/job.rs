use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::models::ListingRef;

/// State of a fetch job.
///
/// ```text
/// PENDING → DISPATCHED → SUCCEEDED
///               │      → RETRY_SCHEDULED → (not_before elapsed) → PENDING
///               │      → DEAD_LETTERED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Dispatched,
    Succeeded,
    RetryScheduled,
    DeadLettered,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Dispatched,
        JobState::Succeeded,
        JobState::RetryScheduled,
        JobState::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Dispatched => "dispatched",
            JobState::Succeeded => "succeeded",
            JobState::RetryScheduled => "retry_scheduled",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::DeadLettered)
    }

    /// Whether a job in this state still occupies its listing.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// A retry-scheduled job may be claimed directly once due; the
    /// intermediate `Pending` step is applied at claim time.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (RetryScheduled, Pending)
                | (RetryScheduled, Dispatched)
                | (Dispatched, Succeeded)
                | (Dispatched, RetryScheduled)
                | (Dispatched, DeadLettered)
        )
    }

    /// `Ok(())` if the transition is allowed, `InvalidTransition` otherwise.
    pub fn check_transition(&self, job_id: Uuid, next: JobState) -> Result<(), AppError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition {
                job_id,
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "dispatched" => Ok(JobState::Dispatched),
            "succeeded" => Ok(JobState::Succeeded),
            "retry_scheduled" => Ok(JobState::RetryScheduled),
            "dead_lettered" => Ok(JobState::DeadLettered),
            _ => Err(format!("Unknown job state: {s}")),
        }
    }
}

/// Exponential backoff with multiplicative jitter.
///
/// `delay(attempt) = min(cap, base * 2^attempt * U(jitter_low, jitter_high))`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_low: f64,
    pub jitter_high: f64,
    /// Floor applied when the failure was `NoIdentityAvailable`.
    pub no_identity_min: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(900),
            jitter_low: 0.5,
            jitter_high: 1.5,
            no_identity_min: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.cap.is_zero() {
            return Err(AppError::ConfigError(
                "jobs.backoff_cap_ms must be greater than 0".to_string(),
            ));
        }
        if self.base > self.cap {
            return Err(AppError::ConfigError(
                "jobs.backoff_base_ms must not exceed jobs.backoff_cap_ms".to_string(),
            ));
        }
        if !(self.jitter_low > 0.0 && self.jitter_low <= self.jitter_high)
            || !self.jitter_high.is_finite()
        {
            return Err(AppError::ConfigError(format!(
                "jobs jitter bounds must satisfy 0 < low <= high, got [{}, {}]",
                self.jitter_low, self.jitter_high
            )));
        }
        Ok(())
    }

    /// Delay before the next attempt after `attempt` failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter_low < self.jitter_high {
            rng.gen_range(self.jitter_low..=self.jitter_high)
        } else {
            self.jitter_low
        };
        self.scaled(attempt, jitter)
    }

    /// Delay with the jitter factor at its midpoint.
    pub fn expected_delay(&self, attempt: u32) -> Duration {
        self.scaled(attempt, (self.jitter_low + self.jitter_high) / 2.0)
    }

    fn scaled(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.min(62) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent) * jitter;
        let cap = self.cap.as_secs_f64();
        Duration::from_secs_f64(secs.min(cap))
    }

    /// Backoff for a retryable failure of `kind` after `attempt` failures.
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if kind == ErrorKind::NoIdentityAvailable {
            delay.max(self.no_identity_min)
        } else {
            delay
        }
    }
}

/// Relative priority of discovery sweeps and retries.
///
/// Higher values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeights {
    /// Jobs enqueued by recurring sweeps.
    pub scheduled: i32,
    /// Jobs enqueued by a one-off `submit_discovery_target`.
    pub on_demand: i32,
    /// Added to a job's priority each time it is rescheduled. May be negative.
    pub retry_delta: i32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            scheduled: 0,
            on_demand: 10,
            retry_delta: 1,
        }
    }
}

/// A fetch job in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: Uuid,
    pub listing: ListingRef,
    pub state: JobState,
    /// Failed attempts so far. Never decreases.
    pub attempt: u32,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub last_error: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FetchJob {
    pub fn from_new(new: NewFetchJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing: new.listing,
            state: JobState::Pending,
            attempt: 0,
            priority: new.priority,
            not_before: new.not_before.unwrap_or(now),
            last_error: None,
            last_error_message: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether one more failure would exhaust the attempt budget.
    pub fn is_last_attempt(&self, max_attempts: u32) -> bool {
        self.attempt.saturating_add(1) >= max_attempts
    }

    /// Whether the job can be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Pending | JobState::RetryScheduled) && self.not_before <= now
    }
}

/// Request to enqueue a fetch job.
#[derive(Debug, Clone)]
pub struct NewFetchJob {
    pub listing: ListingRef,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
}

impl NewFetchJob {
    pub fn new(listing: ListingRef) -> Self {
        Self {
            listing,
            priority: 0,
            not_before: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_id: String,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Concurrent fetches.
    pub fetch_workers: usize,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Time in-flight fetches get to finish after shutdown is requested.
    pub shutdown_grace: Duration,
    pub retry_delta: i32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("orchestrator-{}", &Uuid::new_v4().to_string()[..8]),
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            fetch_workers: 8,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
            retry_delta: PriorityWeights::default().retry_delta,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_job_state_roundtrip() {
        for state in JobState::ALL {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Dispatched.is_terminal());
        assert!(!JobState::RetryScheduled.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::DeadLettered.is_terminal());
    }

    #[test]
    fn test_dead_lettered_never_reenters_pending() {
        for next in JobState::ALL {
            assert!(!JobState::DeadLettered.can_transition_to(next));
            assert!(!JobState::Succeeded.can_transition_to(next));
        }
        let err = JobState::DeadLettered
            .check_transition(Uuid::nil(), JobState::Pending)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(JobState::Pending.can_transition_to(JobState::Dispatched));
        assert!(JobState::RetryScheduled.can_transition_to(JobState::Pending));
        assert!(JobState::Dispatched.can_transition_to(JobState::RetryScheduled));
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Dispatched.can_transition_to(JobState::Pending));
    }

    #[test]
    fn test_backoff_increases_in_expectation_and_is_capped() {
        let config = BackoffConfig {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            ..BackoffConfig::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..6 {
            let expected = config.expected_delay(attempt);
            assert!(expected > previous, "attempt {attempt}: {expected:?} <= {previous:?}");
            previous = expected;
        }

        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..40 {
            for _ in 0..50 {
                assert!(config.delay_with(attempt, &mut rng) <= config.cap);
            }
        }
        assert_eq!(config.expected_delay(30), config.cap);
    }

    #[test]
    fn test_backoff_sample_means_increase() {
        let config = BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_secs(3600),
            ..BackoffConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let mean = |attempt: u32, rng: &mut StdRng| {
            let total: f64 = (0..500)
                .map(|_| config.delay_with(attempt, rng).as_secs_f64())
                .sum();
            total / 500.0
        };
        let mut previous = 0.0;
        for attempt in 1..8 {
            let m = mean(attempt, &mut rng);
            assert!(m > previous, "attempt {attempt}: mean {m} <= {previous}");
            previous = m;
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(1000),
            ..BackoffConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let d = config.delay_with(2, &mut rng).as_secs_f64();
            assert!((2.0..=6.0).contains(&d), "delay {d} outside [2, 6]");
        }
    }

    #[test]
    fn test_no_identity_uses_longer_minimum() {
        let config = BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_secs(10),
            no_identity_min: Duration::from_secs(5),
            ..BackoffConfig::default()
        };
        assert!(config.delay_for(ErrorKind::NoIdentityAvailable, 1) >= Duration::from_secs(5));
        assert!(config.delay_for(ErrorKind::Transient, 1) < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_validation() {
        assert!(BackoffConfig::default().validate().is_ok());

        let base_over_cap = BackoffConfig {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(1),
            ..BackoffConfig::default()
        };
        assert!(base_over_cap.validate().is_err());

        let bad_jitter = BackoffConfig {
            jitter_low: 1.5,
            jitter_high: 0.5,
            ..BackoffConfig::default()
        };
        assert!(bad_jitter.validate().is_err());

        let zero_cap = BackoffConfig {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            ..BackoffConfig::default()
        };
        assert!(zero_cap.validate().is_err());
    }

    #[test]
    fn test_last_attempt() {
        let listing = ListingRef::new(crate::models::Source::Ebay, "1", "https://www.ebay.com/itm/1");
        let mut job = FetchJob::from_new(NewFetchJob::new(listing), Utc::now());
        assert!(!job.is_last_attempt(3));
        job.attempt = 2;
        assert!(job.is_last_attempt(3));
    }
}
