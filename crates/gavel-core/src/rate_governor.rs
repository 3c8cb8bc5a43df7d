//! Per-domain token buckets for polite fetching.
//!
//! Every target domain (optionally every `(domain, identity)` pair) owns one
//! bucket. Refill is continuous and computed lazily on each call, so there is
//! no background timer:
//!
//! ```text
//! tokens = min(capacity, tokens + elapsed * refill_per_sec)
//! ```
//!
//! Time is `tokio::time::Instant`, so a paused test clock drives refill.
//!
//! # Example
//!
//! ```rust
//! use gavel_core::rate_governor::{RateGovernor, RateGovernorConfig, RateLimit};
//!
//! let config = RateGovernorConfig::new(RateLimit::new(5.0, 1.0))
//!     .with_domain("www.ebay.com", RateLimit::new(2.0, 0.5));
//! let governor = RateGovernor::new(config).unwrap();
//!
//! let decision = governor.try_acquire("www.ebay.com");
//! assert!(decision.granted);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::rotator::IdentityId;
use crate::util::lock_or_recover;

/// Bucket size and refill speed for one domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Maximum burst, in requests.
    pub capacity: f64,
    /// Sustained rate, in requests per second.
    pub refill_per_sec: f64,
}

impl RateLimit {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    fn validate(&self, label: &str) -> Result<(), AppError> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(AppError::ConfigError(format!(
                "rate limit for {label}: capacity must be a finite number >= 1, got {}",
                self.capacity
            )));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "rate limit for {label}: refill_per_sec must be a finite number > 0, got {}",
                self.refill_per_sec
            )));
        }
        Ok(())
    }
}

impl Default for RateLimit {
    /// Burst of 5, one request per second sustained.
    fn default() -> Self {
        Self::new(5.0, 1.0)
    }
}

/// Configuration for the rate governor.
#[derive(Debug, Clone, Default)]
pub struct RateGovernorConfig {
    /// Limit for domains without an explicit entry.
    pub default: RateLimit,
    /// Per-domain overrides, keyed by lower-cased host.
    pub domains: HashMap<String, RateLimit>,
    /// Keep a separate bucket for each `(domain, identity)` pair.
    pub per_identity: bool,
}

impl RateGovernorConfig {
    pub fn new(default: RateLimit) -> Self {
        Self {
            default,
            domains: HashMap::new(),
            per_identity: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>, limit: RateLimit) -> Self {
        self.domains
            .insert(domain.into().to_ascii_lowercase(), limit);
        self
    }

    pub fn with_per_identity(mut self, enabled: bool) -> Self {
        self.per_identity = enabled;
        self
    }

    pub fn limit_for(&self, domain: &str) -> RateLimit {
        self.domains.get(domain).copied().unwrap_or(self.default)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.default.validate("default")?;
        for (domain, limit) in &self.domains {
            limit.validate(domain)?;
        }
        Ok(())
    }
}

/// Answer to "may I fetch now?".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub granted: bool,
    /// Zero when granted; otherwise the wait until one token is available.
    pub retry_after: Duration,
}

/// Token bucket for one domain (or one domain/identity pair).
#[derive(Debug, Clone)]
pub struct RateState {
    pub domain_key: String,
    pub tokens: f64,
    pub last_refill: Instant,
    pub capacity: f64,
    pub refill_rate: f64,
}

impl RateState {
    fn full(domain_key: &str, limit: RateLimit, now: Instant) -> Self {
        Self {
            domain_key: domain_key.to_string(),
            tokens: limit.capacity,
            last_refill: now,
            capacity: limit.capacity,
            refill_rate: limit.refill_per_sec,
        }
    }

    fn refill(&mut self, now: Instant) {
        // A caller holding an older `now` must not move the clock backwards.
        if now > self.last_refill {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_debit(&mut self, now: Instant) -> RateDecision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateDecision {
                granted: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let wait = (1.0 - self.tokens) / self.refill_rate;
            RateDecision {
                granted: false,
                retry_after: Duration::from_secs_f64(wait).max(Duration::from_millis(1)),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    domain: String,
    identity: Option<IdentityId>,
}

/// Thread-safe collection of token buckets.
///
/// Each bucket sits behind its own lock; the map lock is only held long
/// enough to find or create a bucket, so busy domains never block each other.
#[derive(Clone)]
pub struct RateGovernor {
    config: Arc<RateGovernorConfig>,
    buckets: Arc<Mutex<HashMap<BucketKey, Arc<Mutex<RateState>>>>>,
}

impl RateGovernor {
    /// Build a governor; malformed limits are rejected here, at startup.
    pub fn new(config: RateGovernorConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn per_identity(&self) -> bool {
        self.config.per_identity
    }

    fn bucket(&self, key: BucketKey, now: Instant) -> Arc<Mutex<RateState>> {
        let mut buckets = lock_or_recover(&self.buckets, "rate buckets");
        buckets
            .entry(key)
            .or_insert_with_key(|key| {
                let limit = self.config.limit_for(&key.domain);
                Arc::new(Mutex::new(RateState::full(&key.domain, limit, now)))
            })
            .clone()
    }

    fn decide(&self, key: BucketKey, now: Instant) -> RateDecision {
        let bucket = self.bucket(key, now);
        let mut state = lock_or_recover(&bucket, "rate state");
        state.try_debit(now)
    }

    /// Try to take one token for `domain` right now. Never fails.
    pub fn try_acquire(&self, domain: &str) -> RateDecision {
        self.try_acquire_at(domain, Instant::now())
    }

    pub fn try_acquire_at(&self, domain: &str, now: Instant) -> RateDecision {
        self.decide(
            BucketKey {
                domain: domain.to_string(),
                identity: None,
            },
            now,
        )
    }

    /// Like [`try_acquire_at`](Self::try_acquire_at), but uses the identity's
    /// own bucket when per-identity limiting is enabled.
    pub fn try_acquire_for(&self, domain: &str, identity: IdentityId, now: Instant) -> RateDecision {
        let identity = self.config.per_identity.then_some(identity);
        self.decide(
            BucketKey {
                domain: domain.to_string(),
                identity,
            },
            now,
        )
    }

    /// Wait until a token for `domain` is granted. Returns the time spent waiting.
    pub async fn acquire(&self, domain: &str) -> Duration {
        self.wait_for(domain, None).await
    }

    /// Like [`acquire`](Self::acquire), using the identity's bucket when
    /// per-identity limiting is enabled.
    pub async fn acquire_for(&self, domain: &str, identity: IdentityId) -> Duration {
        self.wait_for(domain, Some(identity)).await
    }

    async fn wait_for(&self, domain: &str, identity: Option<IdentityId>) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let now = Instant::now();
            let decision = match identity {
                Some(id) => self.try_acquire_for(domain, id, now),
                None => self.try_acquire_at(domain, now),
            };
            if decision.granted {
                return waited;
            }
            tracing::debug!(
                domain = %domain,
                wait_ms = %decision.retry_after.as_millis(),
                "Rate limited, waiting for token"
            );
            tokio::time::sleep(decision.retry_after).await;
            waited += decision.retry_after;
        }
    }

    /// Snapshot of the shared (not per-identity) bucket for `domain`, if one exists.
    pub fn state(&self, domain: &str) -> Option<RateState> {
        let key = BucketKey {
            domain: domain.to_string(),
            identity: None,
        };
        let bucket = lock_or_recover(&self.buckets, "rate buckets")
            .get(&key)
            .cloned()?;
        let state = lock_or_recover(&bucket, "rate state").clone();
        Some(state)
    }
}
