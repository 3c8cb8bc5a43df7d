//! Egress identity pool: proxy, user agent and cookie jar per identity.
//!
//! Each identity carries a health score in `[0, 1]` and a cooldown deadline.
//! Selection is weighted-random by health among eligible identities:
//!
//! ```text
//! eligible = !retired && health > floor && cooldown_until <= now
//! ```
//!
//! Outcomes reported after every fetch move the score:
//!
//! ```text
//! Blocked:   health *= decay, cooldown = min(base * 2^(failures-1), cap)
//! Success:   health = min(1, health + recovery), failures = 0
//! Transient: unchanged
//! Banned:    retired until reinstate()
//! ```
//!
//! An identity that sank to or below the floor is parked; once its cooldown
//! has elapsed it is lifted back to probation health (`floor + recovery`)
//! the next time the pool is scanned, the same lazy transition a circuit
//! breaker makes from open to half-open.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::{AppError, ErrorKind};
use crate::util::lock_or_recover;

/// Browser user agents used when no identities are configured.
pub const DEFAULT_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0",
];

/// Index of an identity in the rotator's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub usize);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity-{}", self.0)
    }
}

/// Static description of one egress identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Proxy URL (`http`, `https`, `socks5`, `socks5h`). `None` means direct egress.
    #[serde(default)]
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl IdentityConfig {
    pub fn direct(user_agent: impl Into<String>) -> Self {
        Self {
            proxy: None,
            user_agent: user_agent.into(),
        }
    }

    fn validate(&self, index: usize) -> Result<(), AppError> {
        if self.user_agent.trim().is_empty() {
            return Err(AppError::ConfigError(format!(
                "identity {index}: user_agent must not be empty"
            )));
        }
        if let Some(proxy) = &self.proxy {
            let url = Url::parse(proxy).map_err(|e| {
                AppError::ConfigError(format!("identity {index}: invalid proxy URL '{proxy}': {e}"))
            })?;
            if !matches!(url.scheme(), "http" | "https" | "socks5" | "socks5h") {
                return Err(AppError::ConfigError(format!(
                    "identity {index}: unsupported proxy scheme '{}'",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

/// One direct-egress identity per entry of [`DEFAULT_USER_AGENTS`].
pub fn default_identities() -> Vec<IdentityConfig> {
    DEFAULT_USER_AGENTS
        .iter()
        .map(|ua| IdentityConfig::direct(*ua))
        .collect()
}

/// What the fetcher needs to make a request as a given identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityLease {
    pub id: IdentityId,
    pub proxy_endpoint: Option<String>,
    pub user_agent: String,
    pub cookies: Option<String>,
}

/// Result of a fetch as seen by the identity that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Transient,
    Blocked,
    Banned,
}

impl Outcome {
    /// How a classified fetch failure reflects on the identity.
    ///
    /// A 404 was served normally, so it counts in the identity's favour;
    /// unparseable pages say nothing about the identity either way.
    pub fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Blocked => Outcome::Blocked,
            ErrorKind::NotFound => Outcome::Success,
            ErrorKind::Transient | ErrorKind::Malformed | ErrorKind::NoIdentityAvailable => {
                Outcome::Transient
            }
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Transient => write!(f, "transient"),
            Outcome::Blocked => write!(f, "blocked"),
            Outcome::Banned => write!(f, "banned"),
        }
    }
}

/// Health and cooldown tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RotatorConfig {
    /// Identities at or below this health are not selected.
    pub health_floor: f64,
    /// Multiplier applied to health on `Blocked`.
    pub blocked_decay: f64,
    /// Added to health on `Success`.
    pub success_recovery: f64,
    pub cooldown_base: Duration,
    pub cooldown_cap: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            health_floor: 0.2,
            blocked_decay: 0.5,
            success_recovery: 0.1,
            cooldown_base: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(600),
        }
    }
}

impl RotatorConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..1.0).contains(&self.health_floor) {
            return Err(AppError::ConfigError(format!(
                "rotator.health_floor must be in [0, 1), got {}",
                self.health_floor
            )));
        }
        if !(self.blocked_decay > 0.0 && self.blocked_decay < 1.0) {
            return Err(AppError::ConfigError(format!(
                "rotator.blocked_decay must be in (0, 1), got {}",
                self.blocked_decay
            )));
        }
        if !self.success_recovery.is_finite() || self.success_recovery <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "rotator.success_recovery must be > 0, got {}",
                self.success_recovery
            )));
        }
        if self.cooldown_base > self.cooldown_cap {
            return Err(AppError::ConfigError(
                "rotator.cooldown_base_secs must not exceed cooldown_cap_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Cooldown after the n-th consecutive block (n >= 1).
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.cooldown_base
            .saturating_mul(factor)
            .min(self.cooldown_cap)
    }
}

/// Every identity is cooling down, parked or retired.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no identity available for {domain}")]
pub struct NoIdentityAvailable {
    pub domain: String,
    /// Time until the earliest cooldown ends, if any identity is merely cooling down.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct IdentityState {
    config: IdentityConfig,
    health: f64,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    retired: bool,
    cookies: Option<String>,
    last_used: HashMap<String, Instant>,
    uses: u64,
}

impl IdentityState {
    fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            health: 1.0,
            cooldown_until: None,
            consecutive_failures: 0,
            retired: false,
            cookies: None,
            last_used: HashMap::new(),
            uses: 0,
        }
    }

    fn cooling(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now))
    }
}

/// Monitoring view of one identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
    pub id: IdentityId,
    pub proxy_endpoint: Option<String>,
    pub user_agent: String,
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub cooldown_remaining: Option<Duration>,
    pub retired: bool,
    pub uses: u64,
}

/// Thread-safe identity pool.
///
/// Each identity sits behind its own lock, so reports for different
/// identities never contend.
#[derive(Clone)]
pub struct IdentityRotator {
    config: Arc<RotatorConfig>,
    identities: Arc<Vec<Mutex<IdentityState>>>,
}

impl IdentityRotator {
    pub fn new(identities: Vec<IdentityConfig>, config: RotatorConfig) -> Result<Self, AppError> {
        config.validate()?;
        if identities.is_empty() {
            return Err(AppError::ConfigError(
                "at least one identity is required".to_string(),
            ));
        }
        for (index, identity) in identities.iter().enumerate() {
            identity.validate(index)?;
        }
        let identities = identities
            .into_iter()
            .map(|c| Mutex::new(IdentityState::new(c)))
            .collect();
        Ok(Self {
            config: Arc::new(config),
            identities: Arc::new(identities),
        })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    fn lock(&self, id: IdentityId) -> Option<MutexGuard<'_, IdentityState>> {
        self.identities
            .get(id.0)
            .map(|m| lock_or_recover(m, "identity"))
    }

    /// Lift a parked identity back to probation once its cooldown is over.
    fn refresh(&self, id: IdentityId, state: &mut IdentityState, now: Instant) {
        if !state.retired
            && state.health <= self.config.health_floor
            && state.cooling(now).is_none()
        {
            state.health = (self.config.health_floor + self.config.success_recovery).min(1.0);
            tracing::debug!(identity = %id, health = state.health, "Identity back on probation");
        }
    }

    fn is_eligible(&self, state: &IdentityState, now: Instant) -> bool {
        !state.retired && state.health > self.config.health_floor && state.cooling(now).is_none()
    }

    /// Pick an identity for `domain`.
    pub fn select(&self, domain: &str) -> Result<IdentityLease, NoIdentityAvailable> {
        self.select_with(domain, Instant::now(), &mut rand::thread_rng())
    }

    pub fn select_at(&self, domain: &str, now: Instant) -> Result<IdentityLease, NoIdentityAvailable> {
        self.select_with(domain, now, &mut rand::thread_rng())
    }

    fn select_with<R: Rng + ?Sized>(
        &self,
        domain: &str,
        now: Instant,
        rng: &mut R,
    ) -> Result<IdentityLease, NoIdentityAvailable> {
        // A report may land between scanning and leasing; rescan in that case.
        for _ in 0..=self.identities.len() {
            let mut candidates = Vec::new();
            let mut earliest: Option<Duration> = None;

            for index in 0..self.identities.len() {
                let id = IdentityId(index);
                let Some(mut state) = self.lock(id) else { continue };
                self.refresh(id, &mut state, now);
                if self.is_eligible(&state, now) {
                    candidates.push((id, state.health, state.last_used.get(domain).copied()));
                } else if !state.retired
                    && let Some(wait) = state.cooling(now)
                {
                    earliest = Some(earliest.map_or(wait, |e| e.min(wait)));
                }
            }

            if candidates.is_empty() {
                return Err(NoIdentityAvailable {
                    domain: domain.to_string(),
                    retry_after: earliest,
                });
            }

            let chosen = choose(&candidates, rng);
            if let Some(mut state) = self.lock(chosen)
                && self.is_eligible(&state, now)
            {
                state.last_used.insert(domain.to_string(), now);
                state.uses += 1;
                return Ok(IdentityLease {
                    id: chosen,
                    proxy_endpoint: state.config.proxy.clone(),
                    user_agent: state.config.user_agent.clone(),
                    cookies: state.cookies.clone(),
                });
            }
        }

        Err(NoIdentityAvailable {
            domain: domain.to_string(),
            retry_after: None,
        })
    }

    /// Record the outcome of a fetch made with `id`.
    pub fn report(&self, id: IdentityId, outcome: Outcome) {
        self.report_at(id, outcome, Instant::now());
    }

    pub fn report_at(&self, id: IdentityId, outcome: Outcome, now: Instant) {
        let Some(mut state) = self.lock(id) else {
            tracing::warn!(identity = %id, "Outcome reported for unknown identity");
            return;
        };

        match outcome {
            Outcome::Success => {
                state.health = (state.health + self.config.success_recovery).min(1.0);
                state.consecutive_failures = 0;
            }
            Outcome::Transient => {}
            Outcome::Blocked => {
                state.health *= self.config.blocked_decay;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let cooldown = self.config.cooldown_for(state.consecutive_failures);
                state.cooldown_until = Some(now + cooldown);
                tracing::warn!(
                    identity = %id,
                    health = state.health,
                    failures = state.consecutive_failures,
                    cooldown_secs = cooldown.as_secs_f64(),
                    "Identity blocked, cooling down"
                );
            }
            Outcome::Banned => {
                state.health = 0.0;
                state.retired = true;
                tracing::warn!(identity = %id, "Identity banned and retired");
            }
        }
    }

    /// Replace the cookie header carried by `id`.
    pub fn update_cookies(&self, id: IdentityId, cookies: Option<String>) {
        if let Some(mut state) = self.lock(id) {
            state.cookies = cookies;
        }
    }

    /// Bring a retired identity back at full health. Returns false for unknown ids.
    pub fn reinstate(&self, id: IdentityId) -> bool {
        let Some(mut state) = self.lock(id) else {
            return false;
        };
        state.retired = false;
        state.health = 1.0;
        state.consecutive_failures = 0;
        state.cooldown_until = None;
        tracing::info!(identity = %id, "Identity reinstated");
        true
    }

    pub fn stats(&self) -> Vec<IdentityStats> {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> Vec<IdentityStats> {
        (0..self.identities.len())
            .filter_map(|index| {
                let id = IdentityId(index);
                let state = self.lock(id)?;
                Some(IdentityStats {
                    id,
                    proxy_endpoint: state.config.proxy.clone(),
                    user_agent: state.config.user_agent.clone(),
                    health_score: state.health,
                    consecutive_failures: state.consecutive_failures,
                    cooldown_remaining: state.cooling(now),
                    retired: state.retired,
                    uses: state.uses,
                })
            })
            .collect()
    }
}

/// Weighted random by health; least-recently-used on the domain when all
/// candidates are equally healthy.
fn choose<R: Rng + ?Sized>(
    candidates: &[(IdentityId, f64, Option<Instant>)],
    rng: &mut R,
) -> IdentityId {
    let first_health = candidates[0].1;
    let all_tied = candidates
        .iter()
        .all(|(_, h, _)| (h - first_health).abs() < 1e-9);

    if !all_tied
        && let Ok(dist) = WeightedIndex::new(candidates.iter().map(|(_, h, _)| *h))
    {
        return candidates[dist.sample(rng)].0;
    }

    // Never-used sorts before any timestamp; index breaks remaining ties.
    candidates
        .iter()
        .min_by_key(|(id, _, last)| (*last, *id))
        .map(|(id, _, _)| *id)
        .unwrap_or(candidates[0].0)
}
