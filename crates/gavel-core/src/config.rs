//! Pipeline configuration loading and validation.
//!
//! Configuration is read from a TOML file in which every key is optional, so
//! an empty file is valid. A few `GAVEL_*` environment variables override the
//! file afterwards. Malformed values are rejected at startup and never
//! reach the running pipeline.
//!
//! ```toml
//! fetch_timeout_secs = 20
//!
//! [rate_limits.default]
//! capacity = 5.0
//! refill_per_sec = 1.0
//!
//! [rate_limits.domains."www.ebay.com"]
//! capacity = 2.0
//! refill_per_sec = 0.5
//!
//! [[identities]]
//! proxy = "socks5://10.0.0.2:1080"
//! user_agent = "Mozilla/5.0 ..."
//!
//! [jobs]
//! max_attempts = 3
//!
//! [analysis]
//! margin_threshold = 25.0
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::analysis::AnalysisConfig;
use crate::error::AppError;
use crate::job::{BackoffConfig, OrchestratorConfig, PriorityWeights};
use crate::rate_governor::{RateGovernorConfig, RateLimit};
use crate::rotator::{IdentityConfig, RotatorConfig, default_identities};

pub const ENV_MAX_ATTEMPTS: &str = "GAVEL_MAX_ATTEMPTS";
pub const ENV_FETCH_WORKERS: &str = "GAVEL_FETCH_WORKERS";
pub const ENV_ANALYSIS_WORKERS: &str = "GAVEL_ANALYSIS_WORKERS";
pub const ENV_FETCH_TIMEOUT_SECS: &str = "GAVEL_FETCH_TIMEOUT_SECS";
pub const ENV_MARGIN_THRESHOLD: &str = "GAVEL_MARGIN_THRESHOLD";

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let limit = RateLimit::default();
        Self {
            capacity: limit.capacity,
            refill_per_sec: limit.refill_per_sec,
        }
    }
}

impl From<RateLimitSettings> for RateLimit {
    fn from(s: RateLimitSettings) -> Self {
        RateLimit::new(s.capacity, s.refill_per_sec)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitsSection {
    pub default: RateLimitSettings,
    pub domains: BTreeMap<String, RateLimitSettings>,
    pub per_identity: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RotatorSection {
    pub health_floor: f64,
    pub blocked_decay: f64,
    pub success_recovery: f64,
    pub cooldown_base_secs: u64,
    pub cooldown_cap_secs: u64,
}

impl Default for RotatorSection {
    fn default() -> Self {
        let d = RotatorConfig::default();
        Self {
            health_floor: d.health_floor,
            blocked_decay: d.blocked_decay,
            success_recovery: d.success_recovery,
            cooldown_base_secs: d.cooldown_base.as_secs(),
            cooldown_cap_secs: d.cooldown_cap.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub jitter_low: f64,
    pub jitter_high: f64,
    pub no_identity_min_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        let b = BackoffConfig::default();
        let o = OrchestratorConfig::default();
        Self {
            max_attempts: o.max_attempts,
            backoff_base_ms: b.base.as_millis() as u64,
            backoff_cap_ms: b.cap.as_millis() as u64,
            jitter_low: b.jitter_low,
            jitter_high: b.jitter_high,
            no_identity_min_backoff_ms: b.no_identity_min.as_millis() as u64,
            poll_interval_ms: o.poll_interval.as_millis() as u64,
            shutdown_grace_secs: o.shutdown_grace.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Listings completed within this window are not re-enqueued. 0 disables.
    pub freshness_window_secs: u64,
    pub max_pages: u32,
    /// Cadence for targets given without one on the command line.
    pub default_cadence_secs: u64,
    pub scheduled_priority: i32,
    pub on_demand_priority: i32,
    pub retry_priority_delta: i32,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let w = PriorityWeights::default();
        Self {
            freshness_window_secs: 900,
            max_pages: 5,
            default_cadence_secs: 1800,
            scheduled_priority: w.scheduled,
            on_demand_priority: w.on_demand,
            retry_priority_delta: w.retry_delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub margin_threshold: f64,
    pub buyers_premium_rate: f64,
    pub sales_tax_rate: f64,
    pub platform_fee_rate: f64,
    /// Used by the flat-rate shipping strategy when a listing has no shipping field.
    pub flat_shipping_cost: f64,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        let a = AnalysisConfig::default();
        Self {
            margin_threshold: a.margin_threshold,
            buyers_premium_rate: a.buyers_premium_rate,
            sales_tax_rate: a.sales_tax_rate,
            platform_fee_rate: a.platform_fee_rate,
            flat_shipping_cost: 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub fetch: usize,
    pub analysis: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            fetch: OrchestratorConfig::default().fetch_workers,
            analysis: AnalysisConfig::default().workers,
        }
    }
}

/// External scoring endpoints. Without a shipping URL the flat-rate strategy is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScoringSection {
    pub predictor_url: Option<String>,
    pub shipping_url: Option<String>,
    pub api_key: Option<String>,
}

/// Per-source overrides for discovery and parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Search URL with `{page}` and `{<param>}` placeholders.
    pub search_url: Option<String>,
    /// CSS selector for listing links on a result page.
    pub link_selector: Option<String>,
    /// CSS selector per listing field.
    pub selectors: BTreeMap<String, String>,
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fetch_timeout_secs: u64,
    pub rate_limits: RateLimitsSection,
    pub identities: Vec<IdentityConfig>,
    pub rotator: RotatorSection,
    pub jobs: JobsSection,
    pub discovery: DiscoverySection,
    pub analysis: AnalysisSection,
    pub workers: WorkersSection,
    pub scoring: ScoringSection,
    pub sources: BTreeMap<String, SourceSection>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            rate_limits: RateLimitsSection::default(),
            identities: Vec::new(),
            rotator: RotatorSection::default(),
            jobs: JobsSection::default(),
            discovery: DiscoverySection::default(),
            analysis: AnalysisSection::default(),
            workers: WorkersSection::default(),
            scoring: ScoringSection::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Parse TOML content, apply no overrides, and validate.
    pub fn parse_toml(content: &str) -> Result<Self, AppError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, apply `GAVEL_*` environment overrides, and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("invalid TOML in {}: {e}", path.display())))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, ENV_MAX_ATTEMPTS)? {
            self.jobs.max_attempts = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_FETCH_WORKERS)? {
            self.workers.fetch = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_ANALYSIS_WORKERS)? {
            self.workers.analysis = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_FETCH_TIMEOUT_SECS)? {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_MARGIN_THRESHOLD)? {
            self.analysis.margin_threshold = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.fetch_timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.jobs.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "jobs.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.workers.fetch == 0 {
            return Err(AppError::ConfigError(
                "workers.fetch must be at least 1".to_string(),
            ));
        }
        if self.discovery.max_pages == 0 {
            return Err(AppError::ConfigError(
                "discovery.max_pages must be at least 1".to_string(),
            ));
        }
        self.rate_governor().validate()?;
        self.rotator().validate()?;
        self.backoff().validate()?;
        self.analysis().validate()?;
        if !self.analysis.flat_shipping_cost.is_finite() || self.analysis.flat_shipping_cost < 0.0 {
            return Err(AppError::ConfigError(
                "analysis.flat_shipping_cost must be a finite number >= 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.discovery.freshness_window_secs)
    }

    pub fn default_cadence(&self) -> Option<Duration> {
        (self.discovery.default_cadence_secs > 0)
            .then(|| Duration::from_secs(self.discovery.default_cadence_secs))
    }

    pub fn rate_governor(&self) -> RateGovernorConfig {
        let domains: HashMap<_, _> = self
            .rate_limits
            .domains
            .iter()
            .map(|(domain, limit)| (domain.to_ascii_lowercase(), RateLimit::from(*limit)))
            .collect();
        RateGovernorConfig {
            default: self.rate_limits.default.into(),
            domains,
            per_identity: self.rate_limits.per_identity,
        }
    }

    /// Configured identities, or the default user-agent pool with direct egress.
    pub fn identities(&self) -> Vec<IdentityConfig> {
        if self.identities.is_empty() {
            default_identities()
        } else {
            self.identities.clone()
        }
    }

    pub fn rotator(&self) -> RotatorConfig {
        RotatorConfig {
            health_floor: self.rotator.health_floor,
            blocked_decay: self.rotator.blocked_decay,
            success_recovery: self.rotator.success_recovery,
            cooldown_base: Duration::from_secs(self.rotator.cooldown_base_secs),
            cooldown_cap: Duration::from_secs(self.rotator.cooldown_cap_secs),
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.jobs.backoff_base_ms),
            cap: Duration::from_millis(self.jobs.backoff_cap_ms),
            jitter_low: self.jobs.jitter_low,
            jitter_high: self.jobs.jitter_high,
            no_identity_min: Duration::from_millis(self.jobs.no_identity_min_backoff_ms),
        }
    }

    pub fn weights(&self) -> PriorityWeights {
        PriorityWeights {
            scheduled: self.discovery.scheduled_priority,
            on_demand: self.discovery.on_demand_priority,
            retry_delta: self.discovery.retry_priority_delta,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_attempts: self.jobs.max_attempts,
            backoff: self.backoff(),
            fetch_workers: self.workers.fetch,
            poll_interval: Duration::from_millis(self.jobs.poll_interval_ms),
            shutdown_grace: Duration::from_secs(self.jobs.shutdown_grace_secs),
            retry_delta: self.discovery.retry_priority_delta,
            ..OrchestratorConfig::default()
        }
    }

    pub fn analysis(&self) -> AnalysisConfig {
        AnalysisConfig {
            margin_threshold: self.analysis.margin_threshold,
            buyers_premium_rate: self.analysis.buyers_premium_rate,
            sales_tax_rate: self.analysis.sales_tax_rate,
            platform_fee_rate: self.analysis.platform_fee_rate,
            workers: self.workers.analysis,
        }
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::ConfigError(format!("{key}={raw:?} is invalid: {e}"))),
    }
}
