//! Test utilities: mock implementations of the pipeline's ports.
//!
//! Handwritten mocks for dependency injection in unit tests. They record
//! their calls behind `Arc<Mutex<_>>` so clones handed to the code under
//! test share state with the copy the test asserts on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::{AppError, FetchError};
use crate::models::{Fields, ListingKey, ListingRef, ListingSnapshot, Source};
use crate::orchestrator::{OrchestratorEvent, OrchestratorReporter};
use crate::rate_governor::RateGovernor;
use crate::rotator::IdentityId;
use crate::scheduler::DiscoveryTarget;
use crate::traits::{
    DiscoverySource, FetchedPage, ListingParser, PageFetcher, PutOutcome, ShippingEstimator,
    SnapshotStore, ValuePredictor,
};

pub fn test_listing(id: &str) -> ListingRef {
    ListingRef::new(
        Source::Local,
        id,
        format!("https://auctions.example/lot/{id}"),
    )
}

pub fn test_fields(title: &str, price: f64) -> Fields {
    let mut fields = Fields::new();
    fields.insert("title".to_string(), json!(title));
    fields.insert("price".to_string(), json!(price));
    fields
}

/// JSON page body understood by [`JsonListingParser`].
pub fn listing_body(title: &str, price: f64) -> String {
    json!({ "title": title, "price": price }).to_string()
}

// ---------------------------------------------------------------------------
// MockPageFetcher
// ---------------------------------------------------------------------------

/// One recorded call to [`MockPageFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub url: String,
    pub identity: IdentityId,
    pub user_agent: String,
    pub cookies: Option<String>,
}

/// Page fetcher serving canned responses.
///
/// Lookup order: a route matching the URL exactly, then the response queue,
/// then the fallback response once the queue is drained.
#[derive(Clone)]
pub struct MockPageFetcher {
    routes: Arc<Mutex<HashMap<String, FetchedPage>>>,
    responses: Arc<Mutex<VecDeque<Result<FetchedPage, FetchError>>>>,
    fallback: Result<FetchedPage, FetchError>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
}

impl MockPageFetcher {
    fn build(
        responses: Vec<Result<FetchedPage, FetchError>>,
        fallback: Result<FetchedPage, FetchError>,
    ) -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            responses: Arc::new(Mutex::new(responses.into())),
            fallback,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answers 200 with `body`.
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    /// Always answers `status` with `body`.
    pub fn status(status: u16, body: &str) -> Self {
        Self::build(Vec::new(), Ok(page(status, body)))
    }

    /// Serves `responses` in order, then a valid listing page.
    pub fn with_responses(responses: Vec<Result<FetchedPage, FetchError>>) -> Self {
        Self::build(responses, Ok(page(200, &listing_body("Default", 1.0))))
    }

    /// Answer requests for `url` with a fixed response.
    pub fn with_route(self, url: &str, status: u16, body: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), page(status, body));
        self
    }

    /// Sleep before answering (tokio time, so paused clocks apply).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn page(status: u16, body: &str) -> FetchedPage {
    FetchedPage {
        status,
        body: body.to_string(),
        cookies: None,
    }
}

impl PageFetcher for MockPageFetcher {
    async fn fetch(
        &self,
        url: &str,
        identity: &crate::rotator::IdentityLease,
    ) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(FetchCall {
            url: url.to_string(),
            identity: identity.id,
            user_agent: identity.user_agent.clone(),
            cookies: identity.cookies.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(routed) = self.routes.lock().unwrap().get(url) {
            return Ok(routed.clone());
        }
        let queued = self.responses.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// JsonListingParser
// ---------------------------------------------------------------------------

/// Parses JSON object bodies; requires a string `title` and a numeric `price`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonListingParser;

impl ListingParser for JsonListingParser {
    fn parse(
        &self,
        listing: &ListingRef,
        body: &str,
        _fetched_at: DateTime<Utc>,
    ) -> Result<Fields, FetchError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| FetchError::malformed(format!("{}: not JSON: {e}", listing.url)))?;
        let Value::Object(map) = value else {
            return Err(FetchError::malformed("body is not a JSON object"));
        };
        if !map.get("title").is_some_and(Value::is_string) {
            return Err(FetchError::malformed("missing title"));
        }
        if !map.get("price").is_some_and(Value::is_number) {
            return Err(FetchError::malformed("missing price"));
        }
        Ok(map.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// MockDiscovery
// ---------------------------------------------------------------------------

/// Discovery source over fixed result pages (1-indexed).
#[derive(Clone)]
pub struct MockDiscovery {
    pages: Arc<Vec<Vec<ListingRef>>>,
    failing_on: Option<u32>,
    requested: Arc<Mutex<Vec<u32>>>,
    governor: Arc<Mutex<Option<RateGovernor>>>,
}

impl MockDiscovery {
    pub fn with_pages(pages: Vec<Vec<ListingRef>>) -> Self {
        Self {
            pages: Arc::new(pages),
            failing_on: None,
            requested: Arc::new(Mutex::new(Vec::new())),
            governor: Arc::new(Mutex::new(None)),
        }
    }

    /// Make requests for `page` fail.
    pub fn failing_on(mut self, page: u32) -> Self {
        self.failing_on = Some(page);
        self
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }

    pub fn shared_governor(&self) -> Option<RateGovernor> {
        self.governor.lock().unwrap().clone()
    }
}

impl DiscoverySource for MockDiscovery {
    async fn discover_page(
        &self,
        _target: &DiscoveryTarget,
        page: u32,
    ) -> Result<Vec<ListingRef>, AppError> {
        self.requested.lock().unwrap().push(page);
        if self.failing_on == Some(page) {
            return Err(AppError::HttpError(format!("page {page} unavailable")));
        }
        let index = page.saturating_sub(1) as usize;
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }

    fn share_rate_governor(&mut self, governor: RateGovernor) {
        *self.governor.lock().unwrap() = Some(governor);
    }
}

// ---------------------------------------------------------------------------
// Scorers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockPredictor {
    result: Result<f64, String>,
    calls: Arc<AtomicUsize>,
}

impl MockPredictor {
    pub fn value(value: f64) -> Self {
        Self {
            result: Ok(value),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ValuePredictor for MockPredictor {
    async fn predict_value(&self, _fields: &Fields) -> Result<f64, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map_err(AppError::AnalysisUnavailable)
    }
}

#[derive(Clone)]
pub struct MockShipping {
    result: Result<f64, String>,
}

impl MockShipping {
    pub fn cost(cost: f64) -> Self {
        Self { result: Ok(cost) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

impl ShippingEstimator for MockShipping {
    async fn estimate_shipping_cost(&self, _fields: &Fields) -> Result<f64, AppError> {
        self.result.clone().map_err(AppError::AnalysisUnavailable)
    }
}

// ---------------------------------------------------------------------------
// FailingSnapshotStore
// ---------------------------------------------------------------------------

/// Snapshot store whose every operation fails, as during a database outage.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSnapshotStore;

impl SnapshotStore for FailingSnapshotStore {
    async fn put_if_changed(&self, _snapshot: &ListingSnapshot) -> Result<PutOutcome, AppError> {
        Err(AppError::DatabaseError("connection refused".to_string()))
    }

    async fn get(&self, _listing: &ListingKey) -> Result<Option<ListingSnapshot>, AppError> {
        Err(AppError::DatabaseError("connection refused".to_string()))
    }

    async fn count(&self) -> Result<u64, AppError> {
        Err(AppError::DatabaseError("connection refused".to_string()))
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Records the name of every orchestrator event it sees.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl OrchestratorReporter for RecordingReporter {
    fn report(&self, event: OrchestratorEvent<'_>) {
        let name = match event {
            OrchestratorEvent::Started { .. } => "started",
            OrchestratorEvent::JobDispatched { .. } => "dispatched",
            OrchestratorEvent::JobSucceeded { .. } => "succeeded",
            OrchestratorEvent::JobRetryScheduled { .. } => "retry_scheduled",
            OrchestratorEvent::JobDeadLettered { .. } => "dead_lettered",
            OrchestratorEvent::AnalysisDropped { .. } => "analysis_dropped",
            OrchestratorEvent::ShuttingDown { .. } => "shutting_down",
            OrchestratorEvent::Stopped { .. } => "stopped",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
