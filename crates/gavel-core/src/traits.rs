use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::{AppError, FetchError};
use crate::models::{Fields, ListingKey, ListingRef, ListingSnapshot, OpportunityRecord};
use crate::rate_governor::RateGovernor;
use crate::rotator::IdentityLease;
use crate::scheduler::DiscoveryTarget;

/// Raw HTTP response for one listing page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
    /// Cookie header value to carry forward on the identity, if the site set any.
    pub cookies: Option<String>,
}

/// Retrieves a page through a given egress identity.
///
/// Implementations only report transport-level failures (connect, reset,
/// timeout) as errors; HTTP statuses come back in [`FetchedPage`] and are
/// classified by the fetch worker.
pub trait PageFetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        identity: &IdentityLease,
    ) -> impl Future<Output = Result<FetchedPage, FetchError>> + Send;
}

/// Turns a listing page body into structured fields.
pub trait ListingParser: Send + Sync + Clone {
    /// Returns `Malformed` when required fields are missing.
    ///
    /// `fetched_at` anchors relative page text ("ends in 2h") so the fields
    /// of an unchanged listing are identical across fetches.
    fn parse(
        &self,
        listing: &ListingRef,
        body: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Fields, FetchError>;
}

/// Enumerates listing references from search/category pages.
pub trait DiscoverySource: Send + Sync + Clone {
    /// Fetch one result page (1-indexed). An empty vec means no more results.
    fn discover_page(
        &self,
        target: &DiscoveryTarget,
        page: u32,
    ) -> impl Future<Output = Result<Vec<ListingRef>, AppError>> + Send;

    /// Take the governor that paces listing fetches. Sources that hit the
    /// same sites should spend tokens from it before each page request.
    fn share_rate_governor(&mut self, _governor: RateGovernor) {}
}

/// Result of a compare-and-set write into the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub stored: bool,
}

/// Latest-snapshot-per-listing cache that gates re-analysis.
pub trait SnapshotStore: Send + Sync + Clone {
    /// Store `snapshot` only if its content hash differs from the stored one
    /// (or nothing is stored yet). Must be atomic per listing.
    fn put_if_changed(
        &self,
        snapshot: &ListingSnapshot,
    ) -> impl Future<Output = Result<PutOutcome, AppError>> + Send;

    fn get(
        &self,
        listing: &ListingKey,
    ) -> impl Future<Output = Result<Option<ListingSnapshot>, AppError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// External market value prediction (black box).
pub trait ValuePredictor: Send + Sync + Clone {
    fn predict_value(&self, fields: &Fields) -> impl Future<Output = Result<f64, AppError>> + Send;
}

/// External shipping cost estimation (black box).
pub trait ShippingEstimator: Send + Sync + Clone {
    fn estimate_shipping_cost(
        &self,
        fields: &Fields,
    ) -> impl Future<Output = Result<f64, AppError>> + Send;
}

/// Persists opportunity records and remembers which snapshot each listing
/// was last analysed from.
pub trait OpportunityStore: Send + Sync + Clone {
    /// Store an emitted record, superseding any previous one for the listing.
    ///
    /// Returns `false` and leaves the store untouched when the current record
    /// comes from a snapshot fetched later than `record`'s.
    fn publish(
        &self,
        record: &OpportunityRecord,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Record a below-threshold result so it stays observable. Same recency
    /// rule as [`publish`](Self::publish).
    fn suppress(
        &self,
        record: &OpportunityRecord,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Content hash of the snapshot the listing was last analysed from.
    fn last_analyzed_hash(
        &self,
        listing: &ListingKey,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Emitted records computed after `since`, oldest first.
    fn since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OpportunityRecord>, AppError>> + Send;

    /// Most recent suppressed records, newest first.
    fn suppressed(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OpportunityRecord>, AppError>> + Send;
}
