use std::time::Duration;

use chrono::Utc;

use crate::error::FetchError;
use crate::models::{ListingRef, ListingSnapshot};
use crate::rate_governor::RateGovernor;
use crate::rotator::{IdentityLease, IdentityRotator, Outcome};
use crate::traits::{FetchedPage, ListingParser, PageFetcher};
use crate::util::domain_key;

/// Body markers of bot walls served with a 2xx status.
pub const CAPTCHA_MARKERS: [&str; 4] = [
    "captcha",
    "are you a robot",
    "unusual traffic",
    "access denied",
];

/// Classify a response before it is handed to the parser.
pub fn classify_response(status: u16, body: &str) -> Result<(), FetchError> {
    match status {
        200..=299 => {
            let lowered = body.to_lowercase();
            match CAPTCHA_MARKERS.iter().find(|m| lowered.contains(*m)) {
                Some(marker) => Err(FetchError::blocked(format!(
                    "bot wall detected ({marker})"
                ))),
                None => Ok(()),
            }
        }
        403 | 429 => Err(FetchError::blocked(format!("HTTP {status}"))),
        404 | 410 => Err(FetchError::not_found(format!("HTTP {status}"))),
        408 | 500..=599 => Err(FetchError::transient(format!("HTTP {status}"))),
        400..=499 => Err(FetchError::malformed(format!("HTTP {status}"))),
        _ => Err(FetchError::transient(format!("unexpected HTTP {status}"))),
    }
}

/// Retrieves one listing: identity, rate token, fetch, classify, parse, hash.
///
/// A single call never retries. Every outcome is reported to the rotator
/// before the call returns, so a `Blocked` error has already penalised the
/// identity that caused it.
#[derive(Clone)]
pub struct FetchWorker<P, X>
where
    P: PageFetcher,
    X: ListingParser,
{
    fetcher: P,
    parser: X,
    rotator: IdentityRotator,
    governor: RateGovernor,
    timeout: Duration,
}

impl<P, X> FetchWorker<P, X>
where
    P: PageFetcher,
    X: ListingParser,
{
    pub fn new(
        fetcher: P,
        parser: X,
        rotator: IdentityRotator,
        governor: RateGovernor,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            parser,
            rotator,
            governor,
            timeout,
        }
    }

    pub fn rotator(&self) -> &IdentityRotator {
        &self.rotator
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// The rate wait happens before the hard timeout starts: time spent
    /// queueing behind this process's own throttle never costs an attempt.
    pub async fn fetch(&self, listing: &ListingRef) -> Result<ListingSnapshot, FetchError> {
        let domain = domain_key(&listing.url).ok_or_else(|| {
            FetchError::malformed(format!("listing URL has no host: {}", listing.url))
        })?;

        let lease = self
            .rotator
            .select(&domain)
            .map_err(|e| FetchError::no_identity(e.to_string()))?;

        let waited = self.governor.acquire_for(&domain, lease.id).await;
        if !waited.is_zero() {
            tracing::debug!(domain = %domain, waited_ms = %waited.as_millis(), "Rate token granted");
        }

        match tokio::time::timeout(self.timeout, self.fetch_as(listing, &lease)).await {
            Ok(result) => result,
            Err(_) => {
                self.rotator.report(lease.id, Outcome::Transient);
                Err(FetchError::transient(format!(
                    "fetch timed out after {}s",
                    self.timeout.as_secs_f64()
                )))
            }
        }
    }

    async fn fetch_as(
        &self,
        listing: &ListingRef,
        lease: &IdentityLease,
    ) -> Result<ListingSnapshot, FetchError> {
        let page = match self.fetcher.fetch(&listing.url, lease).await {
            Ok(page) => page,
            Err(e) => {
                self.rotator
                    .report(lease.id, Outcome::from_error_kind(e.kind));
                return Err(e);
            }
        };
        let fetched_at = Utc::now();
        self.remember_cookies(lease, &page);

        if let Err(e) = classify_response(page.status, &page.body) {
            self.rotator
                .report(lease.id, Outcome::from_error_kind(e.kind));
            tracing::debug!(
                listing = %listing.key(),
                identity = %lease.id,
                kind = %e.kind,
                "Fetch classified as failure"
            );
            return Err(e);
        }
        self.rotator.report(lease.id, Outcome::Success);

        let fields = self.parser.parse(listing, &page.body, fetched_at)?;
        let snapshot = ListingSnapshot::fetched(listing.clone(), fields, page.body.len(), fetched_at);
        tracing::debug!(
            listing = %listing.key(),
            bytes = snapshot.raw_size,
            hash = %&snapshot.content_hash[..8],
            "Listing fetched"
        );
        Ok(snapshot)
    }

    fn remember_cookies(&self, lease: &IdentityLease, page: &FetchedPage) {
        if page.cookies.is_some() && page.cookies != lease.cookies {
            self.rotator.update_cookies(lease.id, page.cookies.clone());
        }
    }
}
