//! Opportunity scoring for changed snapshots.
//!
//! ```text
//! fees   = listing_cost * (buyers_premium + sales_tax) + predicted_value * platform_fee
//! margin = predicted_value - (listing_cost + fees + shipping_cost)
//! ```
//!
//! Records below the margin threshold are kept as suppressed rather than
//! emitted. A scorer failure leaves no trace in the opportunity store, so the
//! listing is analysed again the next time its snapshot changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Fields, ListingKey, ListingSnapshot, OpportunityRecord, field_number};
use crate::traits::{OpportunityStore, ShippingEstimator, ValuePredictor};
use crate::util::lock_or_recover;

/// Scoring parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Minimum margin for a record to be emitted.
    pub margin_threshold: f64,
    pub buyers_premium_rate: f64,
    pub sales_tax_rate: f64,
    pub platform_fee_rate: f64,
    /// Concurrent analyses.
    pub workers: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            margin_threshold: 20.0,
            buyers_premium_rate: 0.15,
            sales_tax_rate: 0.0,
            platform_fee_rate: 0.13,
            workers: 4,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.margin_threshold.is_finite() {
            return Err(AppError::ConfigError(
                "analysis.margin_threshold must be finite".to_string(),
            ));
        }
        for (name, rate) in [
            ("buyers_premium_rate", self.buyers_premium_rate),
            ("sales_tax_rate", self.sales_tax_rate),
            ("platform_fee_rate", self.platform_fee_rate),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(AppError::ConfigError(format!(
                    "analysis.{name} must be a finite number >= 0, got {rate}"
                )));
            }
        }
        if self.workers == 0 {
            return Err(AppError::ConfigError(
                "workers.analysis must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fees(&self, listing_cost: f64, predicted_value: f64) -> f64 {
        listing_cost * (self.buyers_premium_rate + self.sales_tax_rate)
            + predicted_value * self.platform_fee_rate
    }
}

/// Result of analysing one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Emitted(OpportunityRecord),
    /// Below the margin threshold; stored for the status query only.
    Suppressed(OpportunityRecord),
    /// This exact snapshot was already analysed.
    Unchanged,
    /// A newer snapshot of the listing was analysed first; nothing stored.
    Superseded,
}

/// Sending side of the analysis queue.
#[derive(Clone)]
pub struct AnalysisHandle {
    tx: mpsc::Sender<ListingSnapshot>,
}

impl AnalysisHandle {
    /// Bounded queue between the orchestrator and the analysis pool.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ListingSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a snapshot, waiting for room. Returns false if the pool is gone.
    pub async fn submit(&self, snapshot: ListingSnapshot) -> bool {
        self.tx.send(snapshot).await.is_ok()
    }
}

/// Scores changed snapshots with the external predictor and shipping estimator.
#[derive(Clone)]
pub struct AnalysisStage<V, H, O>
where
    V: ValuePredictor,
    H: ShippingEstimator,
    O: OpportunityStore,
{
    predictor: V,
    shipping: H,
    store: O,
    config: Arc<AnalysisConfig>,
}

impl<V, H, O> AnalysisStage<V, H, O>
where
    V: ValuePredictor,
    H: ShippingEstimator,
    O: OpportunityStore,
{
    pub fn new(predictor: V, shipping: H, store: O, config: AnalysisConfig) -> Self {
        Self {
            predictor,
            shipping,
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    pub async fn analyze(&self, snapshot: &ListingSnapshot) -> Result<AnalysisOutcome, AppError> {
        let key = snapshot.listing.key();
        let last = self.store.last_analyzed_hash(&key).await?;
        if last.as_deref() == Some(snapshot.content_hash.as_str()) {
            return Ok(AnalysisOutcome::Unchanged);
        }

        let listing_cost = snapshot.number("price").ok_or_else(|| {
            AppError::AnalysisUnavailable(format!("{key}: snapshot has no numeric price"))
        })?;

        let (predicted, shipping) = tokio::join!(
            self.predictor.predict_value(&snapshot.fields),
            self.shipping.estimate_shipping_cost(&snapshot.fields),
        );
        let predicted_value = finite(predicted, "price prediction", &key)?;
        let shipping_cost = finite(shipping, "shipping estimate", &key)?;

        let fees = self.config.fees(listing_cost, predicted_value);
        let total_cost = listing_cost + fees + shipping_cost;
        let record = OpportunityRecord {
            id: Uuid::new_v4(),
            listing: snapshot.listing.clone(),
            snapshot_hash: snapshot.content_hash.clone(),
            snapshot_fetched_at: snapshot.fetched_at,
            predicted_value,
            listing_cost,
            fees,
            shipping_cost,
            total_cost,
            margin: predicted_value - total_cost,
            computed_at: Utc::now(),
        };

        let emit = record.margin >= self.config.margin_threshold;
        let stored = if emit {
            self.store.publish(&record).await?
        } else {
            self.store.suppress(&record).await?
        };
        if !stored {
            tracing::debug!(
                listing = %key,
                hash = %&record.snapshot_hash[..8],
                "Analysis superseded by a newer snapshot"
            );
            return Ok(AnalysisOutcome::Superseded);
        }

        if emit {
            tracing::info!(
                listing = %key,
                margin = record.margin,
                predicted_value = record.predicted_value,
                total_cost = record.total_cost,
                "Opportunity emitted"
            );
            Ok(AnalysisOutcome::Emitted(record))
        } else {
            tracing::debug!(listing = %key, margin = record.margin, "Opportunity suppressed");
            Ok(AnalysisOutcome::Suppressed(record))
        }
    }

    /// Analyse snapshots from `rx` with up to `workers` in parallel.
    ///
    /// On cancellation, snapshots already queued are still analysed before
    /// returning. Also returns once every sender is gone.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<ListingSnapshot>,
        cancel: CancellationToken,
    ) -> Result<(), AppError>
    where
        V: 'static,
        H: 'static,
        O: 'static,
    {
        let slots = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut in_flight = JoinSet::new();
        tracing::info!(workers = self.config.workers, "Analysis stage started");

        let mut closed = false;
        loop {
            let snapshot = tokio::select! {
                next = rx.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
                () = cancel.cancelled(), if !closed => {
                    // Stop accepting; buffered snapshots are still received.
                    rx.close();
                    closed = true;
                    continue;
                }
            };
            self.spawn(&mut in_flight, &slots, snapshot).await?;

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Analysis task panicked");
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!("Analysis stage stopped");
        Ok(())
    }

    async fn spawn(
        &self,
        in_flight: &mut JoinSet<()>,
        slots: &Arc<Semaphore>,
        snapshot: ListingSnapshot,
    ) -> Result<(), AppError>
    where
        V: 'static,
        H: 'static,
        O: 'static,
    {
        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Generic(format!("analysis pool closed: {e}")))?;
        let stage = self.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let key = snapshot.listing.key();
            match stage.analyze(&snapshot).await {
                Ok(_) => {}
                Err(AppError::AnalysisUnavailable(reason)) => {
                    tracing::warn!(listing = %key, %reason, "Analysis unavailable, deferred to next change");
                }
                Err(e) => {
                    tracing::error!(listing = %key, error = %e, "Analysis failed");
                }
            }
        });
        Ok(())
    }
}

fn finite(result: Result<f64, AppError>, what: &str, key: &ListingKey) -> Result<f64, AppError> {
    match result {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(v) => Err(AppError::AnalysisUnavailable(format!(
            "{key}: {what} returned non-finite value {v}"
        ))),
        Err(e) => Err(AppError::AnalysisUnavailable(format!("{key}: {what} failed: {e}"))),
    }
}

/// Shipping cost from the listing itself, or a flat rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatRateShipping {
    pub flat_cost: f64,
}

impl FlatRateShipping {
    pub fn new(flat_cost: f64) -> Self {
        Self { flat_cost }
    }
}

impl ShippingEstimator for FlatRateShipping {
    async fn estimate_shipping_cost(&self, fields: &Fields) -> Result<f64, AppError> {
        Ok(field_number(fields, "shipping_cost").unwrap_or(self.flat_cost))
    }
}

#[derive(Debug, Clone)]
struct StoredOpportunity {
    record: OpportunityRecord,
    suppressed: bool,
}

/// Current opportunity per listing, held in process memory.
#[derive(Clone, Default)]
pub struct MemoryOpportunityStore {
    records: Arc<Mutex<HashMap<ListingKey, StoredOpportunity>>>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&self, record: &OpportunityRecord, suppressed: bool) -> bool {
        let mut records = lock_or_recover(&self.records, "opportunities");
        let key = record.listing.key();
        if records
            .get(&key)
            .is_some_and(|s| s.record.snapshot_fetched_at > record.snapshot_fetched_at)
        {
            return false;
        }
        records.insert(
            key,
            StoredOpportunity {
                record: record.clone(),
                suppressed,
            },
        );
        true
    }
}

impl OpportunityStore for MemoryOpportunityStore {
    async fn publish(&self, record: &OpportunityRecord) -> Result<bool, AppError> {
        Ok(self.put(record, false))
    }

    async fn suppress(&self, record: &OpportunityRecord) -> Result<bool, AppError> {
        Ok(self.put(record, true))
    }

    async fn last_analyzed_hash(&self, listing: &ListingKey) -> Result<Option<String>, AppError> {
        Ok(lock_or_recover(&self.records, "opportunities")
            .get(listing)
            .map(|s| s.record.snapshot_hash.clone()))
    }

    async fn since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OpportunityRecord>, AppError> {
        let records = lock_or_recover(&self.records, "opportunities");
        let mut emitted: Vec<_> = records
            .values()
            .filter(|s| !s.suppressed && s.record.computed_at > since)
            .map(|s| s.record.clone())
            .collect();
        emitted.sort_by(|a, b| a.computed_at.cmp(&b.computed_at));
        emitted.truncate(limit);
        Ok(emitted)
    }

    async fn suppressed(&self, limit: usize) -> Result<Vec<OpportunityRecord>, AppError> {
        let records = lock_or_recover(&self.records, "opportunities");
        let mut suppressed: Vec<_> = records
            .values()
            .filter(|s| s.suppressed)
            .map(|s| s.record.clone())
            .collect();
        suppressed.sort_by(|a, b| b.computed_at.cmp(&a.computed_at));
        suppressed.truncate(limit);
        Ok(suppressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn stage(
        predictor: MockPredictor,
        shipping: MockShipping,
    ) -> AnalysisStage<MockPredictor, MockShipping, MemoryOpportunityStore> {
        AnalysisStage::new(
            predictor,
            shipping,
            MemoryOpportunityStore::new(),
            AnalysisConfig::default(),
        )
    }

    fn snapshot(id: &str, price: f64) -> ListingSnapshot {
        ListingSnapshot::new(test_listing(id), test_fields("Camera", price), 256)
    }

    #[tokio::test]
    async fn emits_record_above_threshold() {
        let s = stage(MockPredictor::value(200.0), MockShipping::cost(10.0));
        let outcome = s.analyze(&snapshot("1", 100.0)).await.unwrap();

        let AnalysisOutcome::Emitted(record) = outcome else {
            panic!("expected an emitted record");
        };
        // fees = 100 * 0.15 + 200 * 0.13 = 41
        assert!((record.fees - 41.0).abs() < 1e-9);
        assert!((record.total_cost - 151.0).abs() < 1e-9);
        assert!((record.margin - 49.0).abs() < 1e-9);
        assert_eq!(record.listing_cost, 100.0);

        let emitted = s.store().since(Utc::now() - TimeDelta::minutes(1), 10).await.unwrap();
        assert_eq!(emitted.len(), 1);
    }

    #[tokio::test]
    async fn suppresses_low_margin_but_keeps_it_observable() {
        let s = stage(MockPredictor::value(110.0), MockShipping::cost(10.0));
        let outcome = s.analyze(&snapshot("1", 100.0)).await.unwrap();
        assert!(matches!(outcome, AnalysisOutcome::Suppressed(_)));

        let since = Utc::now() - TimeDelta::minutes(1);
        assert!(s.store().since(since, 10).await.unwrap().is_empty());
        assert_eq!(s.store().suppressed(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_snapshot_is_not_rescored() {
        let predictor = MockPredictor::value(200.0);
        let s = stage(predictor.clone(), MockShipping::cost(0.0));
        let snap = snapshot("1", 50.0);

        assert!(matches!(s.analyze(&snap).await.unwrap(), AnalysisOutcome::Emitted(_)));
        assert_eq!(s.analyze(&snap).await.unwrap(), AnalysisOutcome::Unchanged);
        assert_eq!(predictor.call_count(), 1);
    }

    #[tokio::test]
    async fn changed_snapshot_supersedes_previous_record() {
        let s = stage(MockPredictor::value(200.0), MockShipping::cost(0.0));
        s.analyze(&snapshot("1", 50.0)).await.unwrap();
        let second = snapshot("1", 60.0);
        s.analyze(&second).await.unwrap();

        let all = s.store().since(Utc::now() - TimeDelta::minutes(1), 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].snapshot_hash, second.content_hash);
        assert_eq!(all[0].listing_cost, 60.0);
    }

    #[tokio::test]
    async fn late_analysis_of_older_snapshot_does_not_overwrite() {
        let s = stage(MockPredictor::value(200.0), MockShipping::cost(0.0));
        let older = ListingSnapshot::fetched(
            test_listing("1"),
            test_fields("Camera", 50.0),
            256,
            Utc::now() - TimeDelta::minutes(5),
        );
        let newer = snapshot("1", 60.0);

        // The newer snapshot's analysis finishes first.
        assert!(matches!(s.analyze(&newer).await.unwrap(), AnalysisOutcome::Emitted(_)));
        assert_eq!(s.analyze(&older).await.unwrap(), AnalysisOutcome::Superseded);

        let key = newer.listing.key();
        assert_eq!(
            s.store().last_analyzed_hash(&key).await.unwrap(),
            Some(newer.content_hash.clone())
        );
        let all = s.store().since(Utc::now() - TimeDelta::minutes(1), 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].listing_cost, 60.0);
    }

    #[tokio::test]
    async fn memory_store_keeps_newest_snapshot_record() {
        let store = MemoryOpportunityStore::new();
        let now = Utc::now();
        let record = |hash: &str, fetched_at: DateTime<Utc>| OpportunityRecord {
            id: Uuid::new_v4(),
            listing: test_listing("1"),
            snapshot_hash: hash.to_string(),
            snapshot_fetched_at: fetched_at,
            predicted_value: 100.0,
            listing_cost: 10.0,
            fees: 0.0,
            shipping_cost: 0.0,
            total_cost: 10.0,
            margin: 90.0,
            computed_at: now,
        };

        assert!(store.publish(&record("new", now)).await.unwrap());
        assert!(!store.suppress(&record("old", now - TimeDelta::seconds(30))).await.unwrap());
        assert!(store.publish(&record("same-time", now)).await.unwrap());

        let key = test_listing("1").key();
        assert_eq!(
            store.last_analyzed_hash(&key).await.unwrap().as_deref(),
            Some("same-time")
        );
        assert!(store.suppressed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scorer_failure_is_analysis_unavailable_and_not_recorded() {
        let s = stage(MockPredictor::failing("model offline"), MockShipping::cost(5.0));
        let snap = snapshot("1", 50.0);

        let err = s.analyze(&snap).await.unwrap_err();
        assert!(matches!(err, AppError::AnalysisUnavailable(_)));
        assert!(
            s.store()
                .last_analyzed_hash(&snap.listing.key())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn non_finite_prediction_is_unavailable() {
        let s = stage(MockPredictor::value(f64::NAN), MockShipping::cost(5.0));
        let err = s.analyze(&snapshot("1", 50.0)).await.unwrap_err();
        assert!(matches!(err, AppError::AnalysisUnavailable(_)));
    }

    #[tokio::test]
    async fn shipping_failure_is_unavailable() {
        let s = stage(MockPredictor::value(100.0), MockShipping::failing("carrier down"));
        let err = s.analyze(&snapshot("1", 50.0)).await.unwrap_err();
        assert!(err.to_string().contains("shipping estimate failed"));
    }

    #[tokio::test]
    async fn flat_rate_prefers_listing_shipping_field() {
        let flat = FlatRateShipping::new(12.0);
        let mut fields = test_fields("Camera", 10.0);
        assert_eq!(flat.estimate_shipping_cost(&fields).await.unwrap(), 12.0);

        fields.insert("shipping_cost".to_string(), json!("4.50"));
        assert_eq!(flat.estimate_shipping_cost(&fields).await.unwrap(), 4.5);
    }

    #[test]
    fn config_validation() {
        assert!(AnalysisConfig::default().validate().is_ok());
        let bad = AnalysisConfig {
            platform_fee_rate: -0.1,
            ..AnalysisConfig::default()
        };
        assert!(bad.validate().is_err());
        let no_workers = AnalysisConfig {
            workers: 0,
            ..AnalysisConfig::default()
        };
        assert!(no_workers.validate().is_err());
    }

    #[tokio::test]
    async fn run_drains_queue_after_cancel() {
        let predictor = MockPredictor::value(500.0);
        let s = stage(predictor.clone(), MockShipping::cost(0.0));
        let (handle, rx) = AnalysisHandle::channel(8);
        for i in 0..5 {
            assert!(handle.submit(snapshot(&i.to_string(), 10.0)).await);
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        s.run(rx, cancel).await.unwrap();

        assert_eq!(predictor.call_count(), 5);
        assert!(!handle.submit(snapshot("late", 10.0)).await);
    }

    #[tokio::test]
    async fn run_returns_when_senders_are_gone() {
        let s = stage(MockPredictor::value(500.0), MockShipping::cost(0.0));
        let (handle, rx) = AnalysisHandle::channel(8);
        handle.submit(snapshot("1", 10.0)).await;
        drop(handle);

        s.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(s.store().since(Utc::now() - TimeDelta::minutes(1), 10).await.unwrap().len(), 1);
    }
}
