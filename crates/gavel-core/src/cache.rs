//! In-memory snapshot store and the discovery freshness window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;

use crate::error::AppError;
use crate::models::{ListingKey, ListingSnapshot};
use crate::traits::{PutOutcome, SnapshotStore};
use crate::util::lock_or_recover;

/// Latest snapshot per listing, held in process memory.
///
/// The compare and the write happen under one lock, which makes
/// `put_if_changed` atomic per listing.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<ListingKey, ListingSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    async fn put_if_changed(&self, snapshot: &ListingSnapshot) -> Result<PutOutcome, AppError> {
        let key = snapshot.listing.key();
        let mut snapshots = lock_or_recover(&self.snapshots, "snapshots");
        let stored = match snapshots.get(&key) {
            Some(current) if current.content_hash == snapshot.content_hash => false,
            _ => {
                snapshots.insert(key, snapshot.clone());
                true
            }
        };
        Ok(PutOutcome { stored })
    }

    async fn get(&self, listing: &ListingKey) -> Result<Option<ListingSnapshot>, AppError> {
        Ok(lock_or_recover(&self.snapshots, "snapshots")
            .get(listing)
            .cloned())
    }

    async fn count(&self) -> Result<u64, AppError> {
        Ok(lock_or_recover(&self.snapshots, "snapshots").len() as u64)
    }
}

/// Listings that completed a fetch within the freshness window.
///
/// Shared by the orchestrator, which marks completions, and the discovery
/// scheduler, which skips fresh listings. A zero window disables the check.
#[derive(Clone)]
pub struct FreshnessCache {
    cache: Option<Cache<ListingKey, DateTime<Utc>>>,
}

impl FreshnessCache {
    pub fn new(window: Duration) -> Self {
        let cache = (!window.is_zero()).then(|| {
            Cache::builder()
                .time_to_live(window)
                .max_capacity(1_000_000)
                .build()
        });
        Self { cache }
    }

    pub async fn mark_completed(&self, listing: ListingKey) {
        if let Some(cache) = &self.cache {
            cache.insert(listing, Utc::now()).await;
        }
    }

    pub async fn completed_at(&self, listing: &ListingKey) -> Option<DateTime<Utc>> {
        match &self.cache {
            Some(cache) => cache.get(listing).await,
            None => None,
        }
    }

    pub async fn is_fresh(&self, listing: &ListingKey) -> bool {
        self.completed_at(listing).await.is_some()
    }
}
