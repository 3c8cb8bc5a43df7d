use chrono::{DateTime, TimeDelta, Utc};
use gavel_core::models::OpportunityRecord;
use gavel_core::testutil::test_listing;
use gavel_core::traits::OpportunityStore;
use gavel_db::OpportunityRepository;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn record(id: &str, hash: &str, margin: f64, computed_at: DateTime<Utc>) -> OpportunityRecord {
    OpportunityRecord {
        id: Uuid::new_v4(),
        listing: test_listing(id),
        snapshot_hash: hash.to_string(),
        snapshot_fetched_at: computed_at,
        predicted_value: 200.0,
        listing_cost: 100.0,
        fees: 10.0,
        shipping_cost: 15.0,
        total_cost: 125.0,
        margin,
        computed_at,
    }
}

#[tokio::test]
async fn published_records_are_listed_oldest_first() {
    let (pool, _container) = setup_test_db().await;
    let repo = OpportunityRepository::new(pool);
    let base = Utc::now() - TimeDelta::minutes(10);

    repo.publish(&record("b", "h2", 75.0, base + TimeDelta::minutes(2)))
        .await
        .unwrap();
    repo.publish(&record("a", "h1", 75.0, base + TimeDelta::minutes(1)))
        .await
        .unwrap();

    let all = repo.since(base, 10).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.listing.external_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(all[0].total_cost, 125.0);

    let later = repo.since(base + TimeDelta::minutes(1), 10).await.unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].listing.external_id, "b");
}

#[tokio::test]
async fn suppressed_records_are_kept_apart() {
    let (pool, _container) = setup_test_db().await;
    let repo = OpportunityRepository::new(pool);
    let base = Utc::now() - TimeDelta::minutes(10);

    repo.suppress(&record("low", "h1", 5.0, base + TimeDelta::minutes(1)))
        .await
        .unwrap();

    assert!(repo.since(base, 10).await.unwrap().is_empty());
    let suppressed = repo.suppressed(10).await.unwrap();
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed[0].margin, 5.0);
    assert_eq!(
        repo.last_analyzed_hash(&test_listing("low").key())
            .await
            .unwrap()
            .as_deref(),
        Some("h1")
    );
}

#[tokio::test]
async fn new_analysis_supersedes_previous() {
    let (pool, _container) = setup_test_db().await;
    let repo = OpportunityRepository::new(pool);
    let base = Utc::now() - TimeDelta::minutes(10);

    repo.publish(&record("1", "h1", 75.0, base + TimeDelta::minutes(1)))
        .await
        .unwrap();
    repo.suppress(&record("1", "h2", 2.0, base + TimeDelta::minutes(2)))
        .await
        .unwrap();

    assert!(repo.since(base, 10).await.unwrap().is_empty());
    assert_eq!(
        repo.last_analyzed_hash(&test_listing("1").key())
            .await
            .unwrap()
            .as_deref(),
        Some("h2")
    );
    assert!(
        repo.last_analyzed_hash(&test_listing("2").key())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn record_from_older_snapshot_is_not_written_over_newer() {
    let (pool, _container) = setup_test_db().await;
    let repo = OpportunityRepository::new(pool);
    let base = Utc::now() - TimeDelta::minutes(10);

    let newer = record("1", "new", 75.0, base + TimeDelta::minutes(2));
    let mut older = record("1", "old", 90.0, base + TimeDelta::minutes(3));
    older.snapshot_fetched_at = base + TimeDelta::minutes(1);

    assert!(repo.publish(&newer).await.unwrap());
    assert!(!repo.publish(&older).await.unwrap());
    assert!(!repo.suppress(&older).await.unwrap());

    assert_eq!(
        repo.last_analyzed_hash(&test_listing("1").key())
            .await
            .unwrap()
            .as_deref(),
        Some("new")
    );
    let all = repo.since(base, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].margin, 75.0);
}
