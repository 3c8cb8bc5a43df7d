use gavel_core::models::ListingSnapshot;
use gavel_core::testutil::{test_fields, test_listing};
use gavel_core::traits::SnapshotStore;
use gavel_db::SnapshotRepository;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn first_snapshot_is_stored() {
    let (pool, _container) = setup_test_db().await;
    let repo = SnapshotRepository::new(pool);

    let snapshot = ListingSnapshot::new(test_listing("1"), test_fields("Lamp", 20.0), 512);
    let outcome = repo.put_if_changed(&snapshot).await.unwrap();
    assert!(outcome.stored);

    let stored = repo.get(&snapshot.listing.key()).await.unwrap().unwrap();
    assert_eq!(stored.content_hash, snapshot.content_hash);
    assert_eq!(stored.fields, snapshot.fields);
    assert_eq!(stored.raw_size, 512);
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn unchanged_content_is_not_rewritten() {
    let (pool, _container) = setup_test_db().await;
    let repo = SnapshotRepository::new(pool);

    let first = ListingSnapshot::new(test_listing("1"), test_fields("Lamp", 20.0), 512);
    repo.put_if_changed(&first).await.unwrap();

    let again = ListingSnapshot::new(test_listing("1"), test_fields("Lamp", 20.0), 600);
    let outcome = repo.put_if_changed(&again).await.unwrap();
    assert!(!outcome.stored);

    let stored = repo.get(&first.listing.key()).await.unwrap().unwrap();
    assert_eq!(stored.raw_size, 512);
}

#[tokio::test]
async fn changed_content_replaces_snapshot() {
    let (pool, _container) = setup_test_db().await;
    let repo = SnapshotRepository::new(pool);

    let first = ListingSnapshot::new(test_listing("1"), test_fields("Lamp", 20.0), 512);
    repo.put_if_changed(&first).await.unwrap();

    let changed = ListingSnapshot::new(test_listing("1"), test_fields("Lamp", 35.0), 512);
    assert!(repo.put_if_changed(&changed).await.unwrap().stored);

    let stored = repo.get(&first.listing.key()).await.unwrap().unwrap();
    assert_eq!(stored.content_hash, changed.content_hash);
    assert_eq!(stored.number("price"), Some(35.0));
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_identical_writes_store_once() {
    let (pool, _container) = setup_test_db().await;
    let repo = SnapshotRepository::new(pool);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let snapshot = ListingSnapshot::new(test_listing("1"), test_fields("Lamp", 20.0), 10);
            repo.put_if_changed(&snapshot).await.unwrap().stored
        }));
    }

    let mut stored = 0;
    for handle in handles {
        if handle.await.unwrap() {
            stored += 1;
        }
    }
    assert_eq!(stored, 1);
}
