use chrono::{TimeDelta, Utc};
use gavel_core::error::{AppError, ErrorKind, FetchError};
use gavel_core::job::{JobState, NewFetchJob};
use gavel_core::job_queue::{JobQueue, RetrySchedule};
use gavel_core::testutil::test_listing;
use gavel_db::FetchJobRepository;

use crate::integration::common::setup_test_db;

fn retry_in(secs: i64, priority_delta: i32) -> Option<RetrySchedule> {
    Some(RetrySchedule {
        not_before: Utc::now() + TimeDelta::seconds(secs),
        priority_delta,
    })
}

#[tokio::test]
async fn enqueue_persists_pending_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let job = repo
        .enqueue(NewFetchJob::new(test_listing("42")).with_priority(10))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.priority, 10);
    assert_eq!(job.listing.external_id, "42");
    assert!(job.worker_id.is_none());

    let fetched = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.listing, job.listing);
}

#[tokio::test]
async fn claim_prefers_priority_and_sets_worker() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    repo.enqueue(NewFetchJob::new(test_listing("low"))).await.unwrap();
    let high = repo
        .enqueue(NewFetchJob::new(test_listing("high")).with_priority(10))
        .await
        .unwrap();

    let claimed = repo
        .claim_next("worker-1", Utc::now())
        .await
        .unwrap()
        .expect("Should claim a job");

    assert_eq!(claimed.id, high.id);
    assert_eq!(claimed.state, JobState::Dispatched);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn future_jobs_are_not_claimed() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    repo.enqueue(
        NewFetchJob::new(test_listing("later")).with_not_before(Utc::now() + TimeDelta::minutes(5)),
    )
    .await
    .unwrap();

    assert!(repo.claim_next("w1", Utc::now()).await.unwrap().is_none());
    assert!(
        repo.claim_next("w1", Utc::now() + TimeDelta::minutes(6))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn duplicate_listing_is_dispatched_once() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    repo.enqueue(NewFetchJob::new(test_listing("dup"))).await.unwrap();
    repo.enqueue(NewFetchJob::new(test_listing("dup"))).await.unwrap();

    let first = repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    assert!(repo.claim_next("w2", Utc::now()).await.unwrap().is_none());

    repo.mark_succeeded(first.id).await.unwrap();
    let second = repo.claim_next("w2", Utc::now()).await.unwrap().unwrap();
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn concurrent_claims_never_double_dispatch() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    for _ in 0..5 {
        repo.enqueue(NewFetchJob::new(test_listing("dup"))).await.unwrap();
    }
    repo.enqueue(NewFetchJob::new(test_listing("other"))).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.claim_next(&format!("w{i}"), Utc::now()).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed.push(job.listing.external_id);
        }
    }
    let total = claimed.len();
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), total, "a listing was dispatched twice");
    assert_eq!(
        repo.count_by_state(JobState::Dispatched).await.unwrap() as usize,
        total
    );
}

#[tokio::test]
async fn retry_then_dead_letter() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let job = repo.enqueue(NewFetchJob::new(test_listing("1"))).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();

    let retried = repo
        .fail_job(job.id, &FetchError::transient("HTTP 503"), retry_in(0, 1))
        .await
        .unwrap();
    assert_eq!(retried.state, JobState::RetryScheduled);
    assert_eq!(retried.attempt, 1);
    assert_eq!(retried.priority, 1);
    assert_eq!(retried.last_error, Some(ErrorKind::Transient));
    assert_eq!(retried.last_error_message.as_deref(), Some("HTTP 503"));
    assert!(retried.worker_id.is_none());

    let reclaimed = repo
        .claim_next("w1", Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job.id);

    let dead = repo
        .fail_job(job.id, &FetchError::blocked("HTTP 403"), None)
        .await
        .unwrap();
    assert_eq!(dead.state, JobState::DeadLettered);
    assert_eq!(dead.attempt, 2);
    assert_eq!(dead.last_error, Some(ErrorKind::Blocked));

    assert!(
        repo.claim_next("w1", Utc::now() + TimeDelta::hours(1))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn terminal_jobs_reject_transitions() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let job = repo.enqueue(NewFetchJob::new(test_listing("1"))).await.unwrap();

    let err = repo.mark_succeeded(job.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    repo.fail_job(job.id, &FetchError::not_found("HTTP 404"), None)
        .await
        .unwrap();

    let err = repo
        .fail_job(job.id, &FetchError::transient("again"), retry_in(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { ref from, .. } if from == "dead_lettered"));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let err = repo.mark_succeeded(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::JobNotFound(_)));
}

#[tokio::test]
async fn release_keeps_attempt_count() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    repo.enqueue(NewFetchJob::new(test_listing("1"))).await.unwrap();
    repo.enqueue(NewFetchJob::new(test_listing("2"))).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    repo.claim_next("w2", Utc::now()).await.unwrap().unwrap();

    let released = repo.release_worker_jobs("w1", Utc::now()).await.unwrap();
    assert_eq!(released, 1);

    let jobs = repo.list_jobs(Some(JobState::RetryScheduled), 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempt, 0);
    assert!(jobs[0].worker_id.is_none());
    assert_eq!(repo.count_by_state(JobState::Dispatched).await.unwrap(), 1);
}

#[tokio::test]
async fn has_active_tracks_non_terminal_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let listing = test_listing("1");

    assert!(!repo.has_active(&listing.key()).await.unwrap());
    let job = repo.enqueue(NewFetchJob::new(listing.clone())).await.unwrap();
    assert!(repo.has_active(&listing.key()).await.unwrap());

    repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    repo.mark_succeeded(job.id).await.unwrap();
    assert!(!repo.has_active(&listing.key()).await.unwrap());
    assert_eq!(repo.list_jobs(None, 10).await.unwrap().len(), 1);
}
