use std::collections::HashSet;
use std::time::Duration;

use argus_core::error::{AppError, FailureKind};
use argus_core::models::{ExtractionResult, NewResult, ProductFields, StrategyKind};
use argus_core::task::{EnqueueOutcome, EnqueueRequest, FailOutcome, RetryConfig, TaskFailure, TaskStatus};
use argus_core::task_store::{StoreConfig, TaskStore};
use argus_db::{ResultRepository, TaskRepository};
use sqlx::PgPool;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn store_config(retry_delay: Duration) -> StoreConfig {
    StoreConfig {
        freshness_window: Duration::from_secs(3600),
        default_max_attempts: 3,
        retry: RetryConfig {
            base_delay: retry_delay,
            max_delay: retry_delay,
            jitter: false,
        },
    }
}

fn repo(pool: PgPool) -> TaskRepository {
    TaskRepository::new(pool, store_config(Duration::from_secs(60)))
}

async fn enqueue(repo: &TaskRepository, request: EnqueueRequest) -> argus_core::task::Task {
    match repo.enqueue(request).await.unwrap() {
        EnqueueOutcome::Created(task) => task,
        other => panic!("expected a new task, got {other:?}"),
    }
}

async fn save_result(pool: &PgPool, task_id: Uuid) -> Uuid {
    ResultRepository::new(pool.clone())
        .save(&NewResult {
            task_id,
            url: "https://shop.example/p/1".into(),
            canonical_link: None,
            result: ExtractionResult {
                strategy_used: StrategyKind::StructuredData,
                confidence: 0.9,
                fields: ProductFields {
                    title: Some("Widget".into()),
                    price: Some(10.0),
                    ..Default::default()
                },
                fallback_count: 0,
            },
            content_hash: "0".repeat(64),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn enqueue_creates_pending_task_with_canonical_url() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);

    let task = enqueue(
        &repo,
        EnqueueRequest::new("HTTPS://Shop.Example/p/1/?utm_source=ad&b=2&a=1").with_priority(7),
    )
    .await;

    assert_eq!(task.url, "https://shop.example/p/1?a=1&b=2");
    assert_eq!(task.domain, "shop.example");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, 7);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.max_attempts, 3);
    assert!(task.worker_id.is_none());
}

#[tokio::test]
async fn duplicate_within_window_is_skipped() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);

    enqueue(&repo, EnqueueRequest::new("https://shop.example/p/1")).await;
    let second = repo
        .enqueue(EnqueueRequest::new("https://shop.example/p/1/?fbclid=xyz"))
        .await
        .unwrap();

    assert!(matches!(second, EnqueueOutcome::DuplicateSkipped { .. }));
    let entry = repo
        .dedup_entry("https://shop.example/p/1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.visit_count, 2);
    assert_eq!(repo.counts().await.unwrap().total(), 1);
}

#[tokio::test]
async fn active_task_blocks_duplicate_even_outside_window() {
    let (pool, _container) = setup_test_db().await;
    let mut config = store_config(Duration::from_secs(60));
    config.freshness_window = Duration::ZERO;
    let repo = TaskRepository::new(pool, config);

    let first = enqueue(&repo, EnqueueRequest::new("https://shop.example/p/1")).await;
    let again = repo
        .enqueue(EnqueueRequest::new("https://shop.example/p/1"))
        .await
        .unwrap();
    assert!(!again.is_created());

    // Once the first task is terminal, the URL may be enqueued again.
    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    let outcome = repo
        .mark_failed(first.id, &TaskFailure::new(FailureKind::InvalidInput, "robots"))
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Exhausted);

    let third = repo
        .enqueue(EnqueueRequest::new("https://shop.example/p/1"))
        .await
        .unwrap();
    assert!(third.is_created());
}

#[tokio::test]
async fn concurrent_enqueues_create_one_task() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move {
                repo.enqueue(EnqueueRequest::new("https://shop.example/p/race"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap().is_created() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(repo.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn claim_respects_priority_then_fifo() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);

    let low = enqueue(&repo, EnqueueRequest::new("https://a.example/1").with_priority(1)).await;
    let high_first = enqueue(&repo, EnqueueRequest::new("https://a.example/2").with_priority(9)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high_second = enqueue(&repo, EnqueueRequest::new("https://a.example/3").with_priority(9)).await;

    let order: Vec<Uuid> = [
        repo.claim_next("w-1", &[]).await.unwrap().unwrap(),
        repo.claim_next("w-1", &[]).await.unwrap().unwrap(),
        repo.claim_next("w-1", &[]).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|t| t.id)
    .collect();

    assert_eq!(order, vec![high_first.id, high_second.id, low.id]);
    assert!(repo.claim_next("w-1", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_sets_leased_and_worker() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    enqueue(&repo, EnqueueRequest::new("https://shop.example/p/1")).await;

    let claimed = repo
        .claim_next("worker-1", &[])
        .await
        .unwrap()
        .expect("Should claim the task");

    assert_eq!(claimed.status, TaskStatus::Leased);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn claim_skips_excluded_domains() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    enqueue(&repo, EnqueueRequest::new("https://busy.example/p").with_priority(9)).await;
    let idle = enqueue(&repo, EnqueueRequest::new("https://idle.example/p")).await;

    let claimed = repo
        .claim_next("w-1", &["busy.example".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, idle.id);
    assert!(repo
        .claim_next("w-1", &["busy.example".to_string()])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_claims_never_share_a_task() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    for i in 0..20 {
        enqueue(&repo, EnqueueRequest::new(format!("https://s{i}.example/p"))).await;
    }

    let handles: Vec<_> = (0..8)
        .map(|w| {
            let repo = repo.clone();
            tokio::spawn(async move {
                let worker = format!("w-{w}");
                let mut ids = Vec::new();
                while let Some(task) = repo.claim_next(&worker, &[]).await.unwrap() {
                    ids.push(task.id);
                }
                ids
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
async fn lifecycle_to_completed() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool.clone());
    let task = enqueue(&repo, EnqueueRequest::new("https://shop.example/p/1")).await;

    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    repo.mark_running(task.id).await.unwrap();
    let result_id = save_result(&pool, task.id).await;
    repo.mark_completed(task.id, result_id).await.unwrap();

    let done = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result_id, Some(result_id));
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.worker_id.is_none());

    // Terminal states are final.
    let err = repo.mark_running(task.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn transitions_are_checked() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    let task = enqueue(&repo, EnqueueRequest::new("https://shop.example/p/1")).await;

    let err = repo.mark_completed(task.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { ref from, .. } if from == "pending"));

    let err = repo.mark_running(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = repo
        .mark_failed(task.id, &TaskFailure::new(FailureKind::Transient, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn failure_schedules_backoff_then_exhausts() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    let task = enqueue(
        &repo,
        EnqueueRequest::new("https://shop.example/p/1").with_max_attempts(2),
    )
    .await;

    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    let failure = TaskFailure::new(FailureKind::Transient, "timeout");
    let outcome = repo.mark_failed(task.id, &failure).await.unwrap();
    let FailOutcome::RetryScheduled { not_before } = outcome else {
        panic!("expected a retry, got {outcome:?}");
    };
    assert!(not_before > chrono::Utc::now());

    let pending = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(pending.status, TaskStatus::Pending);
    assert_eq!(pending.attempts, 1);
    assert_eq!(pending.error_kind, Some(FailureKind::Transient));
    assert_eq!(pending.last_error.as_deref(), Some("timeout"));
    // Not claimable before its backoff elapses.
    assert!(repo.claim_next("w-1", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn attempts_never_exceed_max() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool, store_config(Duration::ZERO));
    let task = enqueue(
        &repo,
        EnqueueRequest::new("https://shop.example/p/1").with_max_attempts(2),
    )
    .await;
    let failure = TaskFailure::new(FailureKind::Transient, "connection reset");

    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    assert!(matches!(
        repo.mark_failed(task.id, &failure).await.unwrap(),
        FailOutcome::RetryScheduled { .. }
    ));
    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    assert_eq!(
        repo.mark_failed(task.id, &failure).await.unwrap(),
        FailOutcome::Exhausted
    );

    let failed = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert!(repo.claim_next("w-1", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn no_extractable_data_gets_one_confirmation_retry() {
    let (pool, _container) = setup_test_db().await;
    let repo = TaskRepository::new(pool, store_config(Duration::ZERO));
    let task = enqueue(
        &repo,
        EnqueueRequest::new("https://shop.example/p/1").with_max_attempts(5),
    )
    .await;
    let failure = TaskFailure::new(FailureKind::PermanentContent, "no product data")
        .with_strategy(Some(StrategyKind::OcrFallback));

    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    assert!(matches!(
        repo.mark_failed(task.id, &failure).await.unwrap(),
        FailOutcome::RetryScheduled { .. }
    ));
    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    assert_eq!(
        repo.mark_failed(task.id, &failure).await.unwrap(),
        FailOutcome::Exhausted
    );

    let failed = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.failed_strategy, Some(StrategyKind::OcrFallback));
    assert_eq!(failed.error_kind, Some(FailureKind::PermanentContent));
}

#[tokio::test]
async fn release_keeps_attempts_and_honours_not_before() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    let task = enqueue(&repo, EnqueueRequest::new("https://shop.example/p/1")).await;

    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    let later = chrono::Utc::now() + chrono::TimeDelta::minutes(5);
    repo.release(task.id, Some(later)).await.unwrap();

    let released = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.attempts, 0);
    assert!(released.worker_id.is_none());
    assert!(repo.claim_next("w-2", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn release_worker_tasks_only_touches_that_worker() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    enqueue(&repo, EnqueueRequest::new("https://a.example/1")).await;
    enqueue(&repo, EnqueueRequest::new("https://a.example/2")).await;
    enqueue(&repo, EnqueueRequest::new("https://a.example/3")).await;

    let a = repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    repo.mark_running(a.id).await.unwrap();
    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    repo.claim_next("w-2", &[]).await.unwrap().unwrap();

    assert_eq!(repo.release_worker_tasks("w-1").await.unwrap(), 2);
    let counts = repo.counts().await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.leased, 1);
}

#[tokio::test]
async fn recover_stale_returns_orphans() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    enqueue(&repo, EnqueueRequest::new("https://a.example/1")).await;
    repo.claim_next("crashed", &[]).await.unwrap().unwrap();

    assert_eq!(repo.recover_stale(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(repo.recover_stale(Duration::from_millis(1)).await.unwrap(), 1);
    assert_eq!(repo.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn get_by_url_list_and_counts() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    let first = enqueue(&repo, EnqueueRequest::new("https://a.example/1")).await;
    enqueue(&repo, EnqueueRequest::new("https://a.example/2")).await;
    enqueue(&repo, EnqueueRequest::new("https://a.example/3")).await;
    repo.claim_next("w-1", &[]).await.unwrap().unwrap();

    let found = repo
        .get_by_url("https://A.example/1/?utm_campaign=x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);

    let pending = repo.list(Some(TaskStatus::Pending), 10, 0).await.unwrap();
    assert_eq!(pending.len(), 2);
    let page = repo.list(None, 2, 1).await.unwrap();
    assert_eq!(page.len(), 2);

    let counts = repo.counts().await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.leased, 1);
    assert_eq!(counts.total(), 3);
}

#[tokio::test]
async fn purge_removes_only_old_terminal_tasks() {
    let (pool, _container) = setup_test_db().await;
    let repo = repo(pool);
    let task = enqueue(&repo, EnqueueRequest::new("https://a.example/1")).await;
    enqueue(&repo, EnqueueRequest::new("https://a.example/2")).await;

    repo.claim_next("w-1", &[]).await.unwrap().unwrap();
    repo.mark_failed(task.id, &TaskFailure::new(FailureKind::InvalidInput, "bad"))
        .await
        .unwrap();

    assert_eq!(repo.purge_terminal(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(repo.purge_terminal(Duration::from_millis(1)).await.unwrap(), 1);
    assert!(repo.get(task.id).await.unwrap().is_none());
    assert_eq!(repo.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn expired_dedup_entries_are_evicted() {
    let (pool, _container) = setup_test_db().await;
    let mut config = store_config(Duration::from_secs(60));
    config.freshness_window = Duration::from_millis(500);
    let repo = TaskRepository::new(pool, config);
    enqueue(&repo, EnqueueRequest::new("https://a.example/1")).await;

    assert_eq!(repo.evict_expired_dedup().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(repo.evict_expired_dedup().await.unwrap(), 1);
    assert!(repo.dedup_entry("https://a.example/1").await.unwrap().is_none());
    // The task itself is untouched.
    assert_eq!(repo.counts().await.unwrap().pending, 1);
}
