// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the SQLite outbox store: claiming, acknowledgement, retries,
//! stale-claim recovery and retention.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::{TestContext, claim_of, new_vm_id, vm_created, vm_created_at};
use serde_json::json;
use stratus_outbox::{
    Claim, FailureOutcome, NewOutboxEvent, OutboxError, OutboxStatus, OutboxStore, RetryPolicy,
    SqliteTxContext,
};
use uuid::Uuid;

fn detached() -> SqliteTxContext {
    SqliteTxContext::detached()
}

#[tokio::test]
async fn test_enqueue_assigns_id_and_defaults() {
    let ctx = TestContext::new().await;
    let workspace_id = Uuid::new_v4();

    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1").with_workspace(workspace_id))
        .await
        .unwrap();

    assert_eq!(event.status, OutboxStatus::Pending);
    assert_eq!(event.retry_count, 0);
    assert_eq!(event.workspace_id, Some(workspace_id));
    assert!(event.last_error.is_none());
    assert!(event.claimed_at.is_none());
    assert!(event.published_at.is_none());
    assert!(event.available_at <= Utc::now());
}

#[tokio::test]
async fn test_enqueue_keeps_explicit_id() {
    let ctx = TestContext::new().await;
    let id = Uuid::new_v4();

    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1").with_id(id))
        .await
        .unwrap();
    assert_eq!(event.id, id);

    let duplicate = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1").with_id(id))
        .await;
    assert!(matches!(duplicate, Err(OutboxError::Database(_))));
}

#[tokio::test]
async fn test_enqueue_rejects_empty_topic() {
    let ctx = TestContext::new().await;

    let result = ctx
        .store
        .enqueue(&detached(), NewOutboxEvent::new("", "vm-created", json!({})))
        .await;

    assert!(matches!(result, Err(OutboxError::InvalidRequest(_))));
    assert_eq!(ctx.count_events().await, 0);
}

#[tokio::test]
async fn test_claim_batch_is_fifo_and_exclusive() {
    let ctx = TestContext::new().await;
    let base = Utc::now() - ChronoDuration::minutes(10);

    let mut ids = Vec::new();
    for i in 0..3 {
        let event = ctx
            .store
            .enqueue(
                &detached(),
                vm_created_at(&format!("vm-{i}"), base + ChronoDuration::seconds(i)),
            )
            .await
            .unwrap();
        ids.push(event.id);
    }

    let first = ctx.store.claim_batch(&detached(), 2).await.unwrap();
    assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), ids[..2].to_vec());
    for event in &first {
        assert_eq!(event.status, OutboxStatus::Processing);
        assert!(event.claimed_at.is_some());
    }

    let second = ctx.store.claim_batch(&detached(), 2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, ids[2]);

    assert!(ctx.store.claim_batch(&detached(), 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_batch_with_zero_limit_claims_nothing() {
    let ctx = TestContext::new().await;
    ctx.store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    assert!(ctx.store.claim_batch(&detached(), 0).await.unwrap().is_empty());
    assert_eq!(
        ctx.store.status_counts(&detached()).await.unwrap().pending,
        1
    );
}

#[tokio::test]
async fn test_concurrent_claims_never_overlap() {
    let ctx = TestContext::new().await;
    let total = 40;
    for _ in 0..total {
        ctx.store
            .enqueue(&detached(), vm_created(&new_vm_id()))
            .await
            .unwrap();
    }

    let store = Arc::new(ctx.store.clone());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_batch(&SqliteTxContext::detached(), 5).await
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        let batch = handle.await.unwrap().expect("Claim should succeed");
        claimed.extend(batch.into_iter().map(|e| e.id));
    }

    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), total);
    assert_eq!(unique.len(), total, "No event may be claimed twice");
}

#[tokio::test]
async fn test_mark_published_sets_published_at() {
    let ctx = TestContext::new().await;
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    assert!(claimed[0].claim_token.is_some());
    ctx.store
        .mark_published(&detached(), &claim_of(&claimed, event.id))
        .await
        .unwrap();

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Published);
    assert!(stored.published_at.is_some());
    assert!(stored.claimed_at.is_none());
    assert!(stored.claim_token.is_none());
}

#[tokio::test]
async fn test_duplicate_acknowledgement_is_rejected() {
    let ctx = TestContext::new().await;
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    // Not yet claimed.
    let unclaimed = Claim {
        id: event.id,
        token: Uuid::new_v4(),
        retry_count: 0,
    };
    let err = ctx
        .store
        .mark_published(&detached(), &unclaimed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OutboxError::InvalidTransition {
            expected: OutboxStatus::Processing,
            actual: OutboxStatus::Pending,
            ..
        }
    ));

    let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    let claim = claim_of(&claimed, event.id);
    ctx.store.mark_published(&detached(), &claim).await.unwrap();
    let first = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();

    let err = ctx
        .store
        .mark_published(&detached(), &claim)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OutboxError::InvalidTransition {
            actual: OutboxStatus::Published,
            ..
        }
    ));

    let second = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(first.published_at, second.published_at);

    let missing = Claim {
        id: Uuid::new_v4(),
        ..claim
    };
    let err = ctx
        .store
        .mark_published(&detached(), &missing)
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::EventNotFound(_)));
}

#[tokio::test]
async fn test_failures_are_bounded_by_max_retries() {
    let ctx = TestContext::new().await;
    let policy = RetryPolicy::immediate(3);
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    for attempt in 1..=3 {
        let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1, "attempt {attempt} should claim the event");

        let outcome = ctx
            .store
            .record_failure(&detached(), &claim_of(&claimed, event.id), "bus unavailable", &policy)
            .await
            .unwrap();
        assert_eq!(outcome.retry_count(), attempt);
        assert_eq!(outcome.is_dead_lettered(), attempt == 3);
    }

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(stored.last_error.as_deref(), Some("bus unavailable"));
    assert!(stored.published_at.is_none());

    assert!(ctx.store.claim_batch(&detached(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_backoff_delays_eligibility() {
    let ctx = TestContext::new().await;
    let policy = RetryPolicy {
        max_retries: 5,
        base_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(600),
    };
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();
    let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();

    let before = Utc::now();
    let outcome = ctx
        .store
        .record_failure(&detached(), &claim_of(&claimed, event.id), "timeout", &policy)
        .await
        .unwrap();

    let FailureOutcome::Retrying {
        retry_count,
        available_at,
    } = outcome
    else {
        panic!("Expected a retry, got {:?}", outcome);
    };
    assert_eq!(retry_count, 1);
    assert!(available_at >= before + ChronoDuration::seconds(59));
    assert!(available_at <= Utc::now() + ChronoDuration::seconds(61));

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert!(ctx.store.claim_batch(&detached(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_record_failure_requires_processing() {
    let ctx = TestContext::new().await;
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    let unclaimed = Claim {
        id: event.id,
        token: Uuid::new_v4(),
        retry_count: 0,
    };
    let err = ctx
        .store
        .record_failure(&detached(), &unclaimed, "boom", &RetryPolicy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::InvalidTransition { .. }));

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn test_mark_failed_dead_letters_immediately() {
    let ctx = TestContext::new().await;
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();
    let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();

    ctx.store
        .mark_failed(&detached(), &claim_of(&claimed, event.id), "topic rejected")
        .await
        .unwrap();

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("topic rejected"));
}

#[tokio::test]
async fn test_release_stale_processing() {
    let ctx = TestContext::new().await;
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();
    ctx.store.claim_batch(&detached(), 10).await.unwrap();

    let released = ctx
        .store
        .release_stale_processing(&detached(), Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(released, 0, "Fresh claims are not stale");

    let released = ctx
        .store
        .release_stale_processing(&detached(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(released, 1);

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.retry_count, 0, "Stale release is not a failed attempt");
    assert!(stored.claimed_at.is_none());
    assert!(stored.claim_token.is_none());

    let reclaimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, event.id);
}

#[tokio::test]
async fn test_released_claim_cannot_report_on_new_claim() {
    let ctx = TestContext::new().await;
    let policy = RetryPolicy::immediate(3);
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    let first = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    let stale = claim_of(&first, event.id);
    ctx.store
        .release_stale_processing(&detached(), Duration::ZERO)
        .await
        .unwrap();
    let second = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    let current = claim_of(&second, event.id);
    assert_ne!(stale.token, current.token);

    // The first holder wakes up and reports a failure it saw earlier.
    let err = ctx
        .store
        .record_failure(&detached(), &stale, "bus unavailable", &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::ClaimLost(id) if id == event.id));
    assert!(matches!(
        ctx.store.mark_failed(&detached(), &stale, "rejected").await,
        Err(OutboxError::ClaimLost(_))
    ));
    assert!(matches!(
        ctx.store.mark_published(&detached(), &stale).await,
        Err(OutboxError::ClaimLost(_))
    ));

    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Processing);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.last_error.is_none());

    // The current holder's acknowledgement still lands.
    ctx.store
        .mark_published(&detached(), &current)
        .await
        .unwrap();
    let stored = ctx.store.get(&detached(), event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Published);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn test_record_failure_follows_retry_policy() {
    let ctx = TestContext::new().await;
    let policy = RetryPolicy {
        max_retries: 3,
        base_backoff: Duration::from_secs(10),
        max_backoff: Duration::from_secs(15),
    };
    let event = ctx
        .store
        .enqueue(&detached(), vm_created("vm-1"))
        .await
        .unwrap();

    let mut delays = Vec::new();
    for _ in 0..3 {
        // Make the event claimable again regardless of its backoff.
        sqlx::query("UPDATE outbox_events SET available_at = 0")
            .execute(ctx.pool())
            .await
            .unwrap();
        let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
        let claim = claim_of(&claimed, event.id);

        let before = Utc::now();
        let outcome = ctx
            .store
            .record_failure(&detached(), &claim, "bus unavailable", &policy)
            .await
            .unwrap();
        assert_eq!(outcome.retry_count(), claim.retry_count + 1);
        assert_eq!(
            outcome.is_dead_lettered(),
            policy.is_exhausted(outcome.retry_count())
        );
        if let FailureOutcome::Retrying { available_at, .. } = outcome {
            delays.push((available_at - before).num_seconds());
        }
    }

    // 10s after the first failure, then capped at 15s.
    assert_eq!(delays.len(), 2);
    assert!((9..=10).contains(&delays[0]), "got {:?}", delays);
    assert!((14..=15).contains(&delays[1]), "got {:?}", delays);
}

#[tokio::test]
async fn test_delete_older_than_only_touches_published() {
    let ctx = TestContext::new().await;
    let policy = RetryPolicy::immediate(1);
    let old = Utc::now() - ChronoDuration::days(90);

    let published = ctx
        .store
        .enqueue(&detached(), vm_created_at("vm-published", old))
        .await
        .unwrap();
    let failed = ctx
        .store
        .enqueue(&detached(), vm_created_at("vm-failed", old + ChronoDuration::seconds(1)))
        .await
        .unwrap();

    let claimed = ctx.store.claim_batch(&detached(), 2).await.unwrap();
    ctx.store
        .mark_published(&detached(), &claim_of(&claimed, published.id))
        .await
        .unwrap();
    ctx.store
        .record_failure(&detached(), &claim_of(&claimed, failed.id), "poison", &policy)
        .await
        .unwrap();

    let pending = ctx
        .store
        .enqueue(&detached(), vm_created_at("vm-pending", old))
        .await
        .unwrap();
    let processing = ctx
        .store
        .enqueue(
            &detached(),
            vm_created_at("vm-processing", old - ChronoDuration::seconds(1)),
        )
        .await
        .unwrap();
    ctx.store.claim_batch(&detached(), 1).await.unwrap();

    // Nothing was published before this cutoff.
    let deleted = ctx
        .store
        .delete_older_than(&detached(), Utc::now() - ChronoDuration::days(1))
        .await
        .unwrap();
    assert_eq!(deleted, 0);

    let deleted = ctx
        .store
        .delete_older_than(&detached(), Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    assert!(ctx.store.get(&detached(), published.id).await.unwrap().is_none());
    for id in [failed.id, pending.id, processing.id] {
        assert!(
            ctx.store.get(&detached(), id).await.unwrap().is_some(),
            "Non-published events must survive retention"
        );
    }

    let again = ctx
        .store
        .delete_older_than(&detached(), Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_list_and_replay_failed() {
    let ctx = TestContext::new().await;
    let policy = RetryPolicy::immediate(1);
    let base = Utc::now() - ChronoDuration::minutes(5);

    let older = ctx
        .store
        .enqueue(&detached(), vm_created_at("vm-a", base))
        .await
        .unwrap();
    let newer = ctx
        .store
        .enqueue(&detached(), vm_created_at("vm-b", base + ChronoDuration::seconds(30)))
        .await
        .unwrap();

    let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    for id in [older.id, newer.id] {
        ctx.store
            .record_failure(&detached(), &claim_of(&claimed, id), "bus down", &policy)
            .await
            .unwrap();
    }

    let failed = ctx.store.list_failed(&detached(), 10).await.unwrap();
    assert_eq!(
        failed.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![newer.id, older.id]
    );
    assert_eq!(ctx.store.list_failed(&detached(), 1).await.unwrap().len(), 1);

    ctx.store.replay_failed(&detached(), older.id).await.unwrap();
    let replayed = ctx.store.get(&detached(), older.id).await.unwrap().unwrap();
    assert_eq!(replayed.status, OutboxStatus::Pending);
    assert_eq!(replayed.retry_count, 0);
    assert_eq!(replayed.last_error.as_deref(), Some("bus down"));

    let err = ctx
        .store
        .replay_failed(&detached(), older.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OutboxError::InvalidTransition {
            expected: OutboxStatus::Failed,
            actual: OutboxStatus::Pending,
            ..
        }
    ));

    let claimed = ctx.store.claim_batch(&detached(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, older.id);
}

#[tokio::test]
async fn test_status_counts() {
    let ctx = TestContext::new().await;
    for _ in 0..4 {
        ctx.store
            .enqueue(&detached(), vm_created(&new_vm_id()))
            .await
            .unwrap();
    }

    let claimed = ctx.store.claim_batch(&detached(), 2).await.unwrap();
    ctx.store
        .mark_published(&detached(), &claimed[0].claim().unwrap())
        .await
        .unwrap();

    let counts = ctx.store.status_counts(&detached()).await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.published, 1);
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.total(), 4);
}
