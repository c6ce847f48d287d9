//! Store contract tests, run against both backends.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentq::events::EventType;
use agentq::run::{Conversation, NewRun, RunError, RunStatus};
use agentq::store::{
    CancelOutcome, Finalized, Lease, MemoryStore, Outcome, Reclaimed, Renewal, SqliteStore, Store,
};
use agentq::RuntimeError;

const TTL: Duration = Duration::from_secs(30);
const SHORT_TTL: Duration = Duration::from_millis(50);
const PAST_SHORT_TTL: Duration = Duration::from_millis(150);

fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

fn sqlite_store(dir: &Path) -> Arc<dyn Store> {
    Arc::new(SqliteStore::open(dir.join("runs.db")).unwrap())
}

fn echo_run() -> NewRun {
    NewRun::from_messages("echo", &["hello"])
}

async fn claim(store: &Arc<dyn Store>, worker: &str, ttl: Duration) -> (agentq::run::Run, Lease) {
    let run = store
        .try_claim_next(&[], worker, ttl)
        .await
        .unwrap()
        .expect("a claimable run");
    let lease = Lease::for_run(&run).unwrap();
    (run, lease)
}

macro_rules! store_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    super::$name(super::memory_store()).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    let dir = tempfile::tempdir().unwrap();
                    super::$name(super::sqlite_store(dir.path())).await;
                }
            )*
        }
    };
}

store_tests!(
    test_claims_are_exclusive_under_contention,
    test_claims_oldest_run_first,
    test_claims_respect_agent_key_allowlist,
    test_stale_lease_is_fenced_after_reclaim,
    test_reclaim_without_attempts_left_fails_run,
    test_cancel_of_queued_run_is_immediate,
    test_cancel_of_running_run_is_flagged,
    test_expired_lease_with_pending_cancel_is_cancelled,
    test_events_are_ordered_and_end_with_terminal,
    test_idempotency_key_returns_existing_run,
    test_checkpoints_survive_requeue,
    test_transient_failure_requeues_with_backoff,
    test_transient_failure_exhausts_attempts,
    test_runs_group_by_conversation,
);

async fn test_claims_are_exclusive_under_contention(store: Arc<dyn Store>) {
    for i in 0..40 {
        store
            .create_run(NewRun::new("echo", json!({ "i": i })))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{}", w);
            let mut claimed = Vec::new();
            while let Some(run) = store.try_claim_next(&[], &worker, TTL).await.unwrap() {
                assert_eq!(run.status, RunStatus::Running);
                assert_eq!(run.lease_owner.as_deref(), Some(worker.as_str()));
                claimed.push(run.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40, "a run was claimed twice");
}

async fn test_claims_oldest_run_first(store: Arc<dyn Store>) {
    let a = store.create_run(echo_run()).await.unwrap();
    let b = store.create_run(echo_run()).await.unwrap();
    let c = store.create_run(echo_run()).await.unwrap();

    for expected in [a.id, b.id, c.id] {
        let (run, lease) = claim(&store, "w", TTL).await;
        assert_eq!(run.id, expected);
        assert_eq!(run.attempt, 1);
        assert_eq!(lease.attempt, 1);
        assert!(run.started_at.is_some());
    }
    assert!(store.try_claim_next(&[], "w", TTL).await.unwrap().is_none());
}

async fn test_claims_respect_agent_key_allowlist(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();

    let none = store
        .try_claim_next(&["shell".to_string()], "w", TTL)
        .await
        .unwrap();
    assert!(none.is_none());

    let claimed = store
        .try_claim_next(&["shell".to_string(), "echo".to_string()], "w", TTL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, run.id);
}

async fn test_stale_lease_is_fenced_after_reclaim(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();
    let (_, stale) = claim(&store, "a", SHORT_TTL).await;

    tokio::time::sleep(PAST_SHORT_TTL).await;
    let reclaimed = store.reclaim_expired_leases().await.unwrap();
    assert_eq!(
        reclaimed,
        vec![Reclaimed::Requeued {
            run_id: run.id,
            attempt: 1
        }]
    );
    // exactly one reclaim per expiry
    assert!(store.reclaim_expired_leases().await.unwrap().is_empty());

    let requeued = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, RunStatus::Queued);
    assert!(requeued.lease_owner.is_none());
    assert_eq!(requeued.error.as_ref().unwrap().kind, "LeaseExpired");

    assert_eq!(store.renew_lease(&stale, TTL).await.unwrap(), Renewal::Lost);

    let (fresh_run, fresh) = claim(&store, "b", TTL).await;
    assert_eq!(fresh_run.id, run.id);
    assert_eq!(fresh.attempt, 2);

    // the old holder can neither renew, emit nor finalize
    assert_eq!(store.renew_lease(&stale, TTL).await.unwrap(), Renewal::Lost);
    let err = store
        .append_event(run.id, EventType::StepCompleted, json!({}), Some(&stale))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::LeaseLost(_)));
    let err = store
        .finalize(&stale, Outcome::Succeeded { output: json!("late") })
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::LeaseLost(_)));

    let finalized = store
        .finalize(&fresh, Outcome::Succeeded { output: json!("ok") })
        .await
        .unwrap();
    match finalized {
        Finalized::Terminal { run, event } => {
            assert_eq!(run.status, RunStatus::Succeeded);
            assert_eq!(run.output, Some(json!("ok")));
            assert_eq!(event.event_type, EventType::RunSucceeded);
        }
        other => panic!("expected terminal, got {:?}", other),
    }
}

async fn test_reclaim_without_attempts_left_fails_run(store: Arc<dyn Store>) {
    let run = store
        .create_run(echo_run().with_max_attempts(1))
        .await
        .unwrap();
    claim(&store, "a", SHORT_TTL).await;

    tokio::time::sleep(PAST_SHORT_TTL).await;
    let reclaimed = store.reclaim_expired_leases().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    match &reclaimed[0] {
        Reclaimed::Terminal { run: failed, event } => {
            assert_eq!(failed.id, run.id);
            assert_eq!(failed.status, RunStatus::Failed);
            assert_eq!(failed.error.as_ref().unwrap().kind, "MaxRetriesExceeded");
            assert!(failed.finished_at.is_some());
            assert_eq!(event.event_type, EventType::RunFailed);
        }
        other => panic!("expected terminal reclaim, got {:?}", other),
    }

    let events = store.read_events(run.id, 0).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_terminal());
    assert!(store.try_claim_next(&[], "b", TTL).await.unwrap().is_none());
}

async fn test_cancel_of_queued_run_is_immediate(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();

    match store.request_cancel(run.id).await.unwrap() {
        CancelOutcome::Cancelled { run, event } => {
            assert_eq!(run.status, RunStatus::Cancelled);
            assert_eq!(event.event_type, EventType::RunCancelled);
            assert_eq!(event.seq, 1);
        }
        other => panic!("expected cancelled, got {:?}", other),
    }
    assert!(matches!(
        store.request_cancel(run.id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(_)
    ));
    assert!(store.try_claim_next(&[], "w", TTL).await.unwrap().is_none());
}

async fn test_cancel_of_running_run_is_flagged(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();
    let (_, lease) = claim(&store, "w", TTL).await;

    match store.request_cancel(run.id).await.unwrap() {
        CancelOutcome::Requested(flagged) => {
            assert_eq!(flagged.status, RunStatus::Running);
            assert!(flagged.cancel_requested_at.is_some());
        }
        other => panic!("expected requested, got {:?}", other),
    }

    match store.renew_lease(&lease, TTL).await.unwrap() {
        Renewal::Renewed {
            cancel_requested, ..
        } => assert!(cancel_requested),
        Renewal::Lost => panic!("lease should still be held"),
    }

    // a retry is not honored once cancellation was requested
    let finalized = store
        .finalize(
            &lease,
            Outcome::Retry {
                error: RunError::transient("flaky"),
                backoff: Duration::ZERO,
            },
        )
        .await
        .unwrap();
    match finalized {
        Finalized::Terminal { run, event } => {
            assert_eq!(run.status, RunStatus::Cancelled);
            assert_eq!(event.event_type, EventType::RunCancelled);
        }
        other => panic!("expected terminal, got {:?}", other),
    }
}

async fn test_expired_lease_with_pending_cancel_is_cancelled(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();
    claim(&store, "w", SHORT_TTL).await;
    store.request_cancel(run.id).await.unwrap();

    tokio::time::sleep(PAST_SHORT_TTL).await;
    let reclaimed = store.reclaim_expired_leases().await.unwrap();
    match reclaimed.as_slice() {
        [Reclaimed::Terminal { run, event }] => {
            assert_eq!(run.status, RunStatus::Cancelled);
            assert_eq!(event.event_type, EventType::RunCancelled);
        }
        other => panic!("expected one cancelled reclaim, got {:?}", other),
    }
}

async fn test_events_are_ordered_and_end_with_terminal(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();
    let (_, lease) = claim(&store, "w", TTL).await;

    for step in 1..=3 {
        let event = store
            .append_event(run.id, EventType::StepCompleted, json!({ "step": step }), Some(&lease))
            .await
            .unwrap();
        assert_eq!(event.seq, step);
    }

    // terminal events only come from finalization
    let err = store
        .append_event(run.id, EventType::RunSucceeded, json!({}), Some(&lease))
        .await;
    assert!(err.is_err());

    store
        .finalize(&lease, Outcome::Succeeded { output: json!({ "answer": 42 }) })
        .await
        .unwrap();

    let events = store.read_events(run.id, 0).await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    let terminal = &events[3];
    assert_eq!(terminal.event_type, EventType::RunSucceeded);
    assert_eq!(terminal.payload["status"], "succeeded");
    assert_eq!(terminal.payload["output"]["answer"], 42);

    let tail = store.read_events(run.id, 2).await.unwrap();
    assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
    assert!(store.read_events(run.id, 4).await.unwrap().is_empty());

    let late = store
        .append_event(run.id, EventType::StepCompleted, json!({}), None)
        .await;
    assert!(late.is_err(), "no appends after the terminal event");
}

async fn test_idempotency_key_returns_existing_run(store: Arc<dyn Store>) {
    let first = store
        .create_run(echo_run().with_idempotency_key("order-17"))
        .await
        .unwrap();
    let second = store
        .create_run(echo_run().with_idempotency_key("order-17"))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let other = store
        .create_run(echo_run().with_idempotency_key("order-18"))
        .await
        .unwrap();
    assert_ne!(first.id, other.id);
    assert_eq!(store.list_runs(None).await.unwrap().len(), 2);
}

async fn test_checkpoints_survive_requeue(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();
    let (_, lease) = claim(&store, "a", SHORT_TTL).await;

    assert!(store.latest_checkpoint(run.id).await.unwrap().is_none());
    store.save_checkpoint(&lease, json!({ "cursor": 1 })).await.unwrap();
    let second = store.save_checkpoint(&lease, json!({ "cursor": 2 })).await.unwrap();
    assert_eq!(second.seq, 2);

    tokio::time::sleep(PAST_SHORT_TTL).await;
    store.reclaim_expired_leases().await.unwrap();
    let err = store.save_checkpoint(&lease, json!({ "cursor": 3 })).await.unwrap_err();
    assert!(matches!(err, RuntimeError::LeaseLost(_)));

    claim(&store, "b", TTL).await;
    let latest = store.latest_checkpoint(run.id).await.unwrap().unwrap();
    assert_eq!(latest.seq, 2);
    assert_eq!(latest.state, json!({ "cursor": 2 }));
}

async fn test_transient_failure_requeues_with_backoff(store: Arc<dyn Store>) {
    let run = store.create_run(echo_run()).await.unwrap();
    let (_, lease) = claim(&store, "w", TTL).await;

    let finalized = store
        .finalize(
            &lease,
            Outcome::Retry {
                error: RunError::transient("rate limited"),
                backoff: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
    match finalized {
        Finalized::Requeued { run: requeued } => {
            assert_eq!(requeued.id, run.id);
            assert_eq!(requeued.status, RunStatus::Queued);
            assert_eq!(requeued.attempt, 1);
            assert!(requeued.available_at > requeued.updated_at);
            assert!(requeued.lease_owner.is_none());
        }
        other => panic!("expected requeue, got {:?}", other),
    }

    // not claimable until the backoff elapses
    assert!(store.try_claim_next(&[], "w", TTL).await.unwrap().is_none());
    assert!(store.read_events(run.id, 0).await.unwrap().is_empty());
}

async fn test_transient_failure_exhausts_attempts(store: Arc<dyn Store>) {
    let run = store
        .create_run(echo_run().with_max_attempts(2))
        .await
        .unwrap();

    for attempt in 1..=2 {
        let (claimed, lease) = claim(&store, "w", TTL).await;
        assert_eq!(claimed.attempt, attempt);
        let finalized = store
            .finalize(
                &lease,
                Outcome::Retry {
                    error: RunError::transient("boom"),
                    backoff: Duration::ZERO,
                },
            )
            .await
            .unwrap();
        match (attempt, finalized) {
            (1, Finalized::Requeued { .. }) => {}
            (2, Finalized::Terminal { run, event }) => {
                assert_eq!(run.status, RunStatus::Failed);
                assert_eq!(run.error.as_ref().unwrap().kind, "MaxRetriesExceeded");
                assert_eq!(event.event_type, EventType::RunFailed);
                assert_eq!(event.payload["error"]["kind"], "MaxRetriesExceeded");
            }
            (attempt, other) => panic!("unexpected result on attempt {}: {:?}", attempt, other),
        }
    }

    let stored = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.attempt, stored.max_attempts);
    assert!(store.try_claim_next(&[], "w", TTL).await.unwrap().is_none());
}

async fn test_runs_group_by_conversation(store: Arc<dyn Store>) {
    let conversation = store
        .create_conversation(Conversation::new("echo", "support"))
        .await
        .unwrap();
    let fetched = store.get_conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(fetched.title, "support");

    let first = store
        .create_run(echo_run().in_conversation(conversation.id))
        .await
        .unwrap();
    store.create_run(echo_run()).await.unwrap();
    let second = store
        .create_run(echo_run().in_conversation(conversation.id))
        .await
        .unwrap();

    let ids: Vec<_> = store
        .list_runs(Some(conversation.id))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert_eq!(store.list_runs(None).await.unwrap().len(), 3);

    let err = store
        .create_run(echo_run().in_conversation(uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ConversationNotFound(_)));
}

#[tokio::test]
async fn test_memory_store_rejects_runs_past_capacity() {
    let store = MemoryStore::with_capacity(2);
    store.create_run(echo_run()).await.unwrap();
    store.create_run(echo_run()).await.unwrap();
    assert!(matches!(
        store.create_run(echo_run()).await,
        Err(RuntimeError::QueueFull)
    ));
}

#[tokio::test]
async fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");

    let run = {
        let store = SqliteStore::open(&path).unwrap();
        let run = store.create_run(echo_run()).await.unwrap();
        let claimed = store.try_claim_next(&[], "w", TTL).await.unwrap().unwrap();
        let lease = Lease::for_run(&claimed).unwrap();
        store
            .append_event(run.id, EventType::StepCompleted, json!({ "step": 1 }), Some(&lease))
            .await
            .unwrap();
        run
    };

    let store = SqliteStore::open(&path).unwrap();
    let reopened = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(reopened.status, RunStatus::Running);
    assert_eq!(reopened.input, run.input);
    assert_eq!(store.read_events(run.id, 0).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_claims_are_exclusive_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");
    let seed = SqliteStore::open(&path).unwrap();
    for _ in 0..30 {
        seed.create_run(echo_run()).await.unwrap();
    }

    // one connection per simulated process
    let mut handles = Vec::new();
    for w in 0..4 {
        let store = SqliteStore::open(&path).unwrap();
        handles.push(tokio::spawn(async move {
            let worker = format!("proc-{}", w);
            let mut claimed = Vec::new();
            while let Some(run) = store.try_claim_next(&[], &worker, TTL).await.unwrap() {
                claimed.push(run.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}
