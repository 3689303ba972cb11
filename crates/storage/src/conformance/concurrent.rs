use std::future::Future;
use std::sync::Arc;

use connector_core::NegotiationState;

use super::{make_negotiation, seed_negotiation, TestResult};
use crate::{ConnectorStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_exactly_one_wins",
        concurrent_updates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_create_exactly_one_wins",
        concurrent_create_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "locked_read_modify_write_loses_no_updates",
        locked_read_modify_write_loses_no_updates(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_different_entities_all_succeed",
        concurrent_updates_different_entities_all_succeed(factory).await,
    ));

    results
}

// ── Concurrent update: exactly one wins ─────────────────────────────────────

/// N tasks each open a snapshot and attempt to move the same negotiation from
/// version 0. Exactly one commit succeeds; the rest must get ConcurrentConflict.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_negotiation(storage.as_ref(), make_negotiation("n-1")?).await?;
    let base = make_negotiation("n-1")?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let mut negotiation = base.clone();
        handles.push(tokio::spawn(async move {
            let _ = negotiation.transition_to(NegotiationState::Requesting);
            let mut snap = s.begin_snapshot().await?;
            match s.update_negotiation(&mut snap, 0, negotiation).await {
                Ok(_new_version) => {
                    s.commit_snapshot(snap).await?;
                    Ok(true) // won the race
                }
                Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false) // lost the race
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    Ok(())
}

// ── Concurrent create: exactly one wins ─────────────────────────────────────

async fn concurrent_create_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let base = make_negotiation("n-1")?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let negotiation = base.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            match s.create_negotiation(&mut snap, negotiation).await {
                Ok(()) => {
                    s.commit_snapshot(snap).await?;
                    Ok(true)
                }
                Err(StorageError::AlreadyExists { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Locked read-modify-write: no lost updates ───────────────────────────────

/// N tasks each lock the negotiation, read its retry count, bump it, and
/// write it back with the version they read. Row locks must serialize them
/// so every increment survives and no task sees a conflict.
async fn locked_read_modify_write_loses_no_updates<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_negotiation(storage.as_ref(), make_negotiation("n-1")?).await?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let mut rec = s.get_negotiation_for_update(&mut snap, "n-1").await?;
            tokio::task::yield_now().await;
            rec.negotiation.record_retry();
            s.update_negotiation(&mut snap, rec.version, rec.negotiation)
                .await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    let rec = storage
        .get_negotiation("n-1")
        .await
        .map_err(|e| e.to_string())?;
    if rec.negotiation.retry_count() as usize != N {
        return Err(format!(
            "expected retry count {N}, got {} (lost updates)",
            rec.negotiation.retry_count()
        ));
    }
    if rec.version != N as i64 {
        return Err(format!("expected version {N}, got {}", rec.version));
    }
    Ok(())
}

// ── Concurrent updates to different entities: all succeed ───────────────────

/// N tasks each update a different negotiation. All should succeed; no false
/// conflicts when there is no contention.
async fn concurrent_updates_different_entities_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_negotiation(storage.as_ref(), make_negotiation(&format!("n-{i}"))?).await?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("n-{i}");
            let mut snap = s.begin_snapshot().await?;
            let mut rec = s.get_negotiation_for_update(&mut snap, &id).await?;
            let _ = rec.negotiation.transition_to(NegotiationState::Requesting);
            s.update_negotiation(&mut snap, rec.version, rec.negotiation)
                .await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    for i in 0..N {
        let rec = storage
            .get_negotiation(&format!("n-{i}"))
            .await
            .map_err(|e| format!("get n-{i}: {e}"))?;
        if rec.negotiation.state() != NegotiationState::Requesting {
            return Err(format!(
                "n-{i}: expected Requesting, got {:?}",
                rec.negotiation.state()
            ));
        }
    }
    Ok(())
}
