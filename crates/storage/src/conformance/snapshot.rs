//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! committed writes are visible, aborted or dropped writes are discarded, and
//! a multi-record snapshot commits all-or-nothing.

use std::future::Future;

use connector_core::NegotiationState;

use super::{
    advance_negotiation, make_negotiation, make_transfer_process, seed_negotiation, TestResult,
};
use crate::{ConnectorStorage, StorageError};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_create_invisible",
        uncommitted_create_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_update_invisible",
        uncommitted_update_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "committed_update_visible",
        committed_update_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_create",
        abort_discards_create(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "drop_discards_update",
        drop_discards_update(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_reads_its_own_writes",
        snapshot_reads_its_own_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "multi_record_commit_is_atomic",
        multi_record_commit_is_atomic(factory).await,
    ));

    results
}

async fn uncommitted_create_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.create_negotiation(&mut snap, make_negotiation("n-1")?)
        .await
        .map_err(|e| e.to_string())?;

    let outside = s.get_negotiation("n-1").await;
    let listed = s.list_negotiations(None, 0).await.map_err(|e| e.to_string())?;
    let _ = s.abort_snapshot(snap).await;

    match outside {
        Err(StorageError::NotFound { .. }) => {}
        Err(e) => return Err(format!("expected NotFound, got {e}")),
        Ok(_) => return Err("uncommitted negotiation visible to get".to_string()),
    }
    if !listed.is_empty() {
        return Err("uncommitted negotiation visible to list".to_string());
    }
    Ok(())
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut rec = s
        .get_negotiation_for_update(&mut snap, "n-1")
        .await
        .map_err(|e| e.to_string())?;
    rec.negotiation
        .transition_to(NegotiationState::Requesting)
        .map_err(|e| e.to_string())?;
    s.update_negotiation(&mut snap, rec.version, rec.negotiation)
        .await
        .map_err(|e| e.to_string())?;

    let outside = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    let _ = s.abort_snapshot(snap).await;

    if outside.version != 0 || outside.negotiation.state() != NegotiationState::Initial {
        return Err(format!(
            "uncommitted update visible: v{} {:?}",
            outside.version,
            outside.negotiation.state()
        ));
    }
    Ok(())
}

async fn committed_update_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    advance_negotiation(&s, "n-1", NegotiationState::Requesting).await?;

    let rec = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    if rec.negotiation.state() != NegotiationState::Requesting {
        return Err(format!("expected Requesting, got {:?}", rec.negotiation.state()));
    }
    if rec.negotiation.state_count() != 1 {
        return Err(format!("expected state_count 1, got {}", rec.negotiation.state_count()));
    }
    Ok(())
}

async fn abort_discards_create<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.create_transfer_process(&mut snap, make_transfer_process("tp-1")?)
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    match s.get_transfer_process("tp-1").await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected NotFound, got {e}")),
        Ok(_) => Err("aborted transfer process visible".to_string()),
    }
}

/// Dropping a snapshot without commit must roll it back and release its locks.
async fn drop_discards_update<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        let mut rec = s
            .get_negotiation_for_update(&mut snap, "n-1")
            .await
            .map_err(|e| e.to_string())?;
        rec.negotiation
            .transition_to(NegotiationState::Requesting)
            .map_err(|e| e.to_string())?;
        s.update_negotiation(&mut snap, rec.version, rec.negotiation)
            .await
            .map_err(|e| e.to_string())?;
        drop(snap);
    }
    // Would block forever if the dropped snapshot still held the row lock.
    let version = advance_negotiation(&s, "n-1", NegotiationState::Requesting).await?;
    if version != 1 {
        return Err(format!("expected version 1 after dropped update, got {version}"));
    }
    Ok(())
}

async fn snapshot_reads_its_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.create_negotiation(&mut snap, make_negotiation("n-1")?)
        .await
        .map_err(|e| e.to_string())?;
    let rec = s.get_negotiation_for_update(&mut snap, "n-1").await;
    let _ = s.abort_snapshot(snap).await;
    match rec {
        Ok(rec) if rec.version == 0 => Ok(()),
        Ok(rec) => Err(format!("expected version 0, got {}", rec.version)),
        Err(e) => Err(format!("own write not readable: {e}")),
    }
}

/// A snapshot that creates a negotiation and a transfer process but fails to
/// commit the second must leave neither behind.
async fn multi_record_commit_is_atomic<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.create_negotiation(&mut snap, make_negotiation("n-1")?)
        .await
        .map_err(|e| e.to_string())?;
    s.create_transfer_process(&mut snap, make_transfer_process("tp-1")?)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    if s.get_negotiation("n-1").await.is_err() || s.get_transfer_process("tp-1").await.is_err() {
        return Err("committed records missing".to_string());
    }

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.create_negotiation(&mut snap, make_negotiation("n-2")?)
        .await
        .map_err(|e| e.to_string())?;
    let dup = s
        .create_transfer_process(&mut snap, make_transfer_process("tp-1")?)
        .await;
    if dup.is_ok() {
        let _ = s.abort_snapshot(snap).await;
        return Err("duplicate transfer process accepted".to_string());
    }
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    if s.get_negotiation("n-2").await.is_ok() {
        return Err("partial snapshot left n-2 behind".to_string());
    }
    Ok(())
}
