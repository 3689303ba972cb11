//! Version validation / OCC conformance tests.

use std::future::Future;

use connector_core::{NegotiationState, TransferState};

use super::{
    advance_negotiation, make_negotiation, make_transfer_process, seed_negotiation,
    seed_transfer_process, TestResult,
};
use crate::{ConnectorStorage, EntityKind, StorageError};

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "version",
        "version_increments_sequentially",
        version_increments_sequentially(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "update_with_wrong_version_returns_conflict",
        update_with_wrong_version_returns_conflict(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "conflict_has_correct_fields",
        conflict_has_correct_fields(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "stale_version_after_intervening_commit",
        stale_version_after_intervening_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "conflict_does_not_change_record",
        conflict_does_not_change_record(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "transfer_process_versions_are_checked",
        transfer_process_versions_are_checked(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "versions_are_per_entity",
        versions_are_per_entity(factory).await,
    ));

    results
}

/// Three successive committed updates must yield versions 1, 2, 3.
async fn version_increments_sequentially<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let steps = [
        NegotiationState::Requesting,
        NegotiationState::Requested,
        NegotiationState::Offered,
    ];
    for (i, to) in steps.into_iter().enumerate() {
        let version = advance_negotiation(&s, "n-1", to).await?;
        let expected = i as i64 + 1;
        if version != expected {
            return Err(format!("expected version {expected}, got {version}"));
        }
    }
    let rec = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    if rec.version != 3 {
        return Err(format!("expected stored version 3, got {}", rec.version));
    }
    Ok(())
}

async fn update_with_wrong_version_returns_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    for wrong in [-1, 1, 999] {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        let rec = s
            .get_negotiation_for_update(&mut snap, "n-1")
            .await
            .map_err(|e| e.to_string())?;
        let result = s.update_negotiation(&mut snap, wrong, rec.negotiation).await;
        let _ = s.abort_snapshot(snap).await;
        match result {
            Err(StorageError::ConcurrentConflict { .. }) => {}
            Err(e) => return Err(format!("v{wrong}: expected ConcurrentConflict, got {e}")),
            Ok(v) => return Err(format!("v{wrong}: expected conflict, got version {v}")),
        }
    }
    Ok(())
}

async fn conflict_has_correct_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let negotiation = make_negotiation("n-1")?;
    let result = s.update_negotiation(&mut snap, 7, negotiation).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict {
            kind,
            id,
            expected_version,
        }) => {
            if kind != EntityKind::Negotiation || id != "n-1" || expected_version != 7 {
                return Err(format!("wrong conflict fields: {kind}/{id}/v{expected_version}"));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(v) => Err(format!("expected conflict, got version {v}")),
    }
}

/// After a committed update to v1, a write based on v0 must conflict.
async fn stale_version_after_intervening_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let stale = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    advance_negotiation(&s, "n-1", NegotiationState::Requesting).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut negotiation = stale.negotiation;
    negotiation
        .transition_to(NegotiationState::Requested)
        .map_err(|e| e.to_string())?;
    let result = s
        .update_negotiation(&mut snap, stale.version, negotiation)
        .await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(v) => Err(format!("stale write accepted at version {v}")),
    }
}

async fn conflict_does_not_change_record<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut negotiation = make_negotiation("n-1")?;
    negotiation
        .transition_to(NegotiationState::Requesting)
        .map_err(|e| e.to_string())?;
    let _ = s.update_negotiation(&mut snap, 5, negotiation).await;
    // A conflict leaves the snapshot usable; committing it must change nothing.
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let rec = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    if rec.version != 0 || rec.negotiation.state() != NegotiationState::Initial {
        return Err(format!(
            "conflicting update leaked: v{} {:?}",
            rec.version,
            rec.negotiation.state()
        ));
    }
    Ok(())
}

async fn transfer_process_versions_are_checked<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transfer_process(&s, make_transfer_process("tp-1")?).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut rec = s
        .get_transfer_process_for_update(&mut snap, "tp-1")
        .await
        .map_err(|e| e.to_string())?;
    rec.process
        .transition_to(TransferState::Provisioning)
        .map_err(|e| e.to_string())?;
    let version = s
        .update_transfer_process(&mut snap, rec.version, rec.process.clone())
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    if version != 1 {
        return Err(format!("expected version 1, got {version}"));
    }

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.update_transfer_process(&mut snap, 0, rec.process).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict { kind, .. }) if kind == EntityKind::TransferProcess => {
            Ok(())
        }
        Err(e) => Err(format!("expected transfer ConcurrentConflict, got {e}")),
        Ok(v) => Err(format!("stale transfer write accepted at version {v}")),
    }
}

async fn versions_are_per_entity<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    seed_negotiation(&s, make_negotiation("n-2")?).await?;
    advance_negotiation(&s, "n-1", NegotiationState::Requesting).await?;

    let other = s.get_negotiation("n-2").await.map_err(|e| e.to_string())?;
    if other.version != 0 {
        return Err(format!("n-2 version moved to {}", other.version));
    }
    Ok(())
}
