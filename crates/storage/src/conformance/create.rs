use std::future::Future;

use connector_core::{NegotiationState, TransferState};

use super::{
    make_confirmed_negotiation, make_negotiation, make_transfer_process, seed_negotiation,
    seed_transfer_process, TestResult,
};
use crate::{ConnectorStorage, EntityKind, StorageError};

pub(super) async fn run_create_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "create",
        "create_negotiation_at_version_0",
        create_negotiation_at_version_0(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "created_negotiation_round_trips",
        created_negotiation_round_trips(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "created_negotiation_readable_for_update",
        created_negotiation_readable_for_update(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "double_create_returns_already_exists",
        double_create_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "double_create_across_snapshots",
        double_create_across_snapshots(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "create_transfer_process_at_version_0",
        create_transfer_process_at_version_0(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "list_negotiations_filters_by_state",
        list_negotiations_filters_by_state(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "list_negotiations_respects_limit",
        list_negotiations_respects_limit(factory).await,
    ));
    results.push(TestResult::from_result(
        "create",
        "find_agreement_only_for_confirmed",
        find_agreement_only_for_confirmed(factory).await,
    ));

    results
}

// ── Test implementations ──────────────────────────────────────────────────────

/// After create + commit, the negotiation version must be 0.
async fn create_negotiation_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let rec = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    if rec.version != 0 {
        return Err(format!("expected version 0, got {}", rec.version));
    }
    Ok(())
}

/// The stored aggregate must equal the one that was created.
async fn created_negotiation_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let negotiation = make_negotiation("n-1")?;
    seed_negotiation(&s, negotiation.clone()).await?;
    let rec = s.get_negotiation("n-1").await.map_err(|e| e.to_string())?;
    if rec.negotiation != negotiation {
        return Err("stored negotiation differs from created one".to_string());
    }
    if rec.negotiation.hash() != negotiation.hash() {
        return Err("history hash changed across storage".to_string());
    }
    Ok(())
}

async fn created_negotiation_readable_for_update<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let rec = s
        .get_negotiation_for_update(&mut snap, "n-1")
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    if rec.negotiation.state() != NegotiationState::Initial {
        return Err(format!("expected Initial, got {:?}", rec.negotiation.state()));
    }
    Ok(())
}

/// Creating the same id twice in one snapshot must fail.
async fn double_create_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = s.create_negotiation(&mut snap, make_negotiation("n-1")?).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { kind, id }) => {
            if kind != EntityKind::Negotiation || id != "n-1" {
                return Err(format!("wrong error fields: {kind}/{id}"));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
        Ok(()) => Err("expected AlreadyExists, got Ok".to_string()),
    }
}

async fn double_create_across_snapshots<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.create_negotiation(&mut snap, make_negotiation("n-1")?).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
        Ok(()) => Err("expected AlreadyExists, got Ok".to_string()),
    }
}

async fn create_transfer_process_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transfer_process(&s, make_transfer_process("tp-1")?).await?;
    let rec = s
        .get_transfer_process("tp-1")
        .await
        .map_err(|e| e.to_string())?;
    if rec.version != 0 {
        return Err(format!("expected version 0, got {}", rec.version));
    }
    if rec.process.state() != TransferState::Initial {
        return Err(format!("expected Initial, got {:?}", rec.process.state()));
    }
    Ok(())
}

async fn list_negotiations_filters_by_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_negotiation("n-1")?).await?;
    let mut requesting = make_negotiation("n-2")?;
    requesting
        .transition_to(NegotiationState::Requesting)
        .map_err(|e| e.to_string())?;
    seed_negotiation(&s, requesting).await?;

    let all = s.list_negotiations(None, 0).await.map_err(|e| e.to_string())?;
    if all.len() != 2 {
        return Err(format!("expected 2 negotiations, got {}", all.len()));
    }
    let pending = s
        .list_negotiations(Some(NegotiationState::Requesting), 0)
        .await
        .map_err(|e| e.to_string())?;
    if pending.len() != 1 || pending[0].negotiation.id() != "n-2" {
        return Err(format!("expected only n-2 in Requesting, got {}", pending.len()));
    }
    Ok(())
}

async fn list_negotiations_respects_limit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for i in 0..5 {
        seed_negotiation(&s, make_negotiation(&format!("n-{i}"))?).await?;
    }
    let limited = s.list_negotiations(None, 3).await.map_err(|e| e.to_string())?;
    if limited.len() != 3 {
        return Err(format!("expected 3 with limit, got {}", limited.len()));
    }
    Ok(())
}

/// Agreements are only visible once their negotiation is confirmed.
async fn find_agreement_only_for_confirmed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_negotiation(&s, make_confirmed_negotiation("n-1", "def-1:a")?).await?;
    seed_negotiation(&s, make_negotiation("n-2")?).await?;

    let found = s.find_agreement("def-1:a").await.map_err(|e| e.to_string())?;
    match found {
        Some(agreement) if agreement.covers_asset("asset-1") => {}
        Some(_) => return Err("agreement lost its assets".to_string()),
        None => return Err("confirmed agreement not found".to_string()),
    }
    let missing = s.find_agreement("def-1:b").await.map_err(|e| e.to_string())?;
    if missing.is_some() {
        return Err("unknown agreement id resolved".to_string());
    }
    Ok(())
}
