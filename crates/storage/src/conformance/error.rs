use std::future::Future;

use super::{make_negotiation, make_transfer_process, TestResult};
use crate::{ConnectorStorage, EntityKind, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "get_negotiation_nonexistent",
        get_negotiation_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "get_negotiation_for_update_nonexistent",
        get_negotiation_for_update_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "update_negotiation_nonexistent",
        update_negotiation_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "get_transfer_process_nonexistent",
        get_transfer_process_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "update_transfer_process_nonexistent",
        update_transfer_process_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "queries_empty_on_fresh_storage",
        queries_empty_on_fresh_storage(factory).await,
    ));

    results
}

fn expect_not_found<T>(
    result: Result<T, StorageError>,
    kind: EntityKind,
    id: &str,
) -> Result<(), String> {
    match result {
        Err(StorageError::NotFound {
            kind: got_kind,
            id: got_id,
        }) => {
            if got_kind != kind || got_id != id {
                return Err(format!("wrong NotFound fields: {got_kind}/{got_id}"));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected NotFound, got {e}")),
        Ok(_) => Err("expected NotFound, got Ok".to_string()),
    }
}

async fn get_negotiation_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    expect_not_found(s.get_negotiation("missing").await, EntityKind::Negotiation, "missing")
}

async fn get_negotiation_for_update_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.get_negotiation_for_update(&mut snap, "missing").await;
    let _ = s.abort_snapshot(snap).await;
    expect_not_found(result, EntityKind::Negotiation, "missing")
}

async fn update_negotiation_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .update_negotiation(&mut snap, 0, make_negotiation("ghost")?)
        .await;
    let _ = s.abort_snapshot(snap).await;
    expect_not_found(result, EntityKind::Negotiation, "ghost")
}

async fn get_transfer_process_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    expect_not_found(
        s.get_transfer_process("missing").await,
        EntityKind::TransferProcess,
        "missing",
    )
}

async fn update_transfer_process_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .update_transfer_process(&mut snap, 0, make_transfer_process("ghost")?)
        .await;
    let _ = s.abort_snapshot(snap).await;
    expect_not_found(result, EntityKind::TransferProcess, "ghost")
}

async fn queries_empty_on_fresh_storage<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    if !s
        .list_negotiations(None, 0)
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("fresh storage lists negotiations".to_string());
    }
    if !s
        .list_transfer_processes(None, 0)
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("fresh storage lists transfer processes".to_string());
    }
    if s.find_agreement("any").await.map_err(|e| e.to_string())?.is_some() {
        return Err("fresh storage resolves an agreement".to_string());
    }
    if s
        .get_provision_data("tp", "rd")
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("fresh storage has provision data".to_string());
    }
    Ok(())
}
