//! Provisioner auxiliary data conformance tests.

use std::future::Future;

use serde_json::json;

use super::TestResult;
use crate::{ConnectorStorage, ProvisionDataRecord, StorageError};

pub(super) async fn run_provision_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "provision",
        "create_then_find",
        create_then_find(factory).await,
    ));
    results.push(TestResult::from_result(
        "provision",
        "duplicate_create_returns_already_exists",
        duplicate_create_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "provision",
        "update_replaces_data",
        update_replaces_data(factory).await,
    ));
    results.push(TestResult::from_result(
        "provision",
        "update_missing_returns_not_found",
        update_missing_returns_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "provision",
        "delete_removes_all_records_of_process",
        delete_removes_all_records_of_process(factory).await,
    ));

    results
}

async fn commit_create<S: ConnectorStorage>(
    s: &S,
    record: ProvisionDataRecord,
) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.create_provision_data(&mut snap, record)
        .await
        .map_err(|e| format!("create: {e}"))?;
    s.commit_snapshot(snap).await.map_err(|e| format!("commit: {e}"))
}

async fn create_then_find<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_create(&s, ProvisionDataRecord::new("tp-1", "rd-1", json!({"request": "r-1"}))).await?;
    let found = s
        .get_provision_data("tp-1", "rd-1")
        .await
        .map_err(|e| e.to_string())?;
    match found {
        Some(r) if r.data == json!({"request": "r-1"}) => Ok(()),
        Some(r) => Err(format!("unexpected data {}", r.data)),
        None => Err("provision data not found".to_string()),
    }
}

async fn duplicate_create_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_create(&s, ProvisionDataRecord::new("tp-1", "rd-1", json!(1))).await?;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .create_provision_data(&mut snap, ProvisionDataRecord::new("tp-1", "rd-1", json!(2)))
        .await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
        Ok(()) => Err("duplicate provision data accepted".to_string()),
    }
}

async fn update_replaces_data<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_create(&s, ProvisionDataRecord::new("tp-1", "rd-1", json!({"step": 1}))).await?;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_provision_data(&mut snap, ProvisionDataRecord::new("tp-1", "rd-1", json!({"step": 2})))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let found = s
        .get_provision_data("tp-1", "rd-1")
        .await
        .map_err(|e| e.to_string())?;
    if found.map(|r| r.data) != Some(json!({"step": 2})) {
        return Err("update not applied".to_string());
    }
    Ok(())
}

async fn update_missing_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .update_provision_data(&mut snap, ProvisionDataRecord::new("tp-1", "rd-1", json!(null)))
        .await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected NotFound, got {e}")),
        Ok(()) => Err("update of missing provision data accepted".to_string()),
    }
}

async fn delete_removes_all_records_of_process<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_create(&s, ProvisionDataRecord::new("tp-1", "rd-1", json!(1))).await?;
    commit_create(&s, ProvisionDataRecord::new("tp-1", "rd-2", json!(2))).await?;
    commit_create(&s, ProvisionDataRecord::new("tp-2", "rd-1", json!(3))).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let removed = s
        .delete_provision_data(&mut snap, "tp-1")
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if removed != 2 {
        return Err(format!("expected 2 removed, got {removed}"));
    }
    for rd in ["rd-1", "rd-2"] {
        if s.get_provision_data("tp-1", rd)
            .await
            .map_err(|e| e.to_string())?
            .is_some()
        {
            return Err(format!("tp-1/{rd} survived delete"));
        }
    }
    if s.get_provision_data("tp-2", "rd-1")
        .await
        .map_err(|e| e.to_string())?
        .is_none()
    {
        return Err("delete removed another process's data".to_string());
    }
    Ok(())
}
