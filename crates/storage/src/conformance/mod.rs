//! Conformance test suite for `ConnectorStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `ConnectorStorage` implementation can run to verify correctness. The suite
//! covers:
//!
//! - **Create**: negotiation and transfer process creation, duplicate detection
//! - **Snapshot isolation**: uncommitted writes invisible, committed writes visible
//! - **Version validation / OCC**: optimistic concurrency conflict detection
//! - **Concurrency**: row locks serialize racing writers
//! - **Provision data**: auxiliary provisioner state lifecycle
//! - **Error handling**: correct error variants for invalid operations
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use connector_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_sqlite_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod create;
mod error;
mod provision;
mod snapshot;
mod version;

use std::fmt;
use std::future::Future;

use connector_core::{
    ContractAgreement, ContractNegotiation, CounterParty, DataAddress, DataRequest,
    NegotiationRole, NegotiationState, Policy, ResourceDefinition, TransferProcess,
};

use crate::ConnectorStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "create", "snapshot", "version").
    pub category: String,
    /// Test name (e.g. "create_negotiation_at_version_0").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ConnectorStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(create::run_create_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(version::run_version_tests(&factory).await);
    results.extend(provision::run_provision_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: fixtures and committed writes ───────────────────────────────────

fn make_negotiation(id: &str) -> Result<ContractNegotiation, String> {
    ContractNegotiation::new(
        id,
        NegotiationRole::Consumer,
        CounterParty {
            id: "provider".to_string(),
            address: "test://provider".to_string(),
            protocol: "test".to_string(),
        },
    )
    .map_err(|e| e.to_string())
}

/// A negotiation already in `Confirmed` carrying agreement `agreement_id`.
fn make_confirmed_negotiation(id: &str, agreement_id: &str) -> Result<ContractNegotiation, String> {
    let mut negotiation = make_negotiation(id)?;
    let agreement = ContractAgreement::builder()
        .id(agreement_id)
        .provider_agent_id("provider")
        .consumer_agent_id("consumer")
        .contract_signing_date(1_700_000_000)
        .contract_start_date(1_700_000_000)
        .contract_end_date(1_800_000_000)
        .asset_ids(vec!["asset-1".to_string()])
        .policy(Policy::permit_all())
        .build()
        .map_err(|e| e.to_string())?;
    for state in [NegotiationState::Requesting, NegotiationState::Requested] {
        negotiation.transition_to(state).map_err(|e| e.to_string())?;
    }
    negotiation
        .attach_agreement(agreement)
        .map_err(|e| e.to_string())?;
    negotiation
        .transition_to(NegotiationState::Confirmed)
        .map_err(|e| e.to_string())?;
    Ok(negotiation)
}

fn make_transfer_process(id: &str) -> Result<TransferProcess, String> {
    TransferProcess::new(
        id,
        DataRequest {
            id: format!("{id}-request"),
            asset_id: "asset-1".to_string(),
            contract_id: "def-1:agreement".to_string(),
            destination: DataAddress::new("test"),
        },
        vec![ResourceDefinition::new("rd-1", "test")],
    )
    .map_err(|e| e.to_string())
}

/// Create and commit a negotiation in its own snapshot.
async fn seed_negotiation<S: ConnectorStorage>(
    storage: &S,
    negotiation: ContractNegotiation,
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .create_negotiation(&mut snap, negotiation)
        .await
        .map_err(|e| format!("create: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn seed_transfer_process<S: ConnectorStorage>(
    storage: &S,
    process: TransferProcess,
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .create_transfer_process(&mut snap, process)
        .await
        .map_err(|e| format!("create: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

/// Lock, transition, and commit one negotiation. Returns the new version.
async fn advance_negotiation<S: ConnectorStorage>(
    storage: &S,
    id: &str,
    to: NegotiationState,
) -> Result<i64, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let mut record = storage
        .get_negotiation_for_update(&mut snap, id)
        .await
        .map_err(|e| format!("get for update: {e}"))?;
    record
        .negotiation
        .transition_to(to)
        .map_err(|e| e.to_string())?;
    let version = storage
        .update_negotiation(&mut snap, record.version, record.negotiation)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    Ok(version)
}
