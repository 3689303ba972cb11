use async_trait::async_trait;
use connector_core::{
    ContractAgreement, ContractNegotiation, NegotiationState, TransferProcess,
    TransferState,
};

use crate::error::StorageError;
use crate::record::{NegotiationRecord, ProvisionDataRecord, TransferProcessRecord};

/// Durable storage for negotiations, transfer processes, and provisioner
/// auxiliary data.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` -- start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` -- commit and consume the transaction
///    OR `abort_snapshot(snapshot)` -- roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the transaction MUST be
/// rolled back. Uncommitted writes are never visible to other readers.
///
/// ## Exclusive access
///
/// `*_for_update` reads and `create_*` / `update_*` calls lock the entity for
/// the lifetime of the snapshot (`SELECT ... FOR UPDATE`). A second snapshot
/// touching the same entity waits until the first commits or aborts. Callers
/// lock at most one negotiation or transfer process per snapshot.
///
/// ## OCC Conflict Detection
///
/// `update_*` is conditional on `version = expected_version`; a mismatch
/// returns `Err(StorageError::ConcurrentConflict { .. })` and changes nothing.
#[async_trait]
pub trait ConnectorStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Negotiations (within snapshot) ───────────────────────────────────────

    /// Store a new negotiation at version 0.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn create_negotiation(
        &self,
        snapshot: &mut Self::Snapshot,
        negotiation: ContractNegotiation,
    ) -> Result<(), StorageError>;

    /// Read a negotiation, locking it until the snapshot ends.
    async fn get_negotiation_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
    ) -> Result<NegotiationRecord, StorageError>;

    /// Replace a negotiation if its stored version is `expected_version`.
    ///
    /// Returns the new version.
    async fn update_negotiation(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        negotiation: ContractNegotiation,
    ) -> Result<i64, StorageError>;

    // ── Transfer processes (within snapshot) ─────────────────────────────────

    async fn create_transfer_process(
        &self,
        snapshot: &mut Self::Snapshot,
        process: TransferProcess,
    ) -> Result<(), StorageError>;

    async fn get_transfer_process_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
    ) -> Result<TransferProcessRecord, StorageError>;

    async fn update_transfer_process(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        process: TransferProcess,
    ) -> Result<i64, StorageError>;

    // ── Provision data (within snapshot) ─────────────────────────────────────

    /// Returns `Err(StorageError::AlreadyExists)` if a record exists for the
    /// same process and resource definition.
    async fn create_provision_data(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ProvisionDataRecord,
    ) -> Result<(), StorageError>;

    /// Returns `Err(StorageError::NotFound)` if no record exists yet.
    async fn update_provision_data(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ProvisionDataRecord,
    ) -> Result<(), StorageError>;

    /// Delete every provision data record of a process. Returns how many
    /// records the commit will remove.
    async fn delete_provision_data(
        &self,
        snapshot: &mut Self::Snapshot,
        process_id: &str,
    ) -> Result<usize, StorageError>;

    // ── Query operations (outside snapshot, committed state only) ────────────

    async fn get_negotiation(&self, id: &str) -> Result<NegotiationRecord, StorageError>;

    /// Negotiations in `state` (all when `None`), least recently changed
    /// first. `limit` 0 means no limit.
    async fn list_negotiations(
        &self,
        state: Option<NegotiationState>,
        limit: usize,
    ) -> Result<Vec<NegotiationRecord>, StorageError>;

    /// The agreement with this id, if a stored negotiation carries it.
    async fn find_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<ContractAgreement>, StorageError>;

    async fn get_transfer_process(&self, id: &str) -> Result<TransferProcessRecord, StorageError>;

    async fn list_transfer_processes(
        &self,
        state: Option<TransferState>,
        limit: usize,
    ) -> Result<Vec<TransferProcessRecord>, StorageError>;

    async fn get_provision_data(
        &self,
        process_id: &str,
        resource_definition_id: &str,
    ) -> Result<Option<ProvisionDataRecord>, StorageError>;
}
