//! In-process storage backend.
//!
//! Committed rows live in plain maps behind a `std::sync::Mutex` that is never
//! held across an await. Row locks are per-entity `tokio::sync::Mutex`es; a
//! snapshot keeps the owned guards together with its staged writes, so
//! dropping the snapshot releases the locks and discards the writes. Commit
//! and abort also drop the lock entries no other snapshot is waiting on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use connector_core::{
    ContractAgreement, ContractNegotiation, NegotiationState, TransferProcess,
    TransferState,
};
use tokio::sync::OwnedMutexGuard;

use crate::error::{EntityKind, StorageError};
use crate::record::{NegotiationRecord, ProvisionDataRecord, TransferProcessRecord};
use crate::traits::ConnectorStorage;

#[derive(Default)]
struct Tables {
    negotiations: BTreeMap<String, NegotiationRecord>,
    transfers: BTreeMap<String, TransferProcessRecord>,
    provision_data: BTreeMap<String, ProvisionDataRecord>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Storage kept entirely in memory. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

/// An open in-memory transaction.
#[derive(Default)]
pub struct InMemorySnapshot {
    guards: HashMap<String, OwnedMutexGuard<()>>,
    negotiations: BTreeMap<String, NegotiationRecord>,
    transfers: BTreeMap<String, TransferProcessRecord>,
    provision_data: BTreeMap<String, ProvisionDataRecord>,
    provision_creates: BTreeSet<String>,
    provision_deletes: BTreeSet<String>,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StorageError {
    StorageError::Backend("in-memory table lock poisoned".to_string())
}

fn negotiation_key(id: &str) -> String {
    format!("negotiation:{id}")
}

fn transfer_key(id: &str) -> String {
    format!("transfer:{id}")
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.inner.tables.lock().map_err(poisoned)
    }

    async fn lock_entity(
        &self,
        snapshot: &mut InMemorySnapshot,
        key: String,
    ) -> Result<(), StorageError> {
        if snapshot.guards.contains_key(&key) {
            return Ok(());
        }
        let mutex = {
            let mut locks = self.inner.locks.lock().map_err(poisoned)?;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        snapshot.guards.insert(key, guard);
        Ok(())
    }

    /// Release a snapshot's row locks. An entry whose mutex is referenced
    /// only by the lock map has no holder and no waiter, and is removed.
    fn release(&self, guards: HashMap<String, OwnedMutexGuard<()>>) {
        let keys: Vec<String> = guards.keys().cloned().collect();
        drop(guards);
        let Ok(mut locks) = self.inner.locks.lock() else {
            return;
        };
        for key in keys {
            if locks.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
                locks.remove(&key);
            }
        }
    }

    fn apply(&self, snapshot: InMemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for key in &snapshot.provision_creates {
            let deleted = snapshot
                .provision_data
                .get(key)
                .is_some_and(|r| snapshot.provision_deletes.contains(&r.process_id));
            if tables.provision_data.contains_key(key) && !deleted {
                return Err(StorageError::AlreadyExists {
                    kind: EntityKind::ProvisionData,
                    id: key.clone(),
                });
            }
        }
        for process_id in &snapshot.provision_deletes {
            tables
                .provision_data
                .retain(|_, r| &r.process_id != process_id);
        }
        tables.provision_data.extend(snapshot.provision_data);
        tables.negotiations.extend(snapshot.negotiations);
        tables.transfers.extend(snapshot.transfers);
        Ok(())
    }

    fn current_negotiation(
        &self,
        snapshot: &InMemorySnapshot,
        id: &str,
    ) -> Result<Option<NegotiationRecord>, StorageError> {
        if let Some(staged) = snapshot.negotiations.get(id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.tables()?.negotiations.get(id).cloned())
    }

    fn current_transfer(
        &self,
        snapshot: &InMemorySnapshot,
        id: &str,
    ) -> Result<Option<TransferProcessRecord>, StorageError> {
        if let Some(staged) = snapshot.transfers.get(id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.tables()?.transfers.get(id).cloned())
    }

    fn provision_data_exists(
        &self,
        snapshot: &InMemorySnapshot,
        record: &ProvisionDataRecord,
    ) -> Result<bool, StorageError> {
        let key = record.key();
        if snapshot.provision_data.contains_key(&key) {
            return Ok(true);
        }
        if snapshot.provision_deletes.contains(&record.process_id) {
            return Ok(false);
        }
        Ok(self.tables()?.provision_data.contains_key(&key))
    }
}

#[async_trait]
impl ConnectorStorage for InMemoryStorage {
    type Snapshot = InMemorySnapshot;

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError> {
        Ok(InMemorySnapshot::default())
    }

    async fn commit_snapshot(&self, mut snapshot: Self::Snapshot) -> Result<(), StorageError> {
        // Writes land before the row locks are released.
        let guards = std::mem::take(&mut snapshot.guards);
        let result = self.apply(snapshot);
        self.release(guards);
        result
    }

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        self.release(snapshot.guards);
        Ok(())
    }

    // ── Negotiations ─────────────────────────────────────────────────────────

    async fn create_negotiation(
        &self,
        snapshot: &mut Self::Snapshot,
        negotiation: ContractNegotiation,
    ) -> Result<(), StorageError> {
        let id = negotiation.id().to_string();
        self.lock_entity(snapshot, negotiation_key(&id)).await?;
        if self.current_negotiation(snapshot, &id)?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: EntityKind::Negotiation,
                id,
            });
        }
        snapshot.negotiations.insert(
            id,
            NegotiationRecord {
                negotiation,
                version: 0,
                updated_at: connector_core::now_iso8601(),
            },
        );
        Ok(())
    }

    async fn get_negotiation_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
    ) -> Result<NegotiationRecord, StorageError> {
        self.lock_entity(snapshot, negotiation_key(id)).await?;
        self.current_negotiation(snapshot, id)?
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::Negotiation,
                id: id.to_string(),
            })
    }

    async fn update_negotiation(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        negotiation: ContractNegotiation,
    ) -> Result<i64, StorageError> {
        let id = negotiation.id().to_string();
        self.lock_entity(snapshot, negotiation_key(&id)).await?;
        let current =
            self.current_negotiation(snapshot, &id)?
                .ok_or_else(|| StorageError::NotFound {
                    kind: EntityKind::Negotiation,
                    id: id.clone(),
                })?;
        if current.version != expected_version {
            return Err(StorageError::ConcurrentConflict {
                kind: EntityKind::Negotiation,
                id,
                expected_version,
            });
        }
        let version = current.version + 1;
        snapshot.negotiations.insert(
            id,
            NegotiationRecord {
                negotiation,
                version,
                updated_at: connector_core::now_iso8601(),
            },
        );
        Ok(version)
    }

    // ── Transfer processes ───────────────────────────────────────────────────

    async fn create_transfer_process(
        &self,
        snapshot: &mut Self::Snapshot,
        process: TransferProcess,
    ) -> Result<(), StorageError> {
        let id = process.id().to_string();
        self.lock_entity(snapshot, transfer_key(&id)).await?;
        if self.current_transfer(snapshot, &id)?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: EntityKind::TransferProcess,
                id,
            });
        }
        snapshot.transfers.insert(
            id,
            TransferProcessRecord {
                process,
                version: 0,
                updated_at: connector_core::now_iso8601(),
            },
        );
        Ok(())
    }

    async fn get_transfer_process_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: &str,
    ) -> Result<TransferProcessRecord, StorageError> {
        self.lock_entity(snapshot, transfer_key(id)).await?;
        self.current_transfer(snapshot, id)?
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::TransferProcess,
                id: id.to_string(),
            })
    }

    async fn update_transfer_process(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        process: TransferProcess,
    ) -> Result<i64, StorageError> {
        let id = process.id().to_string();
        self.lock_entity(snapshot, transfer_key(&id)).await?;
        let current = self
            .current_transfer(snapshot, &id)?
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::TransferProcess,
                id: id.clone(),
            })?;
        if current.version != expected_version {
            return Err(StorageError::ConcurrentConflict {
                kind: EntityKind::TransferProcess,
                id,
                expected_version,
            });
        }
        let version = current.version + 1;
        snapshot.transfers.insert(
            id,
            TransferProcessRecord {
                process,
                version,
                updated_at: connector_core::now_iso8601(),
            },
        );
        Ok(version)
    }

    // ── Provision data ───────────────────────────────────────────────────────

    async fn create_provision_data(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ProvisionDataRecord,
    ) -> Result<(), StorageError> {
        if self.provision_data_exists(snapshot, &record)? {
            return Err(StorageError::AlreadyExists {
                kind: EntityKind::ProvisionData,
                id: record.key(),
            });
        }
        let key = record.key();
        snapshot.provision_creates.insert(key.clone());
        snapshot.provision_data.insert(key, record);
        Ok(())
    }

    async fn update_provision_data(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ProvisionDataRecord,
    ) -> Result<(), StorageError> {
        if !self.provision_data_exists(snapshot, &record)? {
            return Err(StorageError::NotFound {
                kind: EntityKind::ProvisionData,
                id: record.key(),
            });
        }
        snapshot.provision_data.insert(record.key(), record);
        Ok(())
    }

    async fn delete_provision_data(
        &self,
        snapshot: &mut Self::Snapshot,
        process_id: &str,
    ) -> Result<usize, StorageError> {
        snapshot
            .provision_data
            .retain(|_, r| r.process_id != process_id);
        snapshot
            .provision_creates
            .retain(|key| !key.starts_with(&format!("{process_id}/")));
        let committed = self
            .tables()?
            .provision_data
            .values()
            .filter(|r| r.process_id == process_id)
            .count();
        snapshot.provision_deletes.insert(process_id.to_string());
        Ok(committed)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    async fn get_negotiation(&self, id: &str) -> Result<NegotiationRecord, StorageError> {
        self.tables()?
            .negotiations
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::Negotiation,
                id: id.to_string(),
            })
    }

    async fn list_negotiations(
        &self,
        state: Option<NegotiationState>,
        limit: usize,
    ) -> Result<Vec<NegotiationRecord>, StorageError> {
        let mut records: Vec<NegotiationRecord> = self
            .tables()?
            .negotiations
            .values()
            .filter(|r| state.map_or(true, |s| r.negotiation.state() == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.negotiation.state_timestamp());
        if limit > 0 {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn find_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<ContractAgreement>, StorageError> {
        Ok(self
            .tables()?
            .negotiations
            .values()
            .filter(|r| r.negotiation.state() == NegotiationState::Confirmed)
            .filter_map(|r| r.negotiation.agreement())
            .find(|a| a.id() == agreement_id)
            .cloned())
    }

    async fn get_transfer_process(&self, id: &str) -> Result<TransferProcessRecord, StorageError> {
        self.tables()?
            .transfers
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::TransferProcess,
                id: id.to_string(),
            })
    }

    async fn list_transfer_processes(
        &self,
        state: Option<TransferState>,
        limit: usize,
    ) -> Result<Vec<TransferProcessRecord>, StorageError> {
        let mut records: Vec<TransferProcessRecord> = self
            .tables()?
            .transfers
            .values()
            .filter(|r| state.map_or(true, |s| r.process.state() == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.process.state_timestamp());
        if limit > 0 {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn get_provision_data(
        &self,
        process_id: &str,
        resource_definition_id: &str,
    ) -> Result<Option<ProvisionDataRecord>, StorageError> {
        let key = format!("{process_id}/{resource_definition_id}");
        Ok(self.tables()?.provision_data.get(&key).cloned())
    }
}
