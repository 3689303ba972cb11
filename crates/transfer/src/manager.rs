use std::sync::Arc;

use async_trait::async_trait;
use connector_core::{
    retry_due, DataRequest, ProcessSummary, ProvisionedEntry, ProvisionedResource,
    ResourceDefinition, SecretToken, StateProcessor, TransferProcess, TransferState,
};
use connector_storage::{ConnectorStorage, TransferProcessRecord};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{ProvisionError, TransferError, VaultError};
use crate::provision::{
    DeprovisionContext, EventSender, ProvisionContext, ProvisionDataStore, ProvisionEvent,
    Provisioner, ProvisionerRegistry, StorageProvisionData,
};
use crate::vault::Vault;

/// Appended to a resource id to form the vault key of its credential.
pub const SECRET_KEY_SUFFIX: &str = "-secret";

enum Mutation<R> {
    Commit(R),
    Discard(R),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Changed,
    Retrying,
    Ignored,
}

type ProvisionTask = (Arc<dyn Provisioner>, ResourceDefinition);
type DeprovisionTask = (Arc<dyn Provisioner>, ProvisionedResource);

/// Drives transfer processes through provisioning and deprovisioning.
///
/// Each dispatch pass first applies whatever provisioners reported since
/// the last pass, then starts work for processes in `Initial` and
/// `Completed` and re-issues failed requests whose backoff has elapsed.
/// Reports are applied under the process's row lock, so a report racing a
/// dispatch pass is serialized with it.
pub struct TransferProcessManager<S> {
    storage: Arc<S>,
    provisioners: Arc<ProvisionerRegistry>,
    vault: Arc<dyn Vault>,
    data: Arc<dyn ProvisionDataStore>,
    config: TransferConfig,
    events_tx: EventSender,
    events_rx: Mutex<mpsc::UnboundedReceiver<ProvisionEvent>>,
}

impl<S: ConnectorStorage> TransferProcessManager<S> {
    pub fn new(
        storage: Arc<S>,
        provisioners: Arc<ProvisionerRegistry>,
        vault: Arc<dyn Vault>,
        config: TransferConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let data = Arc::new(StorageProvisionData::new(storage.clone()));
        Self {
            storage,
            provisioners,
            vault,
            data,
            config,
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start a transfer of `request.asset_id` under the agreement
    /// `request.contract_id`. Returns the new process id.
    ///
    /// The agreement must belong to a confirmed negotiation in this
    /// connector's storage, cover the asset, and be in force now.
    pub async fn initiate(
        &self,
        request: DataRequest,
        manifest: Vec<ResourceDefinition>,
    ) -> Result<String, TransferError> {
        let agreement = self
            .storage
            .find_agreement(&request.contract_id)
            .await?
            .ok_or_else(|| TransferError::UnknownAgreement(request.contract_id.clone()))?;
        if !agreement.covers_asset(&request.asset_id) {
            return Err(TransferError::AssetNotCovered {
                agreement: request.contract_id,
                asset: request.asset_id,
            });
        }
        if !agreement.is_active_at(connector_core::now_secs()) {
            return Err(TransferError::AgreementInactive(request.contract_id));
        }

        let process = TransferProcess::new(Uuid::new_v4().to_string(), request, manifest)?;
        let id = process.id().to_string();
        let storage = self.storage.as_ref();
        let mut snapshot = storage.begin_snapshot().await?;
        if let Err(e) = storage.create_transfer_process(&mut snapshot, process).await {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        storage.commit_snapshot(snapshot).await?;
        tracing::info!(process_id = %id, "transfer process initiated");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<TransferProcess, TransferError> {
        Ok(self.storage.get_transfer_process(id).await?.process)
    }

    /// The transfer is done with its resources; the next pass tears them
    /// down.
    pub async fn complete(&self, id: &str) -> Result<(), TransferError> {
        self.with_process(id, |p| {
            if p.state() != TransferState::Provisioned {
                return Err(TransferError::InvalidState {
                    id: p.id().to_string(),
                    state: p.state(),
                });
            }
            p.transition_to(TransferState::Completed)?;
            Ok(Mutation::Commit(()))
        })
        .await
    }

    /// Re-issue the requests of processes caught mid-flight by a restart.
    ///
    /// Meant to run once before the dispatch loop starts: requests issued
    /// by this manager instance are still in flight and would be issued
    /// twice. Provisioners pick up their earlier state through
    /// [`ProvisionContext::find`]. Returns how many requests were issued.
    pub async fn recover(&self) -> Result<usize, TransferError> {
        let mut issued = 0;
        for record in self
            .storage
            .list_transfer_processes(Some(TransferState::Provisioning), 0)
            .await?
        {
            let id = record.process.id().to_string();
            // Queued retries are covered by re-issuing everything outstanding.
            let pending = self
                .with_process(&id, |p| {
                    if p.state() != TransferState::Provisioning {
                        return Ok(Mutation::Discard(Vec::new()));
                    }
                    let pending: Vec<ResourceDefinition> =
                        p.unprovisioned().into_iter().cloned().collect();
                    if p.take_retries().is_empty() {
                        Ok(Mutation::Discard(pending))
                    } else {
                        Ok(Mutation::Commit(pending))
                    }
                })
                .await?;
            for definition in pending {
                match self.provisioners.get(&definition.kind) {
                    Some(provisioner) => {
                        self.spawn_provision(&id, provisioner, definition);
                        issued += 1;
                    }
                    None => tracing::error!(
                        process_id = %id,
                        kind = %definition.kind,
                        "cannot recover provisioning: no provisioner for kind"
                    ),
                }
            }
        }
        for record in self
            .storage
            .list_transfer_processes(Some(TransferState::Deprovisioning), 0)
            .await?
        {
            for (provisioner, resource) in self.deprovision_tasks(&record.process) {
                self.spawn_deprovision(record.process.id(), provisioner, resource);
                issued += 1;
            }
        }
        if issued > 0 {
            tracing::info!(requests = issued, "re-issued in-flight provisioning");
        }
        Ok(issued)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Issue provisioning for every unprovisioned resource of an `Initial`
    /// process. `Provisioning` is committed before any request goes out.
    async fn start_provisioning(&self, id: &str) -> Result<bool, TransferError> {
        let provisioners = self.provisioners.as_ref();
        let tasks = self
            .with_process(id, |p| {
                if p.state() != TransferState::Initial {
                    return Ok(Mutation::Discard(None));
                }
                let pending: Vec<ResourceDefinition> =
                    p.unprovisioned().into_iter().cloned().collect();
                let mut tasks: Vec<ProvisionTask> = Vec::with_capacity(pending.len());
                for definition in pending {
                    let Some(provisioner) = provisioners.get(&definition.kind) else {
                        let detail = format!("no provisioner for resource kind '{}'", definition.kind);
                        tracing::error!(process_id = %p.id(), detail = %detail, "transfer process failed");
                        p.transition_error(detail)?;
                        return Ok(Mutation::Commit(Some(Vec::new())));
                    };
                    tasks.push((provisioner, definition));
                }
                p.transition_to(TransferState::Provisioning)?;
                if tasks.is_empty() {
                    p.transition_to(TransferState::Provisioned)?;
                }
                Ok(Mutation::Commit(Some(tasks)))
            })
            .await?;

        let Some(tasks) = tasks else {
            return Ok(false);
        };
        for (provisioner, definition) in tasks {
            self.spawn_provision(id, provisioner, definition);
        }
        Ok(true)
    }

    /// Re-issue the failed requests of a `Provisioning` process once its
    /// backoff has elapsed. Requests still in flight are not touched.
    async fn retry_provisioning(&self, id: &str) -> Result<bool, TransferError> {
        let provisioners = self.provisioners.as_ref();
        let base_millis = self.config.retry_base_millis;
        let now = connector_core::now_millis();
        let tasks = self
            .with_process(id, |p| {
                if p.state() != TransferState::Provisioning
                    || p.retrying().is_empty()
                    || !retry_due(p.state_timestamp(), p.retry_count(), base_millis, now)
                {
                    return Ok(Mutation::Discard(None));
                }
                let mut tasks: Vec<ProvisionTask> = Vec::new();
                for definition in p.take_retries() {
                    let Some(provisioner) = provisioners.get(&definition.kind) else {
                        let detail = format!("no provisioner for resource kind '{}'", definition.kind);
                        tracing::error!(process_id = %p.id(), detail = %detail, "transfer process failed");
                        p.transition_error(detail)?;
                        return Ok(Mutation::Commit(Some(Vec::new())));
                    };
                    tasks.push((provisioner, definition));
                }
                tracing::info!(
                    process_id = %p.id(),
                    attempt = p.retry_count(),
                    requests = tasks.len(),
                    "re-issuing failed provisioning"
                );
                Ok(Mutation::Commit(Some(tasks)))
            })
            .await?;

        let Some(tasks) = tasks else {
            return Ok(false);
        };
        for (provisioner, definition) in tasks {
            self.spawn_provision(id, provisioner, definition);
        }
        Ok(true)
    }

    /// Issue deprovisioning for every live resource of a `Completed`
    /// process.
    async fn start_deprovisioning(&self, id: &str) -> Result<bool, TransferError> {
        let provisioners = self.provisioners.as_ref();
        let tasks = self
            .with_process(id, |p| {
                if p.state() != TransferState::Completed {
                    return Ok(Mutation::Discard(None));
                }
                let live: Vec<(String, ProvisionedResource)> = p
                    .provisioned()
                    .iter()
                    .filter(|e| !e.deprovisioned)
                    .map(|e| (kind_of(p, &e.resource), e.resource.clone()))
                    .collect();
                let mut tasks: Vec<DeprovisionTask> = Vec::with_capacity(live.len());
                for (kind, resource) in live {
                    let Some(provisioner) = provisioners.get(&kind) else {
                        let detail = format!("no provisioner for resource kind '{kind}'");
                        tracing::error!(process_id = %p.id(), detail = %detail, "transfer process failed");
                        p.transition_error(detail)?;
                        return Ok(Mutation::Commit(Some(Vec::new())));
                    };
                    tasks.push((provisioner, resource));
                }
                p.transition_to(TransferState::Deprovisioning)?;
                if tasks.is_empty() {
                    p.transition_to(TransferState::Deprovisioned)?;
                }
                Ok(Mutation::Commit(Some(tasks)))
            })
            .await?;

        let Some(tasks) = tasks else {
            return Ok(false);
        };
        for (provisioner, resource) in tasks {
            self.spawn_deprovision(id, provisioner, resource);
        }
        Ok(true)
    }

    fn deprovision_tasks(&self, process: &TransferProcess) -> Vec<DeprovisionTask> {
        process
            .provisioned()
            .iter()
            .filter(|e| !e.deprovisioned)
            .filter_map(|entry| {
                let provisioner = self.provisioners.get(&kind_of(process, &entry.resource))?;
                Some((provisioner, entry.resource.clone()))
            })
            .collect()
    }

    fn spawn_provision(
        &self,
        process_id: &str,
        provisioner: Arc<dyn Provisioner>,
        definition: ResourceDefinition,
    ) {
        tracing::debug!(
            process_id,
            definition_id = %definition.id,
            kind = %definition.kind,
            "provisioning resource"
        );
        let context = ProvisionContext::new(
            process_id,
            definition.id.clone(),
            self.events_tx.clone(),
            Some(self.data.clone()),
        );
        tokio::spawn(async move { provisioner.provision(definition, context).await });
    }

    fn spawn_deprovision(
        &self,
        process_id: &str,
        provisioner: Arc<dyn Provisioner>,
        resource: ProvisionedResource,
    ) {
        tracing::debug!(process_id, resource_id = %resource.id, "deprovisioning resource");
        let context =
            DeprovisionContext::new(process_id, resource.id.clone(), self.events_tx.clone());
        tokio::spawn(async move { provisioner.deprovision(resource, context).await });
    }

    // ── Reports ──────────────────────────────────────────────────────

    async fn drain_events(&self) -> Vec<ProvisionEvent> {
        let mut rx = self.events_rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn apply(&self, event: ProvisionEvent) -> Result<Applied, TransferError> {
        let process_id = match &event {
            ProvisionEvent::Provisioned { process_id, .. }
            | ProvisionEvent::ProvisionFailed { process_id, .. }
            | ProvisionEvent::Deprovisioned { process_id, .. } => process_id.clone(),
        };
        let result = match event {
            ProvisionEvent::Provisioned {
                process_id,
                entry,
                secret,
            } => self.provisioned(&process_id, entry, secret).await,
            ProvisionEvent::ProvisionFailed {
                process_id,
                definition_id,
                error,
            } => self.provision_failed(&process_id, &definition_id, error).await,
            ProvisionEvent::Deprovisioned {
                process_id,
                resource_id,
                error,
            } => self.deprovisioned(&process_id, &resource_id, error).await,
        };
        match result {
            Err(TransferError::Storage(e)) if e.is_not_found() => {
                tracing::warn!(process_id = %process_id, "report for unknown transfer process");
                Ok(Applied::Ignored)
            }
            other => other,
        }
    }

    async fn provisioned(
        &self,
        process_id: &str,
        mut entry: ProvisionedEntry,
        secret: Option<SecretToken>,
    ) -> Result<Applied, TransferError> {
        // The credential is in the vault before anything refers to it.
        let secret_key = match secret {
            Some(secret) => {
                let key = format!("{}{SECRET_KEY_SUFFIX}", entry.resource.id);
                let value = serde_json::to_string(&secret)
                    .map_err(|e| VaultError::Backend(e.to_string()))?;
                self.vault.store_secret(&key, &value).await?;
                Some(key)
            }
            None => None,
        };
        entry.secret_key = secret_key.clone();
        let resource_id = entry.resource.id.clone();

        let result = self
            .with_process(process_id, |p| {
                if p.state() != TransferState::Provisioning {
                    tracing::debug!(process_id = %p.id(), state = ?p.state(), "late provisioning report ignored");
                    return Ok(Mutation::Discard((Applied::Ignored, false)));
                }
                if !p.add_provisioned(entry) {
                    tracing::debug!(process_id = %p.id(), resource_id = %resource_id, "duplicate provisioning report ignored");
                    return Ok(Mutation::Discard((Applied::Ignored, false)));
                }
                let done = p.state() == TransferState::Provisioning && p.is_fully_provisioned();
                if done {
                    p.transition_to(TransferState::Provisioned)?;
                    tracing::info!(process_id = %p.id(), "transfer process provisioned");
                }
                Ok(Mutation::Commit((Applied::Changed, done)))
            })
            .await;

        let (applied, done) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_secret(secret_key.as_deref()).await;
                return Err(e);
            }
        };
        if applied == Applied::Ignored {
            self.discard_secret(secret_key.as_deref()).await;
        }
        if done {
            self.delete_provision_data(process_id).await;
        }
        Ok(applied)
    }

    async fn provision_failed(
        &self,
        process_id: &str,
        definition_id: &str,
        error: ProvisionError,
    ) -> Result<Applied, TransferError> {
        let max_retries = self.config.max_retries;
        self.with_process(process_id, |p| {
            if p.state() != TransferState::Provisioning {
                tracing::debug!(process_id = %p.id(), state = ?p.state(), "late provisioning failure ignored");
                return Ok(Mutation::Discard(Applied::Ignored));
            }
            if error.is_retryable() && p.retry_count() < max_retries {
                let attempt = p.schedule_retry(definition_id);
                tracing::warn!(
                    process_id = %p.id(),
                    definition_id,
                    attempt,
                    error = %error,
                    "provisioning failed; will retry"
                );
                return Ok(Mutation::Commit(Applied::Retrying));
            }
            tracing::error!(process_id = %p.id(), definition_id, error = %error, "provisioning failed");
            p.transition_error(format!("resource definition '{definition_id}': {error}"))?;
            Ok(Mutation::Commit(Applied::Changed))
        })
        .await
    }

    async fn deprovisioned(
        &self,
        process_id: &str,
        resource_id: &str,
        error: Option<ProvisionError>,
    ) -> Result<Applied, TransferError> {
        let (applied, secret_key) = self
            .with_process(process_id, |p| {
                if p.state() != TransferState::Deprovisioning {
                    tracing::debug!(process_id = %p.id(), state = ?p.state(), "late deprovisioning report ignored");
                    return Ok(Mutation::Discard((Applied::Ignored, None)));
                }
                if let Some(error) = error {
                    tracing::error!(process_id = %p.id(), resource_id, error = %error, "deprovisioning failed");
                    p.transition_error(format!("deprovisioning '{resource_id}': {error}"))?;
                    return Ok(Mutation::Commit((Applied::Changed, None)));
                }
                let secret_key = p
                    .provisioned()
                    .iter()
                    .find(|e| e.resource.id == resource_id)
                    .and_then(|e| e.secret_key.clone());
                if !p.mark_deprovisioned(resource_id) {
                    return Ok(Mutation::Discard((Applied::Ignored, None)));
                }
                if p.is_fully_deprovisioned() {
                    p.transition_to(TransferState::Deprovisioned)?;
                    tracing::info!(process_id = %p.id(), "transfer process deprovisioned");
                }
                Ok(Mutation::Commit((Applied::Changed, secret_key)))
            })
            .await?;
        self.discard_secret(secret_key.as_deref()).await;
        Ok(applied)
    }

    async fn discard_secret(&self, key: Option<&str>) {
        let Some(key) = key else { return };
        if let Err(e) = self.vault.delete_secret(key).await {
            tracing::warn!(key, error = %e, "failed to delete secret");
        }
    }

    async fn delete_provision_data(&self, process_id: &str) {
        let storage = self.storage.as_ref();
        let result = async {
            let mut snapshot = storage.begin_snapshot().await?;
            if let Err(e) = storage.delete_provision_data(&mut snapshot, process_id).await {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
            storage.commit_snapshot(snapshot).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(process_id, error = %e, "failed to delete provision data");
        }
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Lock the process, run `f` on it, and commit or abort as `f` asks.
    async fn with_process<R, F>(&self, id: &str, f: F) -> Result<R, TransferError>
    where
        F: FnOnce(&mut TransferProcess) -> Result<Mutation<R>, TransferError> + Send,
        R: Send,
    {
        let storage = self.storage.as_ref();
        let mut snapshot = storage.begin_snapshot().await?;
        let record = match storage.get_transfer_process_for_update(&mut snapshot, id).await {
            Ok(record) => record,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        };
        let TransferProcessRecord {
            mut process,
            version,
            ..
        } = record;

        let mutation = match f(&mut process) {
            Ok(mutation) => mutation,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };
        match mutation {
            Mutation::Discard(result) => {
                storage.abort_snapshot(snapshot).await?;
                Ok(result)
            }
            Mutation::Commit(result) => {
                if let Err(e) = storage
                    .update_transfer_process(&mut snapshot, version, process)
                    .await
                {
                    let _ = storage.abort_snapshot(snapshot).await;
                    return Err(e.into());
                }
                storage.commit_snapshot(snapshot).await?;
                Ok(result)
            }
        }
    }

    async fn ids_in(&self, state: TransferState) -> Vec<String> {
        match self
            .storage
            .list_transfer_processes(Some(state), self.config.batch_size)
            .await
        {
            Ok(records) => records.into_iter().map(|r| r.process.id().to_string()).collect(),
            Err(e) => {
                tracing::error!(state = ?state, error = %e, "failed to list transfer processes");
                Vec::new()
            }
        }
    }

    /// `Provisioning` processes with a queued retry that is due.
    async fn retry_candidates(&self) -> Vec<String> {
        let now = connector_core::now_millis();
        let base_millis = self.config.retry_base_millis;
        match self
            .storage
            .list_transfer_processes(Some(TransferState::Provisioning), 0)
            .await
        {
            Ok(records) => records
                .into_iter()
                .map(|r| r.process)
                .filter(|p| {
                    !p.retrying().is_empty()
                        && retry_due(p.state_timestamp(), p.retry_count(), base_millis, now)
                })
                .take(self.config.batch_size)
                .map(|p| p.id().to_string())
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "failed to list provisioning transfer processes");
                Vec::new()
            }
        }
    }
}

/// The kind of the manifest entry a resource was provisioned for.
fn kind_of(process: &TransferProcess, resource: &ProvisionedResource) -> String {
    process
        .manifest()
        .iter()
        .find(|d| d.id == resource.resource_definition_id)
        .map(|d| d.kind.clone())
        .unwrap_or_default()
}

#[async_trait]
impl<S: ConnectorStorage> StateProcessor for TransferProcessManager<S> {
    fn name(&self) -> &str {
        "transfer-process"
    }

    async fn process(&self) -> ProcessSummary {
        let mut summary = ProcessSummary::default();

        for event in self.drain_events().await {
            match self.apply(event).await {
                Ok(Applied::Changed) => summary.processed += 1,
                Ok(Applied::Retrying) => summary.failed += 1,
                Ok(Applied::Ignored) => {}
                Err(e) => {
                    tracing::error!(error = %e, "failed to apply provisioning report");
                    summary.failed += 1;
                }
            }
        }

        for id in self.ids_in(TransferState::Initial).await {
            match self.start_provisioning(&id).await {
                Ok(true) => summary.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(process_id = %id, error = %e, "failed to start provisioning");
                    summary.failed += 1;
                }
            }
        }
        for id in self.retry_candidates().await {
            match self.retry_provisioning(&id).await {
                Ok(true) => summary.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(process_id = %id, error = %e, "failed to re-issue provisioning");
                    summary.failed += 1;
                }
            }
        }
        for id in self.ids_in(TransferState::Completed).await {
            match self.start_deprovisioning(&id).await {
                Ok(true) => summary.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(process_id = %id, error = %e, "failed to start deprovisioning");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
