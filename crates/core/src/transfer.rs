//! Transfer processes and the resources provisioned for them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Initial,
    Provisioning,
    Provisioned,
    Completed,
    Deprovisioning,
    Deprovisioned,
    Error,
}

impl TransferState {
    pub fn code(self) -> i32 {
        match self {
            TransferState::Initial => 100,
            TransferState::Provisioning => 200,
            TransferState::Provisioned => 300,
            TransferState::Completed => 800,
            TransferState::Deprovisioning => 900,
            TransferState::Deprovisioned => 1000,
            TransferState::Error => -1,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Deprovisioned | TransferState::Error)
    }

    pub fn can_transition_to(self, to: TransferState) -> bool {
        use TransferState::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Error) => true,
            (Initial, Provisioning) => true,
            (Provisioning, Provisioned) => true,
            (Provisioned, Completed) => true,
            (Completed, Deprovisioning) => true,
            (Deprovisioning, Deprovisioned) => true,
            _ => false,
        }
    }
}

/// Where data is read from or written to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A request to move one asset under an agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub id: String,
    pub asset_id: String,
    /// The agreement id authorizing the transfer.
    pub contract_id: String,
    pub destination: DataAddress,
}

/// A resource that must exist before data can move, e.g. a destination bucket.
///
/// `kind` selects the provisioner responsible for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub transfer_process_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ResourceDefinition {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            transfer_process_id: String::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// Record of infrastructure created for a transfer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub id: String,
    pub transfer_process_id: String,
    pub resource_definition_id: String,
    /// Provider-specific identifiers (container name, request id, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A provisioned resource that is also the transfer's data destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedDataDestinationResource {
    pub resource: ProvisionedResource,
    pub destination: DataAddress,
}

/// A credential issued for a provisioned resource. Stored in the vault only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretToken {
    pub value: String,
    #[serde(default)]
    pub expiration: Option<i64>,
}

/// A provisioned resource as tracked on its transfer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedEntry {
    pub resource: ProvisionedResource,
    #[serde(default)]
    pub destination: Option<DataAddress>,
    /// Vault key of the resource's credential, never the credential itself.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub deprovisioned: bool,
}

/// Durable state of one data transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    id: String,
    data_request: DataRequest,
    state: TransferState,
    state_count: u32,
    state_timestamp: i64,
    retry_count: u32,
    manifest: Vec<ResourceDefinition>,
    provisioned: Vec<ProvisionedEntry>,
    /// Definitions whose provisioning failed and waits to be re-issued.
    #[serde(default)]
    retrying: Vec<String>,
    error_detail: Option<String>,
}

impl TransferProcess {
    pub fn new(
        id: impl Into<String>,
        data_request: DataRequest,
        manifest: Vec<ResourceDefinition>,
    ) -> Result<Self, BuildError> {
        const OBJECT: &str = "TransferProcess";
        let id = id.into();
        if id.is_empty() {
            return Err(BuildError::missing(OBJECT, "id"));
        }
        if data_request.contract_id.is_empty() {
            return Err(BuildError::missing(OBJECT, "data_request.contract_id"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for definition in &manifest {
            if !seen.insert(definition.id.as_str()) {
                return Err(BuildError::invalid(
                    OBJECT,
                    format!("duplicate resource definition '{}'", definition.id),
                ));
            }
        }
        let manifest = manifest
            .into_iter()
            .map(|mut d| {
                d.transfer_process_id = id.clone();
                d
            })
            .collect();
        Ok(Self {
            id,
            data_request,
            state: TransferState::Initial,
            state_count: 0,
            state_timestamp: crate::now_millis(),
            retry_count: 0,
            manifest,
            provisioned: Vec::new(),
            retrying: Vec::new(),
            error_detail: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data_request(&self) -> &DataRequest {
        &self.data_request
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn state_count(&self) -> u32 {
        self.state_count
    }

    pub fn state_timestamp(&self) -> i64 {
        self.state_timestamp
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn manifest(&self) -> &[ResourceDefinition] {
        &self.manifest
    }

    pub fn provisioned(&self) -> &[ProvisionedEntry] {
        &self.provisioned
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// The first provisioned data destination, if any.
    pub fn destination(&self) -> Option<&DataAddress> {
        self.provisioned.iter().find_map(|e| e.destination.as_ref())
    }

    pub fn transition_to(&mut self, to: TransferState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError::Transfer {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.state_count += 1;
        self.state_timestamp = crate::now_millis();
        if to != TransferState::Provisioning {
            self.retrying.clear();
        }
        Ok(())
    }

    pub fn transition_error(&mut self, detail: impl Into<String>) -> Result<(), TransitionError> {
        self.transition_to(TransferState::Error)?;
        self.error_detail = Some(detail.into());
        Ok(())
    }

    /// Count a failed provisioning request. Returns the new count.
    pub fn record_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.state_timestamp = crate::now_millis();
        self.retry_count
    }

    /// Count a failed request for `definition_id` and queue the definition
    /// to be provisioned again. Other requests still in flight are left
    /// alone. Returns the new retry count.
    pub fn schedule_retry(&mut self, definition_id: &str) -> u32 {
        if !self.retrying.iter().any(|d| d == definition_id) {
            self.retrying.push(definition_id.to_string());
        }
        self.record_retry()
    }

    /// Definitions queued by [`schedule_retry`](Self::schedule_retry).
    pub fn retrying(&self) -> &[String] {
        &self.retrying
    }

    /// Empty the retry queue, returning the definitions that are still
    /// unprovisioned.
    pub fn take_retries(&mut self) -> Vec<ResourceDefinition> {
        let retrying = std::mem::take(&mut self.retrying);
        self.unprovisioned()
            .into_iter()
            .filter(|d| retrying.contains(&d.id))
            .cloned()
            .collect()
    }

    /// Definitions that have no provisioned resource yet.
    pub fn unprovisioned(&self) -> Vec<&ResourceDefinition> {
        self.manifest
            .iter()
            .filter(|d| {
                !self
                    .provisioned
                    .iter()
                    .any(|e| e.resource.resource_definition_id == d.id)
            })
            .collect()
    }

    pub fn is_fully_provisioned(&self) -> bool {
        self.unprovisioned().is_empty()
    }

    /// Record a provisioned resource. Returns `false` if its definition was
    /// already provisioned or is not part of the manifest.
    pub fn add_provisioned(&mut self, entry: ProvisionedEntry) -> bool {
        let definition_id = &entry.resource.resource_definition_id;
        let known = self.manifest.iter().any(|d| &d.id == definition_id);
        let duplicate = self
            .provisioned
            .iter()
            .any(|e| &e.resource.resource_definition_id == definition_id);
        if !known || duplicate {
            return false;
        }
        self.provisioned.push(entry);
        true
    }

    /// Mark a resource deprovisioned. Returns `false` if unknown or already done.
    pub fn mark_deprovisioned(&mut self, resource_id: &str) -> bool {
        match self
            .provisioned
            .iter_mut()
            .find(|e| e.resource.id == resource_id && !e.deprovisioned)
        {
            Some(entry) => {
                entry.deprovisioned = true;
                true
            }
            None => false,
        }
    }

    pub fn is_fully_deprovisioned(&self) -> bool {
        self.provisioned.iter().all(|e| e.deprovisioned)
    }
}
