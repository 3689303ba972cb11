use connector_core::{ContractNegotiation, TransferProcess};
use serde::{Deserialize, Serialize};

/// A negotiation as stored, with its concurrency version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRecord {
    pub negotiation: ContractNegotiation,
    /// 0 at creation, incremented by every committed update.
    pub version: i64,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub updated_at: String,
}

/// A transfer process as stored, with its concurrency version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProcessRecord {
    pub process: TransferProcess,
    pub version: i64,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub updated_at: String,
}

/// Auxiliary state a provisioner keeps for an in-flight request, keyed by
/// transfer process and resource definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionDataRecord {
    pub process_id: String,
    pub resource_definition_id: String,
    pub data: serde_json::Value,
}

impl ProvisionDataRecord {
    pub fn new(
        process_id: impl Into<String>,
        resource_definition_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            resource_definition_id: resource_definition_id.into(),
            data,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.process_id, self.resource_definition_id)
    }
}
