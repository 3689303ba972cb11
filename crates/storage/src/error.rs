use std::fmt;

/// The kind of stored entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Negotiation,
    TransferProcess,
    ProvisionData,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Negotiation => "negotiation",
            EntityKind::TransferProcess => "transfer process",
            EntityKind::ProvisionData => "provision data",
        };
        f.write_str(s)
    }
}

/// All errors that can be returned by a ConnectorStorage implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: the stored version is not the
    /// one the caller read.
    #[error("concurrent conflict on {kind} {id}: expected version {expected_version}")]
    ConcurrentConflict {
        kind: EntityKind,
        id: String,
        expected_version: i64,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: EntityKind, id: String },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::ConcurrentConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
