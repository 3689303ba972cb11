use connector_core::{BuildError, TransferState, TransitionError};
use connector_storage::StorageError;

/// Why a provisioner could not create or remove a resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// Worth another attempt.
    #[error("provisioning failed: {0}")]
    Transient(String),

    #[error("provisioning failed permanently: {0}")]
    Permanent(String),

    /// The context has no provision data store behind it.
    #[error("provision data is not supported here")]
    Unsupported,

    #[error("provision data store: {0}")]
    Store(String),

    /// The provisioner dropped its context without reporting.
    #[error("provisioner abandoned the request")]
    Abandoned,
}

impl ProvisionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Transient(_) | ProvisionError::Abandoned)
    }
}

impl From<StorageError> for ProvisionError {
    fn from(e: StorageError) -> Self {
        ProvisionError::Store(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("vault backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("no confirmed agreement '{0}'")]
    UnknownAgreement(String),

    #[error("agreement '{agreement}' does not cover asset '{asset}'")]
    AssetNotCovered { agreement: String, asset: String },

    #[error("agreement '{0}' is not active")]
    AgreementInactive(String),

    #[error("transfer process {id} is {state:?}")]
    InvalidState { id: String, state: TransferState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_abandoned_failures_retry() {
        assert!(ProvisionError::Transient("quota".into()).is_retryable());
        assert!(ProvisionError::Abandoned.is_retryable());
        assert!(!ProvisionError::Permanent("bad bucket name".into()).is_retryable());
        assert!(!ProvisionError::Unsupported.is_retryable());
    }
}
