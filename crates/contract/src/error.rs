use connector_core::{BuildError, TransitionError};
use connector_storage::StorageError;

/// Errors surfaced by the negotiation managers.
///
/// Protocol-level refusals (stale hash, illegal state, failed validation) are
/// not errors: they come back as a [`NegotiationResponse`] status. These are
/// the infrastructure failures that abort the surrounding snapshot.
///
/// [`NegotiationResponse`]: crate::NegotiationResponse
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("invalid offer: {0}")]
    InvalidOffer(String),
}

/// Failure to deliver a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no dispatcher registered for protocol '{0}'")]
    UnknownProtocol(String),

    #[error("no endpoint listening at '{0}'")]
    Unreachable(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl DispatchError {
    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::UnknownProtocol(_))
    }
}
