use crate::negotiation::NegotiationState;
use crate::transfer::TransferState;

/// A required field was missing or invalid when building an immutable domain object.
///
/// Construction either yields a fully valid value or this error; there is no
/// partially-built state to observe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("{object}: required field '{field}' is missing")]
    MissingField {
        object: &'static str,
        field: &'static str,
    },

    #[error("{object}: {message}")]
    Invalid {
        object: &'static str,
        message: String,
    },
}

impl BuildError {
    pub(crate) fn missing(object: &'static str, field: &'static str) -> Self {
        BuildError::MissingField { object, field }
    }

    pub(crate) fn invalid(object: &'static str, message: impl Into<String>) -> Self {
        BuildError::Invalid {
            object,
            message: message.into(),
        }
    }
}

/// A state machine refused a transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("negotiation {id}: illegal transition {from:?} -> {to:?}")]
    Negotiation {
        id: String,
        from: NegotiationState,
        to: NegotiationState,
    },

    #[error("transfer process {id}: illegal transition {from:?} -> {to:?}")]
    Transfer {
        id: String,
        from: TransferState,
        to: TransferState,
    },

    #[error("negotiation {id}: agreement cannot be attached in state {state:?}")]
    AgreementNotAttachable { id: String, state: NegotiationState },
}
