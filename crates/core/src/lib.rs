//! connector-core: domain model of the dataspace connector.
//!
//! Holds the types both negotiation sides and the transfer subsystem agree
//! on, plus the two pieces of machinery they share:
//!
//! - [`ContractNegotiation`] -- the negotiation aggregate and its state machine
//! - [`TransferProcess`] -- a data transfer and its provisioned resources
//! - [`ContractAgreement`] -- built only through its validating builder
//! - [`WaitStrategy`] / [`StateMachineLoop`] -- polling and backoff for the
//!   dispatch loops

pub mod agent;
pub mod asset;
pub mod contract;
pub mod error;
pub mod hash;
pub mod negotiation;
pub mod policy;
pub mod state_loop;
pub mod transfer;
pub mod wait;

// ── Convenience re-exports ───────────────────────────────────────────

pub use agent::{ClaimToken, ParticipantAgent};
pub use asset::{Asset, AssetSelectorExpression, Criterion, ASSET_ID_PROPERTY};
pub use contract::{
    definition_id_of, ContractAgreement, ContractAgreementBuilder, ContractDefinition,
    ContractOffer, CONTRACT_ID_SEPARATOR,
};
pub use error::{BuildError, TransitionError};
pub use hash::content_hash;
pub use negotiation::{
    ContractNegotiation, CounterParty, MessageOutcome, NegotiationRole, NegotiationState,
};
pub use policy::{Constraint, Operator, Permission, Policy, Prohibition};
pub use state_loop::{ProcessSummary, StateMachineLoop, StateProcessor};
pub use transfer::{
    DataAddress, DataRequest, ProvisionedDataDestinationResource, ProvisionedEntry,
    ProvisionedResource, ResourceDefinition, SecretToken, TransferProcess, TransferState,
};
pub use wait::{
    retry_backoff_millis, retry_due, ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy,
};

// ── Clock ────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000) as i64
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// UTC timestamp in `YYYY-MM-DDTHH:MM:SSZ` form.
pub fn now_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
