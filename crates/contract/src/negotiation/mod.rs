//! Contract negotiation: the consumer and provider managers and the protocol
//! they speak.
//!
//! Each side persists its own [`ContractNegotiation`]. Inbound messages are
//! applied under the negotiation's row lock and guarded by the history hash:
//! a message is only applied if it echoes the recipient's current hash, so a
//! sender acting on a stale view gets `Conflict` and resends later. Outbound
//! messages are sent by a polling loop ([`StateProcessor`]) that never holds
//! a row lock across the network call.
//!
//! [`ContractNegotiation`]: connector_core::ContractNegotiation
//! [`StateProcessor`]: connector_core::StateProcessor

mod common;
mod consumer;
mod endpoint;
mod loopback;
mod message;
mod provider;
mod transport;


use async_trait::async_trait;
use connector_core::{ContractNegotiation, ContractOffer};

pub use consumer::ConsumerNegotiationManager;
pub use endpoint::NegotiationEndpoint;
pub use loopback::{LoopbackDispatcher, LoopbackNetwork, LOOPBACK_PROTOCOL};
pub use message::{
    ContractOfferRequest, MessageHeader, NegotiationMessage, NegotiationResponse, ProtocolMessage,
    ResponseStatus,
};
pub use provider::ProviderNegotiationManager;
pub use transport::{Dispatcher, DispatcherRegistry, ProtocolHandler};

// ── Decisions ────────────────────────────────────────────────────────

/// What to do with an offer that validated.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferDecision {
    /// Provider: agree on the offer. Consumer: approve it.
    Accept,
    /// Answer with different terms.
    Counter(ContractOffer),
    Decline(String),
    /// Leave the negotiation waiting for a manual approve, counter, or decline.
    Defer,
}

/// Chooses how a manager answers a validated offer.
///
/// Called inside the negotiation's transaction; must not block.
pub trait OfferDecisionPolicy: Send + Sync {
    fn decide(&self, negotiation: &ContractNegotiation, offer: &ContractOffer) -> OfferDecision;
}

/// Accepts every offer that validated.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl OfferDecisionPolicy for AcceptAll {
    fn decide(&self, _: &ContractNegotiation, _: &ContractOffer) -> OfferDecision {
        OfferDecision::Accept
    }
}

/// Defers every offer to a manual decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferAll;

impl OfferDecisionPolicy for DeferAll {
    fn decide(&self, _: &ContractNegotiation, _: &ContractOffer) -> OfferDecision {
        OfferDecision::Defer
    }
}

impl<F> OfferDecisionPolicy for F
where
    F: Fn(&ContractNegotiation, &ContractOffer) -> OfferDecision + Send + Sync,
{
    fn decide(&self, negotiation: &ContractNegotiation, offer: &ContractOffer) -> OfferDecision {
        self(negotiation, offer)
    }
}

// ── Listeners ────────────────────────────────────────────────────────

/// Observes negotiations reaching a terminal state. Called after the
/// transition is committed.
#[async_trait]
pub trait NegotiationListener: Send + Sync {
    async fn confirmed(&self, _negotiation: &ContractNegotiation) {}

    async fn declined(&self, _negotiation: &ContractNegotiation) {}

    async fn failed(&self, _negotiation: &ContractNegotiation) {}
}
