//! connector-contract: what a connector offers and how it negotiates it.
//!
//! - [`ContractDefinitionService`] / [`ContractOfferService`] -- which
//!   definitions a participant may see and the offers projected from them
//! - [`ContractValidationService`] -- re-derivation of anything received
//!   from a counter-party
//! - [`ConsumerNegotiationManager`] / [`ProviderNegotiationManager`] -- the
//!   two sides of the negotiation protocol, each a [`StateProcessor`] for the
//!   outbound side
//!
//! [`StateProcessor`]: connector_core::StateProcessor

pub mod agent;
pub mod config;
pub mod definition;
pub mod error;
pub mod negotiation;
pub mod offer;
pub mod store;
pub mod validation;

pub use agent::{ClaimsAgentService, ParticipantAgentService, DEFAULT_IDENTITY_CLAIM};
pub use config::NegotiationConfig;
pub use definition::ContractDefinitionService;
pub use error::{DispatchError, NegotiationError};
pub use negotiation::{
    AcceptAll, ConsumerNegotiationManager, ContractOfferRequest, DeferAll, Dispatcher,
    DispatcherRegistry, LoopbackDispatcher, LoopbackNetwork, MessageHeader, NegotiationEndpoint,
    NegotiationListener, NegotiationMessage, NegotiationResponse, OfferDecision,
    OfferDecisionPolicy, ProtocolHandler, ProtocolMessage, ProviderNegotiationManager,
    ResponseStatus, LOOPBACK_PROTOCOL,
};
pub use offer::{ContractOfferQuery, ContractOfferService};
pub use store::{AssetIndex, ContractDefinitionStore, InMemoryAssetIndex, InMemoryDefinitionStore};
pub use validation::{ContractValidationService, OfferValidation};
