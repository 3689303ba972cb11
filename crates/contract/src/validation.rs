//! Re-derivation of inbound offers and agreements.
//!
//! Nothing a counter-party sends is trusted as-is: offers are rebuilt from the
//! provider's own definitions and asset index, and agreements are only
//! accepted from one of their two parties.

use std::collections::BTreeSet;
use std::sync::Arc;

use connector_core::{ClaimToken, ContractAgreement, ContractOffer};

use crate::agent::ParticipantAgentService;
use crate::definition::ContractDefinitionService;
use crate::store::AssetIndex;

/// Result of validating an offer. A valid result carries the offer to
/// persist, which is never the one received.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferValidation {
    Valid(ContractOffer),
    Invalid(String),
}

impl OfferValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, OfferValidation::Valid(_))
    }

    pub fn offer(&self) -> Option<&ContractOffer> {
        match self {
            OfferValidation::Valid(offer) => Some(offer),
            OfferValidation::Invalid(_) => None,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        OfferValidation::Invalid(reason.into())
    }
}

pub struct ContractValidationService {
    agents: Arc<dyn ParticipantAgentService>,
    definitions: Arc<ContractDefinitionService>,
    assets: Arc<dyn AssetIndex>,
}

impl ContractValidationService {
    pub fn new(
        agents: Arc<dyn ParticipantAgentService>,
        definitions: Arc<ContractDefinitionService>,
        assets: Arc<dyn AssetIndex>,
    ) -> Self {
        Self {
            agents,
            definitions,
            assets,
        }
    }

    /// Provider side: rebuild a requested offer from the definition its id
    /// names.
    ///
    /// The definition must exist and be visible to the requester, and every
    /// requested asset must exist and be selected by the definition. The
    /// returned offer carries the definition's contract policy and the
    /// index's copy of each asset, whatever the request claimed.
    pub fn validate_offer(&self, token: &ClaimToken, offer: &ContractOffer) -> OfferValidation {
        let agent = self.agents.create_for(token);
        let Some(definition_id) = offer.definition_id() else {
            return OfferValidation::invalid(format!("malformed offer id '{}'", offer.id));
        };
        let Some(definition) = self.definitions.definition_for(&agent, definition_id) else {
            return OfferValidation::invalid(format!(
                "no contract definition '{definition_id}' available"
            ));
        };
        if offer.assets.is_empty() {
            return OfferValidation::invalid("offer names no assets");
        }

        let mut seen = BTreeSet::new();
        let mut assets = Vec::with_capacity(offer.assets.len());
        for requested in &offer.assets {
            if !seen.insert(requested.id.as_str()) {
                return OfferValidation::invalid(format!("asset '{}' listed twice", requested.id));
            }
            match self.assets.find_by_id(&requested.id) {
                Some(asset) if definition.selector.matches(&asset) => assets.push(asset),
                _ => {
                    return OfferValidation::invalid(format!(
                        "asset '{}' not covered by definition '{definition_id}'",
                        requested.id
                    ))
                }
            }
        }

        if offer.policy != definition.contract_policy {
            tracing::debug!(
                offer = %offer.id,
                definition = %definition.id,
                "replacing offered policy with the definition's contract policy"
            );
        }

        let mut sanitized = ContractOffer::new(offer.id.clone(), definition.contract_policy, assets);
        sanitized.provider = offer.provider.clone();
        sanitized.consumer = agent.identity().map(str::to_string);
        OfferValidation::Valid(sanitized)
    }

    /// Consumer side: the presenter must be one of the agreement's two
    /// parties. Dates are not checked here.
    pub fn validate_agreement(&self, token: &ClaimToken, agreement: &ContractAgreement) -> bool {
        let agent = self.agents.create_for(token);
        match agent.identity() {
            Some(identity) => {
                identity == agreement.provider_agent_id() || identity == agreement.consumer_agent_id()
            }
            None => false,
        }
    }

    /// The participant identity the token carries, if any.
    pub fn identify(&self, token: &ClaimToken) -> Option<String> {
        self.agents.create_for(token).identity().map(str::to_string)
    }

    /// Whether the token identifies the expected counter-party.
    pub fn validate_sender(&self, token: &ClaimToken, counter_party_id: &str) -> bool {
        self.agents.create_for(token).identity() == Some(counter_party_id)
    }

    /// Consumer side: a counter-offer must come from the counter-party and
    /// stay within the definition and assets of the offer it answers.
    pub fn validate_counter_offer(
        &self,
        token: &ClaimToken,
        counter_party_id: &str,
        previous: &ContractOffer,
        offer: &ContractOffer,
    ) -> OfferValidation {
        if !self.validate_sender(token, counter_party_id) {
            return OfferValidation::invalid(format!(
                "counter-offer not sent by counter-party '{counter_party_id}'"
            ));
        }
        if offer.definition_id().is_none() || offer.definition_id() != previous.definition_id() {
            return OfferValidation::invalid(format!(
                "counter-offer '{}' does not refer to definition of '{}'",
                offer.id, previous.id
            ));
        }
        let requested: BTreeSet<String> = previous.asset_ids().into_iter().collect();
        let offered: BTreeSet<String> = offer.asset_ids().into_iter().collect();
        if offered.is_empty() || offered != requested {
            return OfferValidation::invalid("counter-offer changes the requested assets");
        }
        OfferValidation::Valid(offer.clone())
    }
}
