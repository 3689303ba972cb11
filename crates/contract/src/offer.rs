use std::sync::Arc;

use connector_core::{ClaimToken, ContractOffer};

use crate::agent::ParticipantAgentService;
use crate::definition::ContractDefinitionService;
use crate::store::AssetIndex;

/// A counter-party asking what it may negotiate for.
#[derive(Debug, Clone, Default)]
pub struct ContractOfferQuery {
    pub claim_token: ClaimToken,
}

impl ContractOfferQuery {
    pub fn new(claim_token: ClaimToken) -> Self {
        Self { claim_token }
    }
}

/// Projects visible definitions onto the asset index.
pub struct ContractOfferService {
    agents: Arc<dyn ParticipantAgentService>,
    definitions: Arc<ContractDefinitionService>,
    assets: Arc<dyn AssetIndex>,
}

impl ContractOfferService {
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

    /// One offer per (visible definition, selected asset). The offer id is
    /// the definition id and the policy is the definition's contract policy.
    ///
    /// Offers are regenerated on every call and never stored.
    pub fn query_contract_offers(&self, query: &ContractOfferQuery) -> Vec<ContractOffer> {
        let agent = self.agents.create_for(&query.claim_token);
        let mut offers = Vec::new();
        for definition in self.definitions.definitions_for(&agent) {
            for asset in self.assets.query(&definition.selector) {
                offers.push(ContractOffer::new(
                    definition.id.clone(),
                    definition.contract_policy.clone(),
                    vec![asset],
                ));
            }
        }
        tracing::debug!(
            identity = agent.identity().unwrap_or("<anonymous>"),
            offers = offers.len(),
            "generated contract offers"
        );
        offers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ClaimsAgentService;
    use crate::store::{InMemoryAssetIndex, InMemoryDefinitionStore};
    use connector_core::{
        Asset, AssetSelectorExpression, Constraint, ContractDefinition, Criterion, Operator,
        Policy,
    };
    use connector_policy::{RuleBasedPolicyEngine, PARTNER_LEVEL};

    fn service(definitions: Vec<ContractDefinition>) -> ContractOfferService {
        let engine = Arc::new(RuleBasedPolicyEngine::new());
        let definitions = Arc::new(ContractDefinitionService::new(
            Arc::new(InMemoryDefinitionStore::new(definitions)),
            engine,
        ));
        let assets = InMemoryAssetIndex::new([
            Asset::new("a1").with_property("type", "csv"),
            Asset::new("a2").with_property("type", "csv"),
            Asset::new("a3").with_property("type", "json"),
        ]);
        ContractOfferService::new(
            Arc::new(ClaimsAgentService::default()),
            definitions,
            Arc::new(assets),
        )
    }

    #[test]
    fn one_offer_per_selected_asset() {
        let svc = service(vec![ContractDefinition {
            id: "def-csv".into(),
            access_policy: Policy::permit_all(),
            contract_policy: Policy::permission(Some("use"), vec![]),
            selector: AssetSelectorExpression {
                criteria: vec![Criterion::new("type", Operator::Eq, "csv")],
            },
        }]);
        let offers = svc.query_contract_offers(&ContractOfferQuery::default());
        assert_eq!(offers.len(), 2);
        for (offer, asset) in offers.iter().zip(["a1", "a2"]) {
            assert_eq!(offer.id, "def-csv");
            assert_eq!(offer.asset_ids(), vec![asset.to_string()]);
            assert_eq!(offer.policy, Policy::permission(Some("use"), vec![]));
        }
    }

    #[test]
    fn failing_access_policy_yields_no_offers() {
        let svc = service(vec![ContractDefinition {
            id: "def-gold".into(),
            access_policy: Policy::permission(
                None,
                vec![Constraint::atomic(PARTNER_LEVEL, Operator::Eq, "gold")],
            ),
            contract_policy: Policy::permit_all(),
            selector: AssetSelectorExpression::select_all(),
        }]);
        let anonymous = ContractOfferQuery::default();
        assert!(svc.query_contract_offers(&anonymous).is_empty());

        let gold = ContractOfferQuery::new(ClaimToken::new().with_claim("partnerLevel", "gold"));
        assert_eq!(svc.query_contract_offers(&gold).len(), 3);
    }
}
