use std::sync::Arc;

use connector_core::{ContractDefinition, ParticipantAgent};
use connector_policy::PolicyEngine;

use crate::store::ContractDefinitionStore;

/// Resolves which contract definitions a participant may see.
///
/// A definition is visible when its access policy and then its contract
/// policy both hold for the agent. A failing definition is indistinguishable
/// from an absent one.
pub struct ContractDefinitionService {
    store: Arc<dyn ContractDefinitionStore>,
    policy_engine: Arc<dyn PolicyEngine>,
}

impl ContractDefinitionService {
    pub fn new(store: Arc<dyn ContractDefinitionStore>, policy_engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            store,
            policy_engine,
        }
    }

    /// Every definition visible to `agent`, in store order. Policies are
    /// evaluated as the sequence is consumed.
    pub fn definitions_for<'a>(
        &'a self,
        agent: &'a ParticipantAgent,
    ) -> impl Iterator<Item = ContractDefinition> + 'a {
        self.store
            .find_all()
            .into_iter()
            .filter(move |d| self.is_visible(agent, d))
    }

    /// The definition with this id, if it exists and is visible to `agent`.
    pub fn definition_for(
        &self,
        agent: &ParticipantAgent,
        definition_id: &str,
    ) -> Option<ContractDefinition> {
        self.store
            .find_by_id(definition_id)
            .filter(|d| self.is_visible(agent, d))
    }

    fn is_visible(&self, agent: &ParticipantAgent, definition: &ContractDefinition) -> bool {
        for (kind, policy) in [
            ("access", &definition.access_policy),
            ("contract", &definition.contract_policy),
        ] {
            let evaluation = self.policy_engine.evaluate(policy, agent);
            if !evaluation.valid {
                tracing::info!(
                    definition = %definition.id,
                    policy = kind,
                    problems = ?evaluation.problems,
                    "contract definition not visible to participant"
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDefinitionStore;
    use connector_core::{AssetSelectorExpression, Constraint, Operator, Policy};
    use connector_policy::{PolicyEvaluation, RuleBasedPolicyEngine, PARTNER_LEVEL};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records every policy it is asked about.
    #[derive(Default)]
    struct Recording {
        inner: RuleBasedPolicyEngine,
        seen: Mutex<Vec<Policy>>,
    }

    impl PolicyEngine for Recording {
        fn evaluate(&self, policy: &Policy, agent: &ParticipantAgent) -> PolicyEvaluation {
            self.seen.lock().unwrap().push(policy.clone());
            self.inner.evaluate(policy, agent)
        }
    }

    fn usage() -> Policy {
        Policy::permission(Some("use"), vec![])
    }

    fn gold() -> Policy {
        Policy::permission(
            Some("use"),
            vec![Constraint::atomic(PARTNER_LEVEL, Operator::Eq, "gold")],
        )
    }

    fn definition(id: &str, access: Policy, contract: Policy) -> ContractDefinition {
        ContractDefinition {
            id: id.to_string(),
            access_policy: access,
            contract_policy: contract,
            selector: AssetSelectorExpression::select_all(),
        }
    }

    fn service() -> ContractDefinitionService {
        let store = InMemoryDefinitionStore::new(vec![
            definition("open", Policy::permit_all(), Policy::permit_all()),
            definition("gold-access", gold(), Policy::permit_all()),
            definition("gold-usage", Policy::permit_all(), gold()),
        ]);
        ContractDefinitionService::new(Arc::new(store), Arc::new(RuleBasedPolicyEngine::new()))
    }

    fn agent(level: &str) -> ParticipantAgent {
        ParticipantAgent::new(
            BTreeMap::from([("partnerLevel".to_string(), level.to_string())]),
            BTreeMap::new(),
            Some("consumer".to_string()),
        )
    }

    #[test]
    fn both_policies_gate_visibility() {
        let svc = service();
        let ids = |level: &str| -> Vec<String> {
            svc.definitions_for(&agent(level))
                .into_iter()
                .map(|d| d.id)
                .collect()
        };
        assert_eq!(ids("gold"), vec!["open", "gold-access", "gold-usage"]);
        assert_eq!(ids("bronze"), vec!["open"]);
    }

    #[test]
    fn usage_policy_is_skipped_when_access_fails() {
        let engine = Arc::new(Recording::default());
        let store = InMemoryDefinitionStore::new(vec![definition("gold-access", gold(), usage())]);
        let svc = ContractDefinitionService::new(Arc::new(store), engine.clone());

        assert_eq!(svc.definitions_for(&agent("bronze")).count(), 0);
        assert_eq!(*engine.seen.lock().unwrap(), vec![gold()]);
    }

    #[test]
    fn definitions_are_evaluated_as_consumed() {
        let engine = Arc::new(Recording::default());
        let store = InMemoryDefinitionStore::new(vec![
            definition("first", Policy::permit_all(), usage()),
            definition("second", gold(), usage()),
        ]);
        let svc = ContractDefinitionService::new(Arc::new(store), engine.clone());
        let agent = agent("bronze");

        let mut visible = svc.definitions_for(&agent);
        assert!(engine.seen.lock().unwrap().is_empty());
        assert_eq!(visible.next().map(|d| d.id).as_deref(), Some("first"));
        assert_eq!(engine.seen.lock().unwrap().len(), 2);
        assert!(visible.next().is_none());
        assert_eq!(engine.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn hidden_definition_looks_absent() {
        let svc = service();
        assert!(svc.definition_for(&agent("bronze"), "gold-usage").is_none());
        assert!(svc.definition_for(&agent("bronze"), "missing").is_none());
        assert!(svc.definition_for(&agent("gold"), "gold-usage").is_some());
    }
}
