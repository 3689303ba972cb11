//! Contract definitions, offers, and agreements.

use serde::{Deserialize, Serialize};

use crate::asset::{Asset, AssetSelectorExpression};
use crate::error::BuildError;
use crate::policy::Policy;

/// Separator between the definition id and a per-offer suffix in offer and
/// agreement ids (`<definition-id>:<suffix>`).
pub const CONTRACT_ID_SEPARATOR: char = ':';

/// Resolve the definition id an offer or agreement id refers to.
///
/// Returns `None` for an empty or malformed id.
pub fn definition_id_of(contract_id: &str) -> Option<&str> {
    let definition = match contract_id.split_once(CONTRACT_ID_SEPARATOR) {
        Some((definition, _)) => definition,
        None => contract_id,
    };
    let definition = definition.trim();
    (!definition.is_empty()).then_some(definition)
}

/// Provider-side rule bundling an asset selector with an access policy and a
/// usage (contract) policy. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDefinition {
    pub id: String,
    /// Decides who may see the definition at all.
    pub access_policy: Policy,
    /// The terms of use offered with the selected assets.
    pub contract_policy: Policy,
    #[serde(default)]
    pub selector: AssetSelectorExpression,
}

/// A transient projection of a definition against concrete assets.
///
/// Offers are regenerated per query and never authoritative: anything that
/// arrives over the wire is re-derived before it is trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: String,
    pub policy: Policy,
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub consumer: Option<String>,
}

impl ContractOffer {
    pub fn new(id: impl Into<String>, policy: Policy, assets: Vec<Asset>) -> Self {
        Self {
            id: id.into(),
            policy,
            assets,
            provider: None,
            consumer: None,
        }
    }

    pub fn definition_id(&self) -> Option<&str> {
        definition_id_of(&self.id)
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.id.clone()).collect()
    }
}

/// The binding, immutable outcome of a confirmed negotiation.
///
/// Built through [`ContractAgreement::builder`]; construction fails unless the
/// ids, the policy, and all three dates are present. Dates are seconds since
/// the Unix epoch and must be non-zero. Their relative order is not checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AgreementFields")]
pub struct ContractAgreement {
    id: String,
    provider_agent_id: String,
    consumer_agent_id: String,
    contract_signing_date: i64,
    contract_start_date: i64,
    contract_end_date: i64,
    asset_ids: Vec<String>,
    policy: Policy,
}

impl ContractAgreement {
    pub fn builder() -> ContractAgreementBuilder {
        ContractAgreementBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider_agent_id(&self) -> &str {
        &self.provider_agent_id
    }

    pub fn consumer_agent_id(&self) -> &str {
        &self.consumer_agent_id
    }

    pub fn contract_signing_date(&self) -> i64 {
        self.contract_signing_date
    }

    pub fn contract_start_date(&self) -> i64 {
        self.contract_start_date
    }

    pub fn contract_end_date(&self) -> i64 {
        self.contract_end_date
    }

    pub fn asset_ids(&self) -> &[String] {
        &self.asset_ids
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn covers_asset(&self, asset_id: &str) -> bool {
        self.asset_ids.iter().any(|id| id == asset_id)
    }

    /// Whether the agreement is in force at `epoch_secs`.
    pub fn is_active_at(&self, epoch_secs: i64) -> bool {
        self.contract_start_date <= epoch_secs && epoch_secs <= self.contract_end_date
    }
}

/// Builder for [`ContractAgreement`].
#[derive(Debug, Clone, Default)]
pub struct ContractAgreementBuilder {
    id: Option<String>,
    provider_agent_id: Option<String>,
    consumer_agent_id: Option<String>,
    contract_signing_date: i64,
    contract_start_date: i64,
    contract_end_date: i64,
    asset_ids: Vec<String>,
    policy: Option<Policy>,
}

impl ContractAgreementBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn provider_agent_id(mut self, id: impl Into<String>) -> Self {
        self.provider_agent_id = Some(id.into());
        self
    }

    pub fn consumer_agent_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_agent_id = Some(id.into());
        self
    }

    pub fn contract_signing_date(mut self, epoch_secs: i64) -> Self {
        self.contract_signing_date = epoch_secs;
        self
    }

    pub fn contract_start_date(mut self, epoch_secs: i64) -> Self {
        self.contract_start_date = epoch_secs;
        self
    }

    pub fn contract_end_date(mut self, epoch_secs: i64) -> Self {
        self.contract_end_date = epoch_secs;
        self
    }

    pub fn asset_ids(mut self, asset_ids: Vec<String>) -> Self {
        self.asset_ids = asset_ids;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<ContractAgreement, BuildError> {
        const OBJECT: &str = "ContractAgreement";
        let id = self.id.ok_or(BuildError::missing(OBJECT, "id"))?;
        let provider_agent_id = self
            .provider_agent_id
            .ok_or(BuildError::missing(OBJECT, "provider_agent_id"))?;
        let consumer_agent_id = self
            .consumer_agent_id
            .ok_or(BuildError::missing(OBJECT, "consumer_agent_id"))?;
        let policy = self.policy.ok_or(BuildError::missing(OBJECT, "policy"))?;
        if self.contract_signing_date == 0 {
            return Err(BuildError::invalid(OBJECT, "contract signing date must be set"));
        }
        if self.contract_start_date == 0 {
            return Err(BuildError::invalid(OBJECT, "contract start date must be set"));
        }
        if self.contract_end_date == 0 {
            return Err(BuildError::invalid(OBJECT, "contract end date must be set"));
        }
        Ok(ContractAgreement {
            id,
            provider_agent_id,
            consumer_agent_id,
            contract_signing_date: self.contract_signing_date,
            contract_start_date: self.contract_start_date,
            contract_end_date: self.contract_end_date,
            asset_ids: self.asset_ids,
            policy,
        })
    }
}

/// Wire shape of an agreement; converted through the builder on deserialize.
#[derive(Deserialize)]
struct AgreementFields {
    id: String,
    provider_agent_id: String,
    consumer_agent_id: String,
    contract_signing_date: i64,
    contract_start_date: i64,
    contract_end_date: i64,
    #[serde(default)]
    asset_ids: Vec<String>,
    policy: Policy,
}

impl TryFrom<AgreementFields> for ContractAgreement {
    type Error = BuildError;

    fn try_from(fields: AgreementFields) -> Result<Self, Self::Error> {
        ContractAgreement::builder()
            .id(fields.id)
            .provider_agent_id(fields.provider_agent_id)
            .consumer_agent_id(fields.consumer_agent_id)
            .contract_signing_date(fields.contract_signing_date)
            .contract_start_date(fields.contract_start_date)
            .contract_end_date(fields.contract_end_date)
            .asset_ids(fields.asset_ids)
            .policy(fields.policy)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_builder() -> ContractAgreementBuilder {
        ContractAgreement::builder()
            .id("def-1:abc")
            .provider_agent_id("provider")
            .consumer_agent_id("consumer")
            .contract_signing_date(1_700_000_000)
            .contract_start_date(1_700_000_000)
            .contract_end_date(1_800_000_000)
            .asset_ids(vec!["asset-1".into()])
            .policy(Policy::permit_all())
    }

    #[test]
    fn agreement_with_all_dates_builds() {
        let agreement = complete_builder().build().unwrap();
        assert_eq!(agreement.id(), "def-1:abc");
        assert!(agreement.covers_asset("asset-1"));
        assert!(!agreement.covers_asset("asset-2"));
    }

    #[test]
    fn zero_signing_date_fails() {
        let err = complete_builder().contract_signing_date(0).build().unwrap_err();
        assert_eq!(
            err,
            BuildError::invalid("ContractAgreement", "contract signing date must be set")
        );
    }

    #[test]
    fn zero_start_or_end_date_fails() {
        assert!(complete_builder().contract_start_date(0).build().is_err());
        assert!(complete_builder().contract_end_date(0).build().is_err());
    }

    #[test]
    fn missing_policy_fails() {
        let builder = ContractAgreement::builder()
            .id("x")
            .provider_agent_id("p")
            .consumer_agent_id("c")
            .contract_signing_date(1)
            .contract_start_date(1)
            .contract_end_date(1);
        assert_eq!(
            builder.build().unwrap_err(),
            BuildError::missing("ContractAgreement", "policy")
        );
    }

    #[test]
    fn unordered_dates_are_accepted() {
        let agreement = complete_builder()
            .contract_start_date(1_900_000_000)
            .contract_end_date(1_600_000_000)
            .build();
        assert!(agreement.is_ok());
    }

    #[test]
    fn deserialization_goes_through_validation() {
        let ok = serde_json::to_value(complete_builder().build().unwrap()).unwrap();
        assert!(serde_json::from_value::<ContractAgreement>(ok.clone()).is_ok());

        let mut bad = ok;
        bad["contract_end_date"] = serde_json::json!(0);
        assert!(serde_json::from_value::<ContractAgreement>(bad).is_err());
    }

    #[test]
    fn definition_id_is_prefix_of_contract_id() {
        assert_eq!(definition_id_of("def-1"), Some("def-1"));
        assert_eq!(definition_id_of("def-1:1234"), Some("def-1"));
        assert_eq!(definition_id_of(""), None);
        assert_eq!(definition_id_of(":1234"), None);
    }
}
