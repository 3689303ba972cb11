//! Demo scenario files: two participants, the provider's catalog and the
//! consumer's transfer manifest.

use std::collections::BTreeMap;
use std::path::Path;

use connector_core::{Asset, ClaimToken, ContractDefinition, DataAddress, ResourceDefinition};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Scenario {
    pub provider: Participant,
    pub consumer: Participant,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub definitions: Vec<ContractDefinition>,
    /// Offer to negotiate. The first visible offer when absent.
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub transfer: TransferPlan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Participant {
    pub id: String,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

impl Participant {
    /// The participant's credential. The identity claim defaults to the id.
    pub fn token(&self, identity_claim: &str) -> ClaimToken {
        let mut token = ClaimToken::new();
        token.claims = self.claims.clone();
        if token.claim(identity_claim).is_none() {
            token = token.with_claim(identity_claim, self.id.clone());
        }
        token
    }
}

/// What the consumer provisions once the agreement is confirmed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct TransferPlan {
    pub destination: DataAddress,
    pub manifest: Vec<ResourceDefinition>,
}

impl Default for TransferPlan {
    fn default() -> Self {
        Self {
            destination: DataAddress::new("memory"),
            manifest: vec![ResourceDefinition::new("destination", "memory")],
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("error reading scenario '{}': {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("invalid scenario '{}': {}", path.display(), e))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let scenario: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        if scenario.provider.id == scenario.consumer.id {
            return Err(format!(
                "provider and consumer share the id '{}'",
                scenario.provider.id
            ));
        }
        if scenario.definitions.is_empty() {
            return Err("scenario defines no contract definitions".to_string());
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_core::Operator;

    const SCENARIO: &str = r#"
offer = "eu-weather"

[provider]
id = "provider"

[consumer]
id = "consumer"
claims = { region = "eu" }

[[assets]]
id = "weather"
properties = { kind = "csv", rows = 120 }

[[definitions]]
id = "eu-weather"
selector = [{ left = "kind", operator = "eq", right = "csv" }]
contract_policy = { permissions = [{ action = "use" }] }

[[definitions.access_policy.permissions]]
constraints = [{ type = "atomic", left = "ids:absoluteSpatialPosition", operator = "eq", right = "eu" }]
"#;

    #[test]
    fn parses_catalog_and_defaults_the_transfer() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        assert_eq!(scenario.offer.as_deref(), Some("eu-weather"));
        assert_eq!(scenario.assets[0].property("rows").as_deref(), Some("120"));

        let definition = &scenario.definitions[0];
        assert_eq!(definition.selector.criteria[0].operator, Operator::Eq);
        assert_eq!(
            definition.contract_policy.permissions[0].action.as_deref(),
            Some("use")
        );
        assert_eq!(scenario.transfer.manifest.len(), 1);
        assert_eq!(scenario.transfer.manifest[0].kind, "memory");
    }

    #[test]
    fn token_carries_identity_and_claims() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let token = scenario.consumer.token("client_id");
        assert_eq!(token.claim("client_id"), Some("consumer"));
        assert_eq!(token.claim("region"), Some("eu"));
    }

    #[test]
    fn shared_ids_are_rejected() {
        let text = SCENARIO.replace("id = \"consumer\"", "id = \"provider\"");
        assert!(Scenario::parse(&text).unwrap_err().contains("share the id"));
    }
}
