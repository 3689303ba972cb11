//! Connector settings file.

use std::collections::BTreeMap;
use std::path::Path;

use connector_contract::{NegotiationConfig, DEFAULT_IDENTITY_CLAIM};
use connector_policy::RuleBasedPolicyEngine;
use connector_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

/// Everything a connector reads from `--config`. Missing keys keep their
/// defaults; unknown keys are an error.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ConnectorConfig {
    pub connector_id: String,
    /// Claim whose value identifies a participant.
    pub identity_claim: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// `[negotiation]`. Identity and callback address are set per connector
    /// by [`negotiation_for`](Self::negotiation_for).
    pub negotiation: NegotiationConfig,
    pub transfer: TransferConfig,
    pub policy: PolicySettings,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connector_id: "connector".to_string(),
            identity_claim: DEFAULT_IDENTITY_CLAIM.to_string(),
            log_filter: "warn,connector=info".to_string(),
            negotiation: NegotiationConfig::default(),
            transfer: TransferConfig::default(),
            policy: PolicySettings::default(),
        }
    }
}

/// `[policy]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PolicySettings {
    /// Extra left operands, each read from the named claim.
    pub claim_operands: BTreeMap<String, String>,
}

impl ConnectorConfig {
    /// Read a config file. `None` yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("error reading config '{}': {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("invalid config '{}': {}", path.display(), e))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), String> {
        if self.connector_id.trim().is_empty() {
            return Err("connector_id must not be empty".to_string());
        }
        if self.identity_claim.trim().is_empty() {
            return Err("identity_claim must not be empty".to_string());
        }
        if self.negotiation.batch_size == 0 || self.transfer.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.negotiation.agreement_validity_secs <= 0 {
            return Err("agreement_validity_secs must be positive".to_string());
        }
        Ok(())
    }

    /// Negotiation settings for one connector on the loopback network.
    pub fn negotiation_for(&self, connector_id: &str) -> NegotiationConfig {
        self.negotiation
            .clone()
            .with_connector_id(connector_id)
            .with_callback_address(format!("loopback://{connector_id}"))
    }

    /// The built-in constraint functions plus the configured claim operands.
    pub fn policy_engine(&self) -> RuleBasedPolicyEngine {
        let mut engine = RuleBasedPolicyEngine::new();
        for (operand, claim) in &self.policy.claim_operands {
            engine.register_claim(operand.clone(), claim.clone());
        }
        engine
    }
}
