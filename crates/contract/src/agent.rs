use std::collections::BTreeMap;

use connector_core::{ClaimToken, ParticipantAgent};

/// Claim used as the participant identity unless configured otherwise.
pub const DEFAULT_IDENTITY_CLAIM: &str = "client_id";

/// Turns a verified claim token into the participant agent that policies and
/// counter-party checks are evaluated against.
pub trait ParticipantAgentService: Send + Sync {
    fn create_for(&self, token: &ClaimToken) -> ParticipantAgent;
}

/// Copies the token's claims onto the agent and takes the identity from one
/// configured claim.
#[derive(Debug, Clone)]
pub struct ClaimsAgentService {
    identity_claim: String,
}

impl ClaimsAgentService {
    pub fn new(identity_claim: impl Into<String>) -> Self {
        Self {
            identity_claim: identity_claim.into(),
        }
    }

    pub fn identity_claim(&self) -> &str {
        &self.identity_claim
    }
}

impl Default for ClaimsAgentService {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTITY_CLAIM)
    }
}

impl ParticipantAgentService for ClaimsAgentService {
    fn create_for(&self, token: &ClaimToken) -> ParticipantAgent {
        let identity = token.claim(&self.identity_claim).map(str::to_string);
        ParticipantAgent::new(token.claims.clone(), BTreeMap::new(), identity)
    }
}
