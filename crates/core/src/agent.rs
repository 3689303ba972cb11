//! Claims presented by a counter-party and the participant agent derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Verified claims extracted from a counter-party's credential.
///
/// The transport layer is responsible for verifying the credential; by the
/// time a `ClaimToken` reaches this core its claims are trusted as stated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub claims: BTreeMap<String, String>,
}

impl ClaimToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper used by transports and tests.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }
}

/// A resolved participant: identity plus claims and derived attributes.
///
/// Only ever used as input to policy evaluation and counter-party checks.
/// Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantAgent {
    claims: BTreeMap<String, String>,
    attributes: BTreeMap<String, String>,
    identity: Option<String>,
}

impl ParticipantAgent {
    pub fn new(
        claims: BTreeMap<String, String>,
        attributes: BTreeMap<String, String>,
        identity: Option<String>,
    ) -> Self {
        Self {
            claims,
            attributes,
            identity,
        }
    }

    pub fn claims(&self) -> &BTreeMap<String, String> {
        &self.claims
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }

    /// The participant's identity, if the credential carried one.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }
}
