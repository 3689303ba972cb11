//! Policy evaluation for the connector.
//!
//! A [`PolicyEngine`] decides whether a [`Policy`] holds for a
//! [`ParticipantAgent`]. The shipped [`RuleBasedPolicyEngine`] resolves every
//! atomic constraint through a [`ConstraintFunction`] registered for the
//! constraint's left operand; unknown operands fail closed.

mod engine;
mod functions;

use connector_core::{ParticipantAgent, Policy};
use serde::Serialize;

pub use engine::RuleBasedPolicyEngine;
pub use functions::{
    ClaimConstraintFunction, ConstraintFunction, ABS_SPATIAL_POSITION, PARTNER_LEVEL,
};

/// Outcome of evaluating one policy against one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyEvaluation {
    pub valid: bool,
    /// Why the policy did not hold. Empty when `valid`.
    pub problems: Vec<String>,
}

impl PolicyEvaluation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            problems: Vec::new(),
        }
    }

    pub fn invalid(problems: Vec<String>) -> Self {
        Self {
            valid: false,
            problems,
        }
    }
}

/// Evaluates policies against participants.
pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, policy: &Policy, agent: &ParticipantAgent) -> PolicyEvaluation;
}
