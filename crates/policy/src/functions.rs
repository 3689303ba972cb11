//! Constraint functions: the per-operand evaluators behind atomic constraints.

use connector_core::{Operator, ParticipantAgent};
use serde_json::Value;

/// Left operand comparing the participant's region claim.
pub const ABS_SPATIAL_POSITION: &str = "ids:absoluteSpatialPosition";
/// Left operand comparing the participant's partner level claim.
pub const PARTNER_LEVEL: &str = "ids:partnerLevel";

/// Evaluates `<operand> operator right` for one participant.
pub trait ConstraintFunction: Send + Sync {
    fn evaluate(&self, operator: Operator, right: &Value, agent: &ParticipantAgent) -> bool;
}

/// Compares one claim (or, failing that, a derived attribute) of the
/// participant against the constraint's right operand. A participant without
/// the claim never satisfies the constraint.
#[derive(Debug, Clone)]
pub struct ClaimConstraintFunction {
    claim: String,
}

impl ClaimConstraintFunction {
    pub fn new(claim: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
        }
    }

    /// `ids:absoluteSpatialPosition` over the `region` claim.
    pub fn spatial_position() -> Self {
        Self::new("region")
    }

    /// `ids:partnerLevel` over the `partnerLevel` claim.
    pub fn partner_level() -> Self {
        Self::new("partnerLevel")
    }
}

impl ConstraintFunction for ClaimConstraintFunction {
    fn evaluate(&self, operator: Operator, right: &Value, agent: &ParticipantAgent) -> bool {
        let observed = agent
            .claim(&self.claim)
            .or_else(|| agent.attributes().get(&self.claim).map(String::as_str));
        match observed {
            Some(value) => operator.apply(value, right),
            None => false,
        }
    }
}

/// Any closure with the right shape is a constraint function.
impl<F> ConstraintFunction for F
where
    F: Fn(Operator, &Value, &ParticipantAgent) -> bool + Send + Sync,
{
    fn evaluate(&self, operator: Operator, right: &Value, agent: &ParticipantAgent) -> bool {
        self(operator, right, agent)
    }
}
