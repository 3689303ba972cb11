use std::collections::HashMap;

use connector_core::{Constraint, ParticipantAgent, Policy};

use crate::functions::{
    ClaimConstraintFunction, ConstraintFunction, ABS_SPATIAL_POSITION, PARTNER_LEVEL,
};
use crate::{PolicyEngine, PolicyEvaluation};

/// Evaluates permissions and prohibitions through a registry of constraint
/// functions keyed by left operand.
///
/// - every permission must have all of its constraints satisfied
/// - a prohibition is violated when all of its constraints are satisfied
/// - an operand with no registered function fails closed
pub struct RuleBasedPolicyEngine {
    functions: HashMap<String, Box<dyn ConstraintFunction>>,
}

impl RuleBasedPolicyEngine {
    /// Create an engine with no functions registered.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Create an engine with the built-in claim operands registered.
    pub fn new() -> Self {
        let mut engine = Self::empty();
        engine.register(
            ABS_SPATIAL_POSITION,
            Box::new(ClaimConstraintFunction::spatial_position()),
        );
        engine.register(
            PARTNER_LEVEL,
            Box::new(ClaimConstraintFunction::partner_level()),
        );
        engine
    }

    /// Register (or replace) the function for a left operand.
    pub fn register(&mut self, operand: impl Into<String>, function: Box<dyn ConstraintFunction>) {
        self.functions.insert(operand.into(), function);
    }

    /// Map a left operand straight onto a participant claim.
    pub fn register_claim(&mut self, operand: impl Into<String>, claim: impl Into<String>) {
        self.register(operand, Box::new(ClaimConstraintFunction::new(claim)));
    }

    pub fn has_function(&self, operand: &str) -> bool {
        self.functions.contains_key(operand)
    }

    fn satisfied(
        &self,
        constraint: &Constraint,
        agent: &ParticipantAgent,
        problems: &mut Vec<String>,
    ) -> bool {
        match constraint {
            Constraint::Atomic {
                left,
                operator,
                right,
            } => match self.functions.get(left) {
                Some(function) => function.evaluate(*operator, right, agent),
                None => {
                    tracing::debug!(operand = %left, "no constraint function registered");
                    problems.push(format!("no constraint function registered for '{left}'"));
                    false
                }
            },
            Constraint::And { constraints } => constraints
                .iter()
                .all(|c| self.satisfied(c, agent, problems)),
            Constraint::Or { constraints } => constraints
                .iter()
                .any(|c| self.satisfied(c, agent, problems)),
            Constraint::Xone { constraints } => {
                constraints
                    .iter()
                    .filter(|c| self.satisfied(c, agent, problems))
                    .count()
                    == 1
            }
        }
    }

    fn all_satisfied(
        &self,
        constraints: &[Constraint],
        agent: &ParticipantAgent,
        problems: &mut Vec<String>,
    ) -> Result<(), String> {
        for constraint in constraints {
            if !self.satisfied(constraint, agent, problems) {
                return Err(constraint.describe());
            }
        }
        Ok(())
    }
}

impl Default for RuleBasedPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine for RuleBasedPolicyEngine {
    fn evaluate(&self, policy: &Policy, agent: &ParticipantAgent) -> PolicyEvaluation {
        let mut problems = Vec::new();

        for permission in &policy.permissions {
            let mut scratch = Vec::new();
            if let Err(failed) = self.all_satisfied(&permission.constraints, agent, &mut scratch) {
                problems.extend(scratch);
                problems.push(format!(
                    "permission{} not granted: constraint '{failed}' not satisfied",
                    action_suffix(permission.action.as_deref())
                ));
            }
        }

        for prohibition in &policy.prohibitions {
            // Unknown operands make a prohibition unsatisfiable, which would
            // silently permit; surface them as problems instead.
            let mut scratch = Vec::new();
            let violated = self
                .all_satisfied(&prohibition.constraints, agent, &mut scratch)
                .is_ok();
            if !scratch.is_empty() {
                problems.extend(scratch);
            } else if violated {
                problems.push(format!(
                    "prohibition{} violated",
                    action_suffix(prohibition.action.as_deref())
                ));
            }
        }

        if problems.is_empty() {
            PolicyEvaluation::valid()
        } else {
            PolicyEvaluation::invalid(problems)
        }
    }
}

fn action_suffix(action: Option<&str>) -> String {
    action.map(|a| format!(" '{a}'")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_core::{Operator, Permission, Prohibition};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn agent(claims: &[(&str, &str)]) -> ParticipantAgent {
        let claims: BTreeMap<String, String> = claims
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ParticipantAgent::new(claims, BTreeMap::new(), Some("consumer".to_string()))
    }

    fn gold_only() -> Policy {
        Policy::permission(
            Some("use"),
            vec![Constraint::atomic(PARTNER_LEVEL, Operator::Eq, "gold")],
        )
    }

    #[test]
    fn empty_policy_permits_everyone() {
        let engine = RuleBasedPolicyEngine::new();
        assert!(engine.evaluate(&Policy::permit_all(), &agent(&[])).valid);
    }

    #[test]
    fn permission_requires_constraint() {
        let engine = RuleBasedPolicyEngine::new();
        assert!(engine.evaluate(&gold_only(), &agent(&[("partnerLevel", "gold")])).valid);

        let eval = engine.evaluate(&gold_only(), &agent(&[("partnerLevel", "bronze")]));
        assert!(!eval.valid);
        assert_eq!(eval.problems.len(), 1);
        assert!(eval.problems[0].contains("'use'"));
    }

    #[test]
    fn unknown_operand_fails_closed() {
        let engine = RuleBasedPolicyEngine::new();
        let policy = Policy::permission(None, vec![Constraint::atomic("x:unknown", Operator::Eq, 1)]);
        let eval = engine.evaluate(&policy, &agent(&[]));
        assert!(!eval.valid);
        assert!(eval.problems.iter().any(|p| p.contains("x:unknown")));
    }

    #[test]
    fn prohibition_violated_when_all_constraints_hold() {
        let engine = RuleBasedPolicyEngine::new();
        let policy = Policy {
            permissions: vec![],
            prohibitions: vec![Prohibition {
                action: Some("use".into()),
                constraints: vec![Constraint::atomic(ABS_SPATIAL_POSITION, Operator::Eq, "us")],
            }],
        };
        assert!(!engine.evaluate(&policy, &agent(&[("region", "us")])).valid);
        assert!(engine.evaluate(&policy, &agent(&[("region", "eu")])).valid);
    }

    #[test]
    fn composite_constraints() {
        let engine = RuleBasedPolicyEngine::new();
        let either = Policy {
            permissions: vec![Permission {
                action: None,
                constraints: vec![Constraint::Or {
                    constraints: vec![
                        Constraint::atomic(PARTNER_LEVEL, Operator::Eq, "gold"),
                        Constraint::atomic(ABS_SPATIAL_POSITION, Operator::Eq, "eu"),
                    ],
                }],
            }],
            prohibitions: vec![],
        };
        assert!(engine.evaluate(&either, &agent(&[("region", "eu")])).valid);
        assert!(!engine.evaluate(&either, &agent(&[("region", "us")])).valid);

        let exactly_one = Policy::permission(
            None,
            vec![Constraint::Xone {
                constraints: vec![
                    Constraint::atomic(PARTNER_LEVEL, Operator::Eq, "gold"),
                    Constraint::atomic(ABS_SPATIAL_POSITION, Operator::Eq, "eu"),
                ],
            }],
        );
        assert!(engine
            .evaluate(&exactly_one, &agent(&[("partnerLevel", "gold")]))
            .valid);
        assert!(!engine
            .evaluate(
                &exactly_one,
                &agent(&[("partnerLevel", "gold"), ("region", "eu")])
            )
            .valid);
    }

    #[test]
    fn custom_functions_can_be_registered() {
        let mut engine = RuleBasedPolicyEngine::empty();
        engine.register(
            "always",
            Box::new(|_: Operator, right: &serde_json::Value, _: &ParticipantAgent| {
                right == &json!(true)
            }),
        );
        engine.register_claim("tier", "tier");
        let policy = Policy::permission(
            None,
            vec![
                Constraint::atomic("always", Operator::Eq, true),
                Constraint::atomic("tier", Operator::Geq, 2),
            ],
        );
        assert!(engine.evaluate(&policy, &agent(&[("tier", "3")])).valid);
        assert!(!engine.evaluate(&policy, &agent(&[("tier", "1")])).valid);
    }
}
