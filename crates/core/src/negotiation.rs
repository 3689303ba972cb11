//! The contract negotiation aggregate and its state machine.
//!
//! Both sides of a negotiation persist their own `ContractNegotiation`. The
//! two records are linked through `correlation_id` (the counter-party's id for
//! the same logical negotiation) and kept consistent by the history hash each
//! side echoes back to the other.
//!
//! Lifecycle (role-agnostic):
//!
//! ```text
//! INITIAL -> REQUESTING -> REQUESTED -> OFFERING -> OFFERED <-> REQUESTED
//!                              |                       |
//!                              +--> AGREEING -> AGREED +--> CONFIRMED
//! any non-terminal -> DECLINING -> DECLINED, any non-terminal -> ERROR
//! ```

use serde::{Deserialize, Serialize};

use crate::contract::{ContractAgreement, ContractOffer};
use crate::error::{BuildError, TransitionError};
use crate::hash::content_hash;

/// Negotiation state. The numeric code orders states for monotonicity checks;
/// `Error` is `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    Initial,
    /// Consumer: request (or counter-request) waiting to be sent.
    Requesting,
    Requested,
    /// Provider: counter-offer waiting to be sent.
    Offering,
    Offered,
    /// Consumer: approval waiting to be sent. Provider: agreement waiting to be sent.
    Agreeing,
    Agreed,
    Declining,
    Declined,
    Confirmed,
    Error,
}

impl NegotiationState {
    pub const ALL: [NegotiationState; 11] = [
        NegotiationState::Initial,
        NegotiationState::Requesting,
        NegotiationState::Requested,
        NegotiationState::Offering,
        NegotiationState::Offered,
        NegotiationState::Agreeing,
        NegotiationState::Agreed,
        NegotiationState::Declining,
        NegotiationState::Declined,
        NegotiationState::Confirmed,
        NegotiationState::Error,
    ];

    /// States whose outbound message is picked up by the dispatch loop.
    pub const PENDING: [NegotiationState; 4] = [
        NegotiationState::Requesting,
        NegotiationState::Offering,
        NegotiationState::Agreeing,
        NegotiationState::Declining,
    ];

    pub fn code(self) -> i32 {
        match self {
            NegotiationState::Initial => 50,
            NegotiationState::Requesting => 100,
            NegotiationState::Requested => 200,
            NegotiationState::Offering => 300,
            NegotiationState::Offered => 400,
            NegotiationState::Agreeing => 500,
            NegotiationState::Agreed => 600,
            NegotiationState::Declining => 700,
            NegotiationState::Declined => 800,
            NegotiationState::Confirmed => 900,
            NegotiationState::Error => -1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NegotiationState::Confirmed | NegotiationState::Declined | NegotiationState::Error
        )
    }

    pub fn is_pending(self) -> bool {
        Self::PENDING.contains(&self)
    }

    pub fn can_transition_to(self, to: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Error) => true,
            (Declining, Declined) => true,
            (Declining, _) => false,
            (_, Declining | Declined) => true,
            (Initial, Requesting | Requested) => true,
            (Requesting, Requested) => true,
            (Requested, Offering | Offered | Agreeing | Confirmed) => true,
            (Offering, Offered) => true,
            (Offered, Requesting | Requested | Agreeing) => true,
            (Agreeing, Agreed | Confirmed) => true,
            (Agreed, Confirmed) => true,
            _ => false,
        }
    }
}

/// Which side of the negotiation this record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Consumer,
    Provider,
}

impl NegotiationRole {
    pub fn opposite(self) -> Self {
        match self {
            NegotiationRole::Consumer => NegotiationRole::Provider,
            NegotiationRole::Provider => NegotiationRole::Consumer,
        }
    }
}

/// The remote connector a negotiation is held with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterParty {
    pub id: String,
    pub address: String,
    pub protocol: String,
}

/// Outcome recorded for an inbound message that was applied, so that a
/// redelivery returns the same answer without touching state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    Applied,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProcessedMessage {
    key: String,
    outcome: MessageOutcome,
}

/// Durable aggregate root tracking one negotiation to agreement or decline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    id: String,
    correlation_id: Option<String>,
    role: NegotiationRole,
    counter_party: CounterParty,
    state: NegotiationState,
    /// Incremented on every transition; never decreases.
    state_count: u32,
    /// Epoch millis of the last state change or retry.
    state_timestamp: i64,
    /// Failed send attempts in the current state.
    retry_count: u32,
    offers: Vec<ContractOffer>,
    agreement: Option<ContractAgreement>,
    error_detail: Option<String>,
    /// Reason sent with a pending or completed decline.
    #[serde(default)]
    decline_reason: Option<String>,
    /// Last hash the counter-party sent for its own record; echoed back.
    counter_party_hash: Option<String>,
    processed: Vec<ProcessedMessage>,
    hash: String,
}

#[derive(Serialize)]
struct HistoryView<'a> {
    id: &'a str,
    state: i32,
    offers: &'a [ContractOffer],
    agreement: Option<&'a str>,
}

impl ContractNegotiation {
    /// Create a negotiation in `Initial`.
    pub fn new(
        id: impl Into<String>,
        role: NegotiationRole,
        counter_party: CounterParty,
    ) -> Result<Self, BuildError> {
        const OBJECT: &str = "ContractNegotiation";
        let id = id.into();
        if id.is_empty() {
            return Err(BuildError::missing(OBJECT, "id"));
        }
        if counter_party.id.is_empty() {
            return Err(BuildError::missing(OBJECT, "counter_party.id"));
        }
        if counter_party.protocol.is_empty() {
            return Err(BuildError::missing(OBJECT, "counter_party.protocol"));
        }
        let mut negotiation = Self {
            id,
            correlation_id: None,
            role,
            counter_party,
            state: NegotiationState::Initial,
            state_count: 0,
            state_timestamp: crate::now_millis(),
            retry_count: 0,
            offers: Vec::new(),
            agreement: None,
            error_detail: None,
            decline_reason: None,
            counter_party_hash: None,
            processed: Vec::new(),
            hash: String::new(),
        };
        negotiation.refresh_hash();
        Ok(negotiation)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn counter_party(&self) -> &CounterParty {
        &self.counter_party
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn state_count(&self) -> u32 {
        self.state_count
    }

    pub fn state_timestamp(&self) -> i64 {
        self.state_timestamp
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn offers(&self) -> &[ContractOffer] {
        &self.offers
    }

    pub fn last_offer(&self) -> Option<&ContractOffer> {
        self.offers.last()
    }

    pub fn agreement(&self) -> Option<&ContractAgreement> {
        self.agreement.as_ref()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn decline_reason(&self) -> Option<&str> {
        self.decline_reason.as_deref()
    }

    pub fn counter_party_hash(&self) -> Option<&str> {
        self.counter_party_hash.as_deref()
    }

    /// The current history hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Hash over id, state, offer history, and agreement. Counters and
    /// timestamps are excluded so that retries do not change it.
    pub fn compute_hash(&self) -> String {
        content_hash(&HistoryView {
            id: &self.id,
            state: self.state.code(),
            offers: &self.offers,
            agreement: self.agreement.as_ref().map(ContractAgreement::id),
        })
    }

    fn refresh_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn transition_to(&mut self, to: NegotiationState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError::Negotiation {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.state_count += 1;
        self.retry_count = 0;
        self.state_timestamp = crate::now_millis();
        self.refresh_hash();
        Ok(())
    }

    /// Move to `Error`, recording why.
    pub fn transition_error(&mut self, detail: impl Into<String>) -> Result<(), TransitionError> {
        self.transition_to(NegotiationState::Error)?;
        self.error_detail = Some(detail.into());
        Ok(())
    }

    /// Move to `Declining`; the reason travels with the rejection message.
    pub fn decline(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition_to(NegotiationState::Declining)?;
        self.decline_reason = Some(reason.into());
        Ok(())
    }

    /// Move straight to `Declined` on a decline sent by the counter-party.
    pub fn declined_by_counter_party(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition_to(NegotiationState::Declined)?;
        self.decline_reason = Some(reason.into());
        Ok(())
    }

    /// Append an offer to the history.
    pub fn add_offer(&mut self, offer: ContractOffer) {
        self.offers.push(offer);
        self.refresh_hash();
    }

    /// Attach the agreement. Only allowed while the negotiation is still
    /// converging on terms.
    pub fn attach_agreement(&mut self, agreement: ContractAgreement) -> Result<(), TransitionError> {
        use NegotiationState::*;
        if !matches!(self.state, Requested | Offered | Agreeing | Agreed) {
            return Err(TransitionError::AgreementNotAttachable {
                id: self.id.clone(),
                state: self.state,
            });
        }
        self.agreement = Some(agreement);
        self.refresh_hash();
        Ok(())
    }

    /// Count a failed send attempt. Returns the new retry count.
    pub fn record_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.state_timestamp = crate::now_millis();
        self.retry_count
    }

    /// Record the counter-party's id for this negotiation if not yet known.
    pub fn correlate(&mut self, correlation_id: &str) {
        if self.correlation_id.is_none() && !correlation_id.is_empty() {
            self.correlation_id = Some(correlation_id.to_string());
        }
    }

    pub fn set_counter_party_hash(&mut self, hash: impl Into<String>) {
        self.counter_party_hash = Some(hash.into());
    }

    /// The outcome previously recorded for an inbound message key.
    pub fn processed_outcome(&self, key: &str) -> Option<&MessageOutcome> {
        self.processed
            .iter()
            .find(|m| m.key == key)
            .map(|m| &m.outcome)
    }

    pub fn record_processed(&mut self, key: impl Into<String>, outcome: MessageOutcome) {
        self.processed.push(ProcessedMessage {
            key: key.into(),
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::policy::Policy;

    fn counter_party() -> CounterParty {
        CounterParty {
            id: "provider".into(),
            address: "loopback://provider".into(),
            protocol: "loopback".into(),
        }
    }

    fn negotiation() -> ContractNegotiation {
        ContractNegotiation::new("n-1", NegotiationRole::Consumer, counter_party()).unwrap()
    }

    fn offer(id: &str) -> ContractOffer {
        ContractOffer::new(id, Policy::permit_all(), vec![Asset::new("a1")])
    }

    #[test]
    fn new_negotiation_starts_initial() {
        let n = negotiation();
        assert_eq!(n.state(), NegotiationState::Initial);
        assert_eq!(n.state_count(), 0);
        assert_eq!(n.hash(), n.compute_hash());
    }

    #[test]
    fn empty_counter_party_is_rejected() {
        let mut cp = counter_party();
        cp.id.clear();
        assert!(ContractNegotiation::new("n", NegotiationRole::Consumer, cp).is_err());
    }

    #[test]
    fn transitions_increment_state_count() {
        let mut n = negotiation();
        n.transition_to(NegotiationState::Requesting).unwrap();
        n.transition_to(NegotiationState::Requested).unwrap();
        assert_eq!(n.state_count(), 2);
    }

    #[test]
    fn illegal_transition_is_refused() {
        let mut n = negotiation();
        let err = n.transition_to(NegotiationState::Confirmed).unwrap_err();
        assert!(matches!(err, TransitionError::Negotiation { .. }));
        assert_eq!(n.state(), NegotiationState::Initial);
        assert_eq!(n.state_count(), 0);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [
            NegotiationState::Confirmed,
            NegotiationState::Declined,
            NegotiationState::Error,
        ] {
            for to in NegotiationState::ALL {
                assert!(!terminal.can_transition_to(to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn error_reachable_from_every_non_terminal_state() {
        for from in NegotiationState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(NegotiationState::Error));
        }
    }

    #[test]
    fn hash_tracks_state_and_offers_but_not_retries() {
        let mut n = negotiation();
        let h0 = n.hash().to_string();
        n.add_offer(offer("def-1"));
        let h1 = n.hash().to_string();
        assert_ne!(h0, h1);
        n.transition_to(NegotiationState::Requesting).unwrap();
        let h2 = n.hash().to_string();
        assert_ne!(h1, h2);
        n.record_retry();
        assert_eq!(n.hash(), h2);
        assert_eq!(n.retry_count(), 1);
    }

    #[test]
    fn agreement_only_attachable_before_terminal() {
        let agreement = ContractAgreement::builder()
            .id("def-1:x")
            .provider_agent_id("provider")
            .consumer_agent_id("consumer")
            .contract_signing_date(1)
            .contract_start_date(1)
            .contract_end_date(2)
            .policy(Policy::permit_all())
            .build()
            .unwrap();
        let mut n = negotiation();
        assert!(n.attach_agreement(agreement.clone()).is_err());
        n.transition_to(NegotiationState::Requesting).unwrap();
        n.transition_to(NegotiationState::Requested).unwrap();
        n.attach_agreement(agreement).unwrap();
        assert_eq!(n.agreement().map(|a| a.id()), Some("def-1:x"));
    }

    #[test]
    fn decline_keeps_reason() {
        let mut n = negotiation();
        n.decline("not interested").unwrap();
        assert_eq!(n.state(), NegotiationState::Declining);
        assert_eq!(n.decline_reason(), Some("not interested"));
        n.transition_to(NegotiationState::Declined).unwrap();
        assert!(n.decline("again").is_err());
    }

    #[test]
    fn codes_round_trip() {
        for state in NegotiationState::ALL {
            assert_eq!(NegotiationState::from_code(state.code()), Some(state));
        }
    }

    #[test]
    fn processed_messages_are_remembered() {
        let mut n = negotiation();
        assert!(n.processed_outcome("k").is_none());
        n.record_processed("k", MessageOutcome::Applied);
        assert_eq!(n.processed_outcome("k"), Some(&MessageOutcome::Applied));
    }
}
