use std::sync::Arc;

use async_trait::async_trait;
use connector_core::{
    ClaimToken, ContractAgreement, ContractNegotiation, ContractOffer, CounterParty,
    NegotiationRole, NegotiationState, ProcessSummary, StateProcessor,
};
use connector_storage::ConnectorStorage;
use uuid::Uuid;

use super::common::{
    counter_party_declined, decline_locally, expect_state, missing_id, Event, ManagerCore,
    Outbound, Step,
};
use super::message::{
    message_key, ContractOfferRequest, MessageHeader, NegotiationMessage, NegotiationResponse,
};
use super::transport::DispatcherRegistry;
use super::{AcceptAll, NegotiationListener, OfferDecision, OfferDecisionPolicy};
use crate::config::NegotiationConfig;
use crate::error::{DispatchError, NegotiationError};
use crate::validation::{ContractValidationService, OfferValidation};

/// Drives negotiations this connector starts as a consumer.
pub struct ConsumerNegotiationManager<S> {
    core: ManagerCore<S>,
}

impl<S: ConnectorStorage> ConsumerNegotiationManager<S> {
    /// Create a manager that approves every valid counter-offer.
    pub fn new(
        storage: Arc<S>,
        validation: Arc<ContractValidationService>,
        dispatchers: Arc<DispatcherRegistry>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            core: ManagerCore {
                storage,
                validation,
                dispatchers,
                decisions: Arc::new(AcceptAll),
                listeners: Vec::new(),
                config,
                role: NegotiationRole::Consumer,
            },
        }
    }

    pub fn with_decision_policy(mut self, decisions: Arc<dyn OfferDecisionPolicy>) -> Self {
        self.core.decisions = decisions;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn NegotiationListener>) -> Self {
        self.core.listeners.push(listener);
        self
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.core.config
    }

    /// Start a negotiation for `request.offer` with the provider at
    /// `request.connector_address`.
    ///
    /// The negotiation is stored in `Requesting`; the request itself goes
    /// out on the next dispatch pass.
    pub async fn initiate(
        &self,
        request: ContractOfferRequest,
    ) -> Result<NegotiationResponse, NegotiationError> {
        if request.offer.definition_id().is_none() {
            return Err(NegotiationError::InvalidOffer(format!(
                "malformed offer id '{}'",
                request.offer.id
            )));
        }
        if request.offer.assets.is_empty() {
            return Err(NegotiationError::InvalidOffer("offer names no assets".to_string()));
        }
        if self.core.dispatchers.get(&request.protocol).is_none() {
            return Err(DispatchError::UnknownProtocol(request.protocol).into());
        }

        let counter_party = CounterParty {
            id: request.connector_id,
            address: request.connector_address,
            protocol: request.protocol,
        };
        let mut negotiation = ContractNegotiation::new(
            Uuid::new_v4().to_string(),
            NegotiationRole::Consumer,
            counter_party,
        )?;
        negotiation.add_offer(request.offer);
        negotiation.transition_to(NegotiationState::Requesting)?;

        let id = negotiation.id().to_string();
        self.core.insert(negotiation).await?;
        tracing::info!(negotiation = %id, "contract negotiation initiated");
        Ok(NegotiationResponse::ok(id))
    }

    /// The provider answered the request with different terms.
    pub async fn offer_received(
        &self,
        token: &ClaimToken,
        header: &MessageHeader,
        offer: ContractOffer,
    ) -> Result<NegotiationResponse, NegotiationError> {
        let Some(id) = header.negotiation_id.as_deref() else {
            return Ok(missing_id());
        };
        let key = message_key(header, "contract_offer", Some(&offer.id));
        let validation = self.core.validation.as_ref();
        let decisions = self.core.decisions.as_ref();
        self.core
            .receive(id, header, key, |n| {
                if let Some(refused) =
                    expect_state(n, &[NegotiationState::Requested], "contract offer")
                {
                    return Ok(refused);
                }
                let Some(previous) = n.last_offer().cloned() else {
                    return Ok(Step::Rejected("no offer on record".to_string()));
                };
                let counter_party = n.counter_party().id.clone();
                match validation.validate_counter_offer(token, &counter_party, &previous, &offer) {
                    OfferValidation::Invalid(reason) => Ok(Step::Rejected(reason)),
                    OfferValidation::Valid(offer) => {
                        n.add_offer(offer.clone());
                        n.transition_to(NegotiationState::Offered)?;
                        let decision = decisions.decide(n, &offer);
                        answer(n, decision)?;
                        Ok(Step::Applied(None))
                    }
                }
            })
            .await
    }

    /// The provider agreed. The agreement is accepted from one of its two
    /// parties only.
    pub async fn confirmed(
        &self,
        token: &ClaimToken,
        header: &MessageHeader,
        agreement: ContractAgreement,
    ) -> Result<NegotiationResponse, NegotiationError> {
        let Some(id) = header.negotiation_id.as_deref() else {
            return Ok(missing_id());
        };
        let key = message_key(header, "contract_agreement", Some(agreement.id()));
        let validation = self.core.validation.as_ref();
        self.core
            .receive(id, header, key, |n| {
                if let Some(refused) = expect_state(
                    n,
                    &[NegotiationState::Requested, NegotiationState::Agreed],
                    "contract agreement",
                ) {
                    return Ok(refused);
                }
                if !validation.validate_agreement(token, &agreement) {
                    return Ok(Step::Rejected(format!(
                        "agreement '{}' not presented by one of its parties",
                        agreement.id()
                    )));
                }
                n.attach_agreement(agreement)?;
                n.transition_to(NegotiationState::Confirmed)?;
                Ok(Step::Applied(Some(Event::Confirmed)))
            })
            .await
    }

    /// The provider declined.
    pub async fn declined(
        &self,
        token: &ClaimToken,
        header: &MessageHeader,
        reason: String,
    ) -> Result<NegotiationResponse, NegotiationError> {
        let Some(id) = header.negotiation_id.as_deref() else {
            return Ok(missing_id());
        };
        let key = message_key(header, "contract_rejection", None);
        let validation = self.core.validation.as_ref();
        self.core
            .receive(id, header, key, |n| {
                counter_party_declined(validation, token, n, reason)
            })
            .await
    }

    // ── Manual decisions on deferred offers ─────────────────────────

    /// Approve the provider's last offer.
    pub async fn approve(&self, id: &str) -> Result<NegotiationResponse, NegotiationError> {
        self.core
            .command(id, |n| {
                if n.state() != NegotiationState::Offered {
                    return Ok(Some(format!("nothing to approve in state {:?}", n.state())));
                }
                n.transition_to(NegotiationState::Agreeing)?;
                Ok(None)
            })
            .await
    }

    /// Answer the provider's last offer with new terms.
    pub async fn counter(
        &self,
        id: &str,
        offer: ContractOffer,
    ) -> Result<NegotiationResponse, NegotiationError> {
        self.core
            .command(id, |n| {
                if n.state() != NegotiationState::Offered {
                    return Ok(Some(format!("nothing to counter in state {:?}", n.state())));
                }
                answer(n, OfferDecision::Counter(offer))?;
                Ok(None)
            })
            .await
    }

    pub async fn decline(
        &self,
        id: &str,
        reason: impl Into<String>,
    ) -> Result<NegotiationResponse, NegotiationError> {
        let reason = reason.into();
        self.core.command(id, |n| decline_locally(n, reason)).await
    }
}

#[async_trait]
impl<S: ConnectorStorage> StateProcessor for ConsumerNegotiationManager<S> {
    fn name(&self) -> &str {
        "consumer-negotiation"
    }

    async fn process(&self) -> ProcessSummary {
        self.core.process_pending(outbound).await
    }
}

/// Apply the consumer's decision on an offer it holds in `Offered`.
fn answer(n: &mut ContractNegotiation, decision: OfferDecision) -> Result<(), NegotiationError> {
    match decision {
        OfferDecision::Accept => n.transition_to(NegotiationState::Agreeing)?,
        OfferDecision::Counter(offer) => {
            n.add_offer(offer);
            n.transition_to(NegotiationState::Requesting)?;
        }
        OfferDecision::Decline(reason) => n.decline(reason)?,
        OfferDecision::Defer => {}
    }
    Ok(())
}

fn outbound(n: &ContractNegotiation) -> Result<Outbound, String> {
    match n.state() {
        NegotiationState::Requesting => {
            let offer = n
                .last_offer()
                .cloned()
                .ok_or_else(|| "no offer to request".to_string())?;
            Ok(Outbound {
                payload: NegotiationMessage::ContractRequest { offer },
                next: NegotiationState::Requested,
            })
        }
        NegotiationState::Agreeing => {
            let offer_id = n
                .last_offer()
                .map(|o| o.id.clone())
                .ok_or_else(|| "no offer to approve".to_string())?;
            Ok(Outbound {
                payload: NegotiationMessage::ContractApproval { offer_id },
                next: NegotiationState::Agreed,
            })
        }
        NegotiationState::Declining => Ok(Outbound {
            payload: NegotiationMessage::ContractRejection {
                reason: n.decline_reason().unwrap_or("declined").to_string(),
            },
            next: NegotiationState::Declined,
        }),
        other => Err(format!("consumer has nothing to send in state {other:?}")),
    }
}
