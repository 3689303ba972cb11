use std::sync::Arc;

use async_trait::async_trait;
use connector_core::{
    ClaimToken, ContractAgreement, ContractNegotiation, ContractOffer, CounterParty,
    NegotiationRole, NegotiationState, ProcessSummary, StateProcessor, CONTRACT_ID_SEPARATOR,
};
use connector_storage::ConnectorStorage;
use uuid::Uuid;

use super::common::{
    counter_party_declined, decline_locally, expect_state, missing_id, ManagerCore, Outbound,
    Step,
};
use super::message::{message_key, MessageHeader, NegotiationMessage, NegotiationResponse};
use super::transport::DispatcherRegistry;
use super::{AcceptAll, NegotiationListener, OfferDecision, OfferDecisionPolicy};
use crate::config::NegotiationConfig;
use crate::error::NegotiationError;
use crate::validation::{ContractValidationService, OfferValidation};

/// Answers negotiations consumers open with this connector.
pub struct ProviderNegotiationManager<S> {
    core: ManagerCore<S>,
}

impl<S: ConnectorStorage> ProviderNegotiationManager<S> {
    /// Create a manager that agrees to every request that validates.
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
                role: NegotiationRole::Provider,
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

    /// A consumer requested an offer, either to open a negotiation or as a
    /// counter-request to an offer this side made.
    ///
    /// The requested offer is never stored as received: it is rebuilt from
    /// the definition it names, and a request that fails that moves the
    /// negotiation to `Error`. Opening requests are idempotent per consumer
    /// negotiation id.
    ///
    /// The consumer is the participant the token identifies. An opening
    /// request whose token carries no identity, or one other than the
    /// sender id in the header, is refused without opening anything.
    pub async fn requested(
        &self,
        token: &ClaimToken,
        header: &MessageHeader,
        offer: ContractOffer,
    ) -> Result<NegotiationResponse, NegotiationError> {
        let key = message_key(header, "contract_request", Some(&offer.id));
        let validation = self.core.validation.as_ref();
        let counter_request = |n: &mut ContractNegotiation| {
            if let Some(refused) =
                expect_state(n, &[NegotiationState::Offered], "contract request")
            {
                return Ok(refused);
            }
            if !validation.validate_sender(token, &n.counter_party().id) {
                return Ok(Step::Refused(
                    "request not sent by the counter-party".to_string(),
                ));
            }
            self.apply_request(n, token, &offer)
        };

        if let Some(id) = header.negotiation_id.as_deref() {
            return self.core.receive(id, header, key, counter_request).await;
        }

        let id = negotiation_id_for(header);
        let consumer = match validation.identify(token) {
            Some(identity) if identity == header.connector_id => identity,
            identity => {
                tracing::warn!(
                    negotiation = %id,
                    sender = %header.connector_id,
                    identity = ?identity,
                    "contract request refused: sender does not match token identity"
                );
                return Ok(NegotiationResponse::fatal(
                    id,
                    format!(
                        "sender '{}' is not the participant the token identifies",
                        header.connector_id
                    ),
                ));
            }
        };
        let counter_party = CounterParty {
            id: consumer,
            address: header.callback_address.clone(),
            protocol: header.protocol.clone(),
        };
        let negotiation =
            match ContractNegotiation::new(id.clone(), NegotiationRole::Provider, counter_party) {
                Ok(negotiation) => negotiation,
                Err(e) => return Ok(NegotiationResponse::fatal(id, e.to_string())),
            };

        let opened = self
            .core
            .receive_new(negotiation, header, key.clone(), |n| {
                self.apply_request(n, token, &offer)
            })
            .await?;
        match opened {
            Some(response) => {
                tracing::info!(
                    negotiation = %id,
                    consumer = %header.connector_id,
                    status = ?response.status,
                    "contract request received"
                );
                Ok(response)
            }
            // Already opened by an earlier delivery of this request.
            None => self.core.receive(&id, header, key, counter_request).await,
        }
    }

    /// The consumer approved the last offer this side made.
    pub async fn consumer_approved(
        &self,
        token: &ClaimToken,
        header: &MessageHeader,
        offer_id: String,
    ) -> Result<NegotiationResponse, NegotiationError> {
        let Some(id) = header.negotiation_id.as_deref() else {
            return Ok(missing_id());
        };
        let key = message_key(header, "contract_approval", Some(&offer_id));
        let validation = self.core.validation.as_ref();
        self.core
            .receive(id, header, key, |n| {
                if let Some(refused) =
                    expect_state(n, &[NegotiationState::Offered], "contract approval")
                {
                    return Ok(refused);
                }
                if !validation.validate_sender(token, &n.counter_party().id) {
                    return Ok(Step::Refused(
                        "approval not sent by the counter-party".to_string(),
                    ));
                }
                let last = n.last_offer().map(|o| o.id.clone());
                if last.as_deref() != Some(offer_id.as_str()) {
                    return Ok(Step::Rejected(format!(
                        "approval names offer '{offer_id}', last offered {last:?}"
                    )));
                }
                self.agree(n)?;
                Ok(Step::Applied(None))
            })
            .await
    }

    /// The consumer declined.
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

    // ── Manual decisions on deferred requests ───────────────────────

    /// Agree to the consumer's last request.
    pub async fn approve(&self, id: &str) -> Result<NegotiationResponse, NegotiationError> {
        self.core
            .command(id, |n| {
                if n.state() != NegotiationState::Requested {
                    return Ok(Some(format!("nothing to approve in state {:?}", n.state())));
                }
                self.agree(n)?;
                Ok(None)
            })
            .await
    }

    /// Answer the consumer's last request with different terms.
    pub async fn counter(
        &self,
        id: &str,
        offer: ContractOffer,
    ) -> Result<NegotiationResponse, NegotiationError> {
        self.core
            .command(id, |n| {
                if n.state() != NegotiationState::Requested {
                    return Ok(Some(format!("nothing to counter in state {:?}", n.state())));
                }
                self.answer(n, OfferDecision::Counter(offer))?;
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

    // ── Internals ────────────────────────────────────────────────────

    fn apply_request(
        &self,
        n: &mut ContractNegotiation,
        token: &ClaimToken,
        offer: &ContractOffer,
    ) -> Result<Step, NegotiationError> {
        match self.core.validation.validate_offer(token, offer) {
            OfferValidation::Invalid(reason) => Ok(Step::Rejected(reason)),
            OfferValidation::Valid(sanitized) => {
                n.add_offer(sanitized.clone());
                n.transition_to(NegotiationState::Requested)?;
                let decision = self.core.decisions.decide(n, &sanitized);
                self.answer(n, decision)?;
                Ok(Step::Applied(None))
            }
        }
    }

    /// Apply the provider's decision on a request it holds in `Requested`.
    fn answer(
        &self,
        n: &mut ContractNegotiation,
        decision: OfferDecision,
    ) -> Result<(), NegotiationError> {
        match decision {
            OfferDecision::Accept => self.agree(n)?,
            OfferDecision::Counter(offer) => {
                n.add_offer(offer);
                n.transition_to(NegotiationState::Offering)?;
            }
            OfferDecision::Decline(reason) => n.decline(reason)?,
            OfferDecision::Defer => {}
        }
        Ok(())
    }

    /// Move to `Agreeing` with an agreement over the last offer.
    fn agree(&self, n: &mut ContractNegotiation) -> Result<(), NegotiationError> {
        let offer = n
            .last_offer()
            .cloned()
            .ok_or_else(|| NegotiationError::InvalidOffer("no offer to agree on".to_string()))?;
        let agreement = self.agreement_for(n, &offer)?;
        n.transition_to(NegotiationState::Agreeing)?;
        n.attach_agreement(agreement)?;
        Ok(())
    }

    fn agreement_for(
        &self,
        n: &ContractNegotiation,
        offer: &ContractOffer,
    ) -> Result<ContractAgreement, NegotiationError> {
        let definition_id = offer.definition_id().unwrap_or(&offer.id);
        let now = connector_core::now_secs();
        let agreement = ContractAgreement::builder()
            .id(format!("{definition_id}{CONTRACT_ID_SEPARATOR}{}", Uuid::new_v4()))
            .provider_agent_id(self.core.config.connector_id.clone())
            .consumer_agent_id(n.counter_party().id.clone())
            .contract_signing_date(now)
            .contract_start_date(now)
            .contract_end_date(now + self.core.config.agreement_validity_secs)
            .asset_ids(offer.asset_ids())
            .policy(offer.policy.clone())
            .build()?;
        Ok(agreement)
    }
}

#[async_trait]
impl<S: ConnectorStorage> StateProcessor for ProviderNegotiationManager<S> {
    fn name(&self) -> &str {
        "provider-negotiation"
    }

    async fn process(&self) -> ProcessSummary {
        self.core.process_pending(outbound).await
    }
}

/// The provider's negotiation id for a consumer negotiation. Derived rather
/// than random so that concurrent deliveries of one opening request collide
/// on create instead of opening two negotiations.
fn negotiation_id_for(header: &MessageHeader) -> String {
    let name = format!("{}/{}", header.connector_id, header.correlation_id);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

fn outbound(n: &ContractNegotiation) -> Result<Outbound, String> {
    match n.state() {
        NegotiationState::Offering => {
            let offer = n
                .last_offer()
                .cloned()
                .ok_or_else(|| "no offer to send".to_string())?;
            Ok(Outbound {
                payload: NegotiationMessage::ContractOffer { offer },
                next: NegotiationState::Offered,
            })
        }
        NegotiationState::Agreeing => {
            let agreement = n
                .agreement()
                .cloned()
                .ok_or_else(|| "no agreement to send".to_string())?;
            Ok(Outbound {
                payload: NegotiationMessage::ContractAgreement { agreement },
                next: NegotiationState::Confirmed,
            })
        }
        NegotiationState::Declining => Ok(Outbound {
            payload: NegotiationMessage::ContractRejection {
                reason: n.decline_reason().unwrap_or("declined").to_string(),
            },
            next: NegotiationState::Declined,
        }),
        other => Err(format!("provider has nothing to send in state {other:?}")),
    }
}
