use std::sync::Arc;

use async_trait::async_trait;
use connector_core::{ClaimToken, NegotiationRole};
use connector_storage::ConnectorStorage;

use super::consumer::ConsumerNegotiationManager;
use super::message::{NegotiationMessage, NegotiationResponse, ProtocolMessage};
use super::provider::ProviderNegotiationManager;
use super::transport::ProtocolHandler;

/// A connector's inbound negotiation endpoint. Messages from consumers go to
/// the provider manager, messages from providers to the consumer manager.
pub struct NegotiationEndpoint<S> {
    consumer: Arc<ConsumerNegotiationManager<S>>,
    provider: Arc<ProviderNegotiationManager<S>>,
}

impl<S: ConnectorStorage> NegotiationEndpoint<S> {
    pub fn new(
        consumer: Arc<ConsumerNegotiationManager<S>>,
        provider: Arc<ProviderNegotiationManager<S>>,
    ) -> Self {
        Self { consumer, provider }
    }
}

#[async_trait]
impl<S: ConnectorStorage> ProtocolHandler for NegotiationEndpoint<S> {
    async fn handle(&self, token: &ClaimToken, message: ProtocolMessage) -> NegotiationResponse {
        let ProtocolMessage { header, payload } = message;
        let kind = payload.kind();
        let result = match (header.sender_role, payload) {
            (NegotiationRole::Consumer, NegotiationMessage::ContractRequest { offer }) => {
                self.provider.requested(token, &header, offer).await
            }
            (NegotiationRole::Consumer, NegotiationMessage::ContractApproval { offer_id }) => {
                self.provider
                    .consumer_approved(token, &header, offer_id)
                    .await
            }
            (NegotiationRole::Consumer, NegotiationMessage::ContractRejection { reason }) => {
                self.provider.declined(token, &header, reason).await
            }
            (NegotiationRole::Provider, NegotiationMessage::ContractOffer { offer }) => {
                self.consumer.offer_received(token, &header, offer).await
            }
            (NegotiationRole::Provider, NegotiationMessage::ContractAgreement { agreement }) => {
                self.consumer.confirmed(token, &header, agreement).await
            }
            (NegotiationRole::Provider, NegotiationMessage::ContractRejection { reason }) => {
                self.consumer.declined(token, &header, reason).await
            }
            (role, _) => {
                return NegotiationResponse::fatal(
                    header.negotiation_id.unwrap_or_default(),
                    format!("{role:?} may not send {kind}"),
                );
            }
        };

        result.unwrap_or_else(|e| {
            tracing::error!(
                correlation = %header.correlation_id,
                kind,
                error = %e,
                "failed to handle negotiation message"
            );
            NegotiationResponse::fatal(header.negotiation_id.unwrap_or_default(), e.to_string())
        })
    }
}
