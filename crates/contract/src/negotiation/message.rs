//! Wire shapes exchanged between the two sides of a negotiation.

use connector_core::{content_hash, ContractAgreement, ContractOffer, NegotiationRole};
use serde::{Deserialize, Serialize};

/// What a consumer supplies to start negotiating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOfferRequest {
    /// Address of the provider's negotiation endpoint.
    pub connector_address: String,
    /// The provider's connector id.
    pub connector_id: String,
    /// Transport protocol; selects the dispatcher.
    pub protocol: String,
    pub offer: ContractOffer,
}

/// Routing and hash-guard fields carried by every protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Where the message is delivered.
    pub counter_party_address: String,
    /// Where replies to the sender go.
    pub callback_address: String,
    /// The sender's connector id.
    pub connector_id: String,
    pub protocol: String,
    pub sender_role: NegotiationRole,
    /// The sender's id for this negotiation.
    pub correlation_id: String,
    /// The recipient's id for this negotiation, once the sender knows it.
    #[serde(default)]
    pub negotiation_id: Option<String>,
    /// The recipient's hash as last seen by the sender.
    #[serde(default)]
    pub hash: Option<String>,
    /// The sender's own hash once this message is delivered.
    pub sender_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NegotiationMessage {
    ContractRequest { offer: ContractOffer },
    ContractOffer { offer: ContractOffer },
    ContractApproval { offer_id: String },
    ContractAgreement { agreement: ContractAgreement },
    ContractRejection { reason: String },
}

impl NegotiationMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationMessage::ContractRequest { .. } => "contract_request",
            NegotiationMessage::ContractOffer { .. } => "contract_offer",
            NegotiationMessage::ContractApproval { .. } => "contract_approval",
            NegotiationMessage::ContractAgreement { .. } => "contract_agreement",
            NegotiationMessage::ContractRejection { .. } => "contract_rejection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub payload: NegotiationMessage,
}

#[derive(Serialize)]
struct KeyView<'a> {
    kind: &'a str,
    correlation_id: &'a str,
    negotiation_id: Option<&'a str>,
    payload_id: Option<&'a str>,
    hash: Option<&'a str>,
    sender_hash: &'a str,
}

pub(crate) fn message_key(header: &MessageHeader, kind: &str, payload_id: Option<&str>) -> String {
    content_hash(&KeyView {
        kind,
        correlation_id: &header.correlation_id,
        negotiation_id: header.negotiation_id.as_deref(),
        payload_id,
        hash: header.hash.as_deref(),
        sender_hash: &header.sender_hash,
    })
}

/// How the recipient answered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Applied, or a redelivery of something already applied.
    Ok,
    /// The sender's view of the recipient is stale. Nothing changed; resend
    /// once the views agree.
    Conflict,
    /// The content failed validation. The negotiation moved to `Error`.
    Rejected,
    /// Unknown negotiation, terminal negotiation, or a message the current
    /// state does not accept. Nothing changed.
    FatalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub status: ResponseStatus,
    /// The responder's negotiation id.
    pub negotiation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl NegotiationResponse {
    pub fn ok(negotiation_id: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            negotiation_id: negotiation_id.into(),
            detail: None,
        }
    }

    pub fn conflict(negotiation_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_detail(ResponseStatus::Conflict, negotiation_id, detail)
    }

    pub fn rejected(negotiation_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_detail(ResponseStatus::Rejected, negotiation_id, detail)
    }

    pub fn fatal(negotiation_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_detail(ResponseStatus::FatalError, negotiation_id, detail)
    }

    fn with_detail(
        status: ResponseStatus,
        negotiation_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            negotiation_id: negotiation_id.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_core::{Asset, Policy};

    fn message() -> ProtocolMessage {
        ProtocolMessage {
            header: MessageHeader {
                counter_party_address: "loopback://provider".into(),
                callback_address: "loopback://consumer".into(),
                connector_id: "consumer".into(),
                protocol: "loopback".into(),
                sender_role: NegotiationRole::Consumer,
                correlation_id: "c-1".into(),
                negotiation_id: None,
                hash: None,
                sender_hash: "h1".into(),
            },
            payload: NegotiationMessage::ContractRequest {
                offer: ContractOffer::new("def-1", Policy::permit_all(), vec![Asset::new("a1")]),
            },
        }
    }

    #[test]
    fn message_key_is_stable_and_sensitive() {
        let header = message().header;
        let key = message_key(&header, "contract_request", Some("def-1"));
        assert_eq!(key, message_key(&header.clone(), "contract_request", Some("def-1")));

        let mut other_hash = header.clone();
        other_hash.sender_hash = "h2".into();
        assert_ne!(key, message_key(&other_hash, "contract_request", Some("def-1")));

        assert_ne!(key, message_key(&header, "contract_request", Some("def-2")));
        assert_ne!(key, message_key(&header, "contract_approval", Some("def-1")));
    }

    #[test]
    fn wire_shape_is_flat_and_tagged() {
        let value = serde_json::to_value(message()).unwrap();
        assert_eq!(value["correlation_id"], "c-1");
        assert_eq!(value["sender_role"], "consumer");
        assert_eq!(value["payload"]["type"], "contract_request");
        let back: ProtocolMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message());
    }
}
