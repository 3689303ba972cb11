//! Seams between the negotiation managers and the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use connector_core::ClaimToken;

use super::message::{NegotiationResponse, ProtocolMessage};
use crate::error::DispatchError;

/// Sends protocol messages over one transport protocol.
///
/// The response is the recipient's synchronous acknowledgement. A dispatcher
/// attaches the local connector's credential; the recipient sees it as the
/// claim token of the message.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn protocol(&self) -> &str;

    async fn send(&self, message: ProtocolMessage) -> Result<NegotiationResponse, DispatchError>;
}

/// Receives protocol messages on behalf of a connector.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn handle(&self, token: &ClaimToken, message: ProtocolMessage) -> NegotiationResponse;
}

/// Dispatchers keyed by protocol name.
#[derive(Default, Clone)]
pub struct DispatcherRegistry {
    dispatchers: HashMap<String, Arc<dyn Dispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatcher under its protocol, replacing any previous one.
    pub fn register(&mut self, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers
            .insert(dispatcher.protocol().to_string(), dispatcher);
    }

    pub fn get(&self, protocol: &str) -> Option<&Arc<dyn Dispatcher>> {
        self.dispatchers.get(protocol)
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut protocols: Vec<&str> = self.dispatchers.keys().map(String::as_str).collect();
        protocols.sort_unstable();
        protocols
    }

    /// Send through the dispatcher registered for the message's protocol.
    pub async fn send(&self, message: ProtocolMessage) -> Result<NegotiationResponse, DispatchError> {
        let protocol = message.header.protocol.clone();
        match self.dispatchers.get(&protocol) {
            Some(dispatcher) => dispatcher.send(message).await,
            None => Err(DispatchError::UnknownProtocol(protocol)),
        }
    }
}
