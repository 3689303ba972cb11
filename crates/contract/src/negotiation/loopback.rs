//! In-process transport: connectors in one process reach each other by
//! address without a network hop.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use connector_core::ClaimToken;

use super::message::{NegotiationResponse, ProtocolMessage};
use super::transport::{Dispatcher, ProtocolHandler};
use crate::error::DispatchError;

pub const LOOPBACK_PROTOCOL: &str = "loopback";

/// Address book of in-process endpoints. Holds endpoints weakly so that a
/// connector going away makes its address unreachable.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: RwLock<HashMap<String, Weak<dyn ProtocolHandler>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, address: impl Into<String>, handler: &Arc<dyn ProtocolHandler>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), Arc::downgrade(handler));
    }

    pub fn unbind(&self, address: &str) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    fn resolve(&self, address: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .and_then(Weak::upgrade)
    }
}

/// Delivers messages through a [`LoopbackNetwork`], presenting one fixed
/// claim token as the sender's credential.
///
/// Messages are serialized and parsed again on the way through, so the
/// recipient only ever sees what would survive the wire.
pub struct LoopbackDispatcher {
    network: Arc<LoopbackNetwork>,
    token: ClaimToken,
}

impl LoopbackDispatcher {
    pub fn new(network: Arc<LoopbackNetwork>, token: ClaimToken) -> Self {
        Self { network, token }
    }
}

#[async_trait]
impl Dispatcher for LoopbackDispatcher {
    fn protocol(&self) -> &str {
        LOOPBACK_PROTOCOL
    }

    async fn send(&self, message: ProtocolMessage) -> Result<NegotiationResponse, DispatchError> {
        let address = message.header.counter_party_address.clone();
        let handler = self
            .network
            .resolve(&address)
            .ok_or_else(|| DispatchError::Unreachable(address.clone()))?;

        let wire = serde_json::to_vec(&message).map_err(|e| DispatchError::Transport(e.to_string()))?;
        let message: ProtocolMessage =
            serde_json::from_slice(&wire).map_err(|e| DispatchError::Transport(e.to_string()))?;

        tracing::trace!(to = %address, kind = message.payload.kind(), "loopback delivery");
        Ok(handler.handle(&self.token, message).await)
    }
}
