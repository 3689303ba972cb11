use serde::{Deserialize, Serialize};

/// Settings for both negotiation managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NegotiationConfig {
    /// This connector's id. Used as the provider identity in agreements and
    /// as the sender id on outbound messages.
    pub connector_id: String,
    /// Address counter-parties send replies to.
    pub callback_address: String,
    /// Failed sends tolerated in one state before the negotiation errors.
    pub max_retries: u32,
    /// Negotiations picked up per pending state per pass.
    pub batch_size: usize,
    /// Sleep when a pass found nothing to send.
    pub idle_millis: u64,
    /// Backoff before a failed send is retried, doubled per failure. Also
    /// the dispatch loop's first backoff after a pass where every send failed.
    pub retry_base_millis: u64,
    /// Lifetime of a new agreement, from signing.
    pub agreement_validity_secs: i64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            connector_id: "connector".to_string(),
            callback_address: "loopback://connector".to_string(),
            max_retries: 5,
            batch_size: 10,
            idle_millis: 250,
            retry_base_millis: 1000,
            agreement_validity_secs: 31_536_000,
        }
    }
}

impl NegotiationConfig {
    pub fn with_connector_id(mut self, connector_id: impl Into<String>) -> Self {
        self.connector_id = connector_id.into();
        self
    }

    pub fn with_callback_address(mut self, address: impl Into<String>) -> Self {
        self.callback_address = address.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: NegotiationConfig =
            serde_json::from_str(r#"{"connector_id": "provider", "max_retries": 2}"#).unwrap();
        assert_eq!(config.connector_id, "provider");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.agreement_validity_secs, 31_536_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<NegotiationConfig>(r#"{"max_retry": 2}"#).is_err());
    }
}
