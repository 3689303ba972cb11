use serde::{Deserialize, Serialize};

/// Settings of a [`TransferProcessManager`](crate::TransferProcessManager)
/// and its dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Provisioning requests that may fail with a retryable error before
    /// the process moves to `Error`.
    pub max_retries: u32,
    /// Processes started per state per pass.
    pub batch_size: usize,
    pub idle_millis: u64,
    /// Backoff before a failed request is re-issued, doubled per failure.
    pub retry_base_millis: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            batch_size: 10,
            idle_millis: 250,
            retry_base_millis: 1000,
        }
    }
}
