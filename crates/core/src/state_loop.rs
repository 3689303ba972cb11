//! Cooperative polling loop shared by the negotiation and transfer managers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::wait::WaitStrategy;

/// What one pass over pending entities achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Entities whose pending work completed this pass.
    pub processed: usize,
    /// Entities whose attempt failed and stays pending.
    pub failed: usize,
}

impl ProcessSummary {
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }

    pub fn merge(&mut self, other: ProcessSummary) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// One unit of work the loop repeats: scan pending entities, make at most one
/// attempt each.
#[async_trait]
pub trait StateProcessor: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process(&self) -> ProcessSummary;
}

/// Runs a [`StateProcessor`] until the shutdown channel flips to `true` or
/// its sender is dropped.
pub struct StateMachineLoop<P: StateProcessor> {
    processor: Arc<P>,
    wait: Box<dyn WaitStrategy>,
}

impl<P: StateProcessor> StateMachineLoop<P> {
    pub fn new(processor: Arc<P>, wait: Box<dyn WaitStrategy>) -> Self {
        Self { processor, wait }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let name = self.processor.name().to_string();
        tracing::debug!(processor = %name, "state machine loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let summary = self.processor.process().await;
            let delay = self.next_delay(summary);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(processor = %name, "state machine loop stopped");
    }

    fn next_delay(&mut self, summary: ProcessSummary) -> u64 {
        if summary.failed > 0 && summary.processed == 0 {
            return self.wait.retry_in_millis();
        }
        self.wait.success();
        if summary.is_idle() {
            self.wait.wait_for_millis()
        } else {
            0
        }
    }
}
