//! Delay policies for the polling loops.

/// Decides how long a polling loop sleeps between passes.
///
/// Implementations are driven by a single loop task and are not internally
/// synchronized.
pub trait WaitStrategy: Send {
    /// Delay after a pass that found nothing to do.
    fn wait_for_millis(&self) -> u64;

    /// Reset any backoff after a successful pass.
    fn success(&mut self) {}

    /// Delay before the next attempt after a failed pass.
    fn retry_in_millis(&mut self) -> u64 {
        self.wait_for_millis()
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... until `success`.
///
/// No upper bound is applied; the product saturates at `u64::MAX`.
#[derive(Debug, Clone)]
pub struct ExponentialWaitStrategy {
    base_millis: u64,
    idle_millis: u64,
    next_millis: u64,
}

impl ExponentialWaitStrategy {
    pub fn new(base_millis: u64) -> Self {
        Self::with_idle(base_millis, base_millis)
    }

    /// Backoff from `base_millis`, sleeping `idle_millis` when there is no work.
    pub fn with_idle(base_millis: u64, idle_millis: u64) -> Self {
        Self {
            base_millis,
            idle_millis,
            next_millis: base_millis,
        }
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for_millis(&self) -> u64 {
        self.idle_millis
    }

    fn success(&mut self) {
        self.next_millis = self.base_millis;
    }

    fn retry_in_millis(&mut self) -> u64 {
        let current = self.next_millis;
        self.next_millis = current.saturating_mul(2);
        current
    }
}

/// Backoff of one entity before its retry number `attempts`: nothing before
/// the first retry, then `base`, `2 * base`, `4 * base`, ...
pub fn retry_backoff_millis(base_millis: u64, attempts: u32) -> u64 {
    if attempts == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
    base_millis.saturating_mul(factor)
}

/// Whether an entity that last failed at `last_attempt_millis`, after
/// `attempts` failures, may be tried again at `now_millis`.
pub fn retry_due(last_attempt_millis: i64, attempts: u32, base_millis: u64, now_millis: i64) -> bool {
    let backoff = i64::try_from(retry_backoff_millis(base_millis, attempts)).unwrap_or(i64::MAX);
    last_attempt_millis.saturating_add(backoff) <= now_millis
}

/// Constant delay, no backoff.
#[derive(Debug, Clone, Copy)]
pub struct FixedWaitStrategy(pub u64);

impl WaitStrategy for FixedWaitStrategy {
    fn wait_for_millis(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_resets() {
        let mut strategy = ExponentialWaitStrategy::new(5000);
        assert_eq!(strategy.retry_in_millis(), 5000);
        assert_eq!(strategy.retry_in_millis(), 10000);

        strategy.success();

        assert_eq!(strategy.retry_in_millis(), 5000);
    }

    #[test]
    fn backoff_keeps_doubling_without_reset() {
        let mut strategy = ExponentialWaitStrategy::new(100);
        let seq: Vec<u64> = (0..5).map(|_| strategy.retry_in_millis()).collect();
        assert_eq!(seq, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn backoff_saturates() {
        let mut strategy = ExponentialWaitStrategy::new(u64::MAX / 2 + 1);
        strategy.retry_in_millis();
        assert_eq!(strategy.retry_in_millis(), u64::MAX);
        assert_eq!(strategy.retry_in_millis(), u64::MAX);
    }

    #[test]
    fn idle_delay_is_independent_of_backoff() {
        let mut strategy = ExponentialWaitStrategy::with_idle(1000, 50);
        strategy.retry_in_millis();
        strategy.retry_in_millis();
        assert_eq!(strategy.wait_for_millis(), 50);
    }

    #[test]
    fn entity_backoff_grows_per_attempt() {
        assert_eq!(retry_backoff_millis(100, 0), 0);
        assert_eq!(retry_backoff_millis(100, 1), 100);
        assert_eq!(retry_backoff_millis(100, 3), 400);
        assert_eq!(retry_backoff_millis(100, 80), u64::MAX);
    }

    #[test]
    fn retry_is_due_once_backoff_elapsed() {
        assert!(retry_due(1_000, 0, 500, 1_000));
        assert!(!retry_due(1_000, 1, 500, 1_499));
        assert!(retry_due(1_000, 1, 500, 1_500));
        assert!(!retry_due(1_000, 2, 500, 1_999));
        assert!(!retry_due(1_000, 70, 500, i64::MAX - 1));
        assert!(retry_due(1_000, 3, 0, 1_000));
    }

    #[test]
    fn fixed_strategy_never_backs_off() {
        let mut strategy = FixedWaitStrategy(10);
        assert_eq!(strategy.retry_in_millis(), 10);
        assert_eq!(strategy.retry_in_millis(), 10);
    }
}
