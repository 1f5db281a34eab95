use std::time::Duration;

use backoff::backoff::{Backoff as _, Constant};

use super::timer::{TimerKind, TimerSlot, TimerToken};
use crate::config::ConnectionConfig;

/// Fixed-delay, unbounded reconnect driver.
#[derive(Debug)]
pub(crate) struct RetryScheduler {
    policy: Constant,
    interval: Duration,
    slot: TimerSlot,
    /// Retries since the last successful open
    attempt: u32,
}

impl RetryScheduler {
    pub(crate) fn new(config: &ConnectionConfig) -> Self {
        Self {
            policy: config.into(),
            interval: config.retry_interval,
            slot: TimerSlot::new(TimerKind::Retry),
            attempt: 0,
        }
    }

    pub(crate) const fn interval(&self) -> Duration {
        self.interval
    }

    /// Takes effect at the next scheduled retry.
    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
        self.policy = Constant::new(interval);
    }

    /// Arm the retry timer, replacing any pending one. Returns the attempt number and delay.
    pub(crate) fn schedule<F>(&mut self, fire: F) -> (u32, Duration)
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        let delay = self.policy.next_backoff().unwrap_or(self.interval);
        self.attempt = self.attempt.saturating_add(1);
        self.slot.arm_once(delay, fire);
        (self.attempt, delay)
    }

    /// Consume a firing. Returns the attempt number, or `None` for a stale token.
    pub(crate) fn fire(&mut self, token: TimerToken) -> Option<u32> {
        self.slot.take(token).then_some(self.attempt)
    }

    pub(crate) fn cancel(&mut self) -> bool {
        self.slot.cancel()
    }

    /// The connection opened; the next failure starts counting from one again.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.policy.reset();
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.slot.is_armed()
    }
}
