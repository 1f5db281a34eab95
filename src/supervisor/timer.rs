use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};

/// Identifies one arming of a [`TimerSlot`]. A firing whose token is no longer current is stale.
pub(crate) type TimerToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum TimerKind {
    KeepaliveCadence,
    KeepaliveCountdown,
    Retry,
}

struct Armed {
    token: TimerToken,
    task: JoinHandle<()>,
}

/// At most one live timer of a given kind.
///
/// Arming always cancels the previous timer first. Because a cancelled task may already have
/// queued its callback behind the supervisor lock, callbacks must confirm their token with
/// [`TimerSlot::is_current`] (or [`TimerSlot::take`] for one-shots) before acting.
pub(crate) struct TimerSlot {
    kind: TimerKind,
    armed: Option<Armed>,
    next_token: TimerToken,
}

impl TimerSlot {
    pub(crate) const fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            armed: None,
            next_token: 0,
        }
    }

    /// Fire `fire` once after `delay`.
    pub(crate) fn arm_once<F>(&mut self, delay: Duration, fire: F) -> TimerToken
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        self.arm(|token| {
            tokio::spawn(async move {
                sleep(delay).await;
                fire(token);
            })
        })
    }

    /// Fire `fire` every `period`, starting one period from now.
    pub(crate) fn arm_repeating<F>(&mut self, period: Duration, fire: F) -> TimerToken
    where
        F: Fn(TimerToken) + Send + 'static,
    {
        self.arm(|token| {
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    fire(token);
                }
            })
        })
    }

    fn arm<S>(&mut self, spawn: S) -> TimerToken
    where
        S: FnOnce(TimerToken) -> JoinHandle<()>,
    {
        self.cancel();

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.armed = Some(Armed {
            token,
            task: spawn(token),
        });

        #[cfg(feature = "tracing")]
        tracing::trace!(kind = %self.kind, token, "Timer armed");

        token
    }

    /// Cancel the live timer, if any. Returns whether one was live.
    pub(crate) fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                armed.task.abort();

                #[cfg(feature = "tracing")]
                tracing::trace!(kind = %self.kind, token = armed.token, "Timer cancelled");

                true
            }
            None => false,
        }
    }

    pub(crate) fn is_current(&self, token: TimerToken) -> bool {
        self.armed.as_ref().is_some_and(|armed| armed.token == token)
    }

    /// Clear the slot for a one-shot firing. Returns `false` for a stale token.
    pub(crate) fn take(&mut self, token: TimerToken) -> bool {
        if self.is_current(token) {
            self.armed = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl fmt::Debug for TimerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.armed {
            Some(armed) => write!(f, "TimerSlot({}, armed #{})", self.kind, armed.token),
            None => write!(f, "TimerSlot({}, idle)", self.kind),
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_previous_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut slot = TimerSlot::new(TimerKind::Retry);

        let first = {
            let fired = Arc::clone(&fired);
            slot.arm_once(Duration::from_millis(10), move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let second = {
            let fired = Arc::clone(&fired);
            slot.arm_once(Duration::from_millis(20), move |_| {
                fired.fetch_add(10, Ordering::SeqCst);
            })
        };

        assert_ne!(first, second);
        assert!(!slot.is_current(first));
        assert!(slot.is_current(second));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut slot = TimerSlot::new(TimerKind::KeepaliveCountdown);

        let counter = Arc::clone(&fired);
        slot.arm_once(Duration::from_millis(10), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert!(!slot.is_armed());

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_skips_immediate_tick() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut slot = TimerSlot::new(TimerKind::KeepaliveCadence);

        let counter = Arc::clone(&fired);
        slot.arm_repeating(Duration::from_millis(100), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(260)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        slot.cancel();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn take_rejects_stale_tokens() {
        let mut slot = TimerSlot::new(TimerKind::Retry);
        let stale = slot.arm_once(Duration::from_secs(1), |_| {});
        let current = slot.arm_once(Duration::from_secs(1), |_| {});

        assert!(!slot.take(stale));
        assert!(slot.is_armed());
        assert!(slot.take(current));
        assert!(!slot.is_armed());
        assert_eq!(format!("{slot:?}"), "TimerSlot(retry, idle)");
    }
}
