use std::time::Duration;

use super::timer::{TimerKind, TimerSlot, TimerToken};
use crate::transport::Payload;

/// Timer pair that detects an open transport whose peer has gone silent.
///
/// The cadence timer ticks every keepalive interval; a tick arms the countdown unless one is
/// already running, so a timeout longer than the interval still expires. Only the reserved
/// keepalive payload clears the countdown, and an expired countdown means the peer is presumed
/// dead.
#[derive(Debug)]
pub(crate) struct KeepaliveMonitor {
    cadence: TimerSlot,
    countdown: TimerSlot,
}

impl KeepaliveMonitor {
    pub(crate) const fn new() -> Self {
        Self {
            cadence: TimerSlot::new(TimerKind::KeepaliveCadence),
            countdown: TimerSlot::new(TimerKind::KeepaliveCountdown),
        }
    }

    pub(crate) fn start<F>(&mut self, interval: Duration, on_tick: F)
    where
        F: Fn(TimerToken) + Send + 'static,
    {
        self.countdown.cancel();
        self.cadence.arm_repeating(interval, on_tick);
    }

    pub(crate) fn is_tick_current(&self, token: TimerToken) -> bool {
        self.cadence.is_current(token)
    }

    /// Arm the countdown unless one is already pending. Returns whether it was armed.
    pub(crate) fn arm_countdown<F>(&mut self, timeout: Duration, on_expire: F) -> bool
    where
        F: FnOnce(TimerToken) + Send + 'static,
    {
        if self.countdown.is_armed() {
            return false;
        }
        self.countdown.arm_once(timeout, on_expire);
        true
    }

    /// Consume an expiry. `false` means the countdown was cleared or re-armed meanwhile.
    pub(crate) fn take_expired(&mut self, token: TimerToken) -> bool {
        self.countdown.take(token)
    }

    /// A keepalive payload arrived. Returns whether a countdown was pending.
    pub(crate) fn acknowledge(&mut self) -> bool {
        self.countdown.cancel()
    }

    pub(crate) fn stop(&mut self) {
        self.cadence.cancel();
        self.countdown.cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.cadence.is_armed()
    }
}

pub(crate) fn is_keepalive(payload: &Payload, reserved: &str) -> bool {
    payload.as_bytes() == reserved.as_bytes()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;

    #[test]
    fn keepalive_matches_exact_payload_only() {
        assert!(is_keepalive(&Payload::from("ka"), "ka"));
        assert!(is_keepalive(&Payload::from(b"ka".to_vec()), "ka"));
        assert!(!is_keepalive(&Payload::from("ka "), "ka"));
        assert!(!is_keepalive(&Payload::from("KA"), "ka"));
        assert!(!is_keepalive(&Payload::from(""), "ka"));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_clears_pending_countdown() {
        let expired = Arc::new(AtomicUsize::new(0));
        let mut monitor = KeepaliveMonitor::new();
        monitor.start(Duration::from_secs(60), |_| {});

        let counter = Arc::clone(&expired);
        assert!(monitor.arm_countdown(Duration::from_millis(50), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(monitor.acknowledge());
        assert!(!monitor.acknowledge());
        assert!(monitor.is_running());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(expired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_both_timers() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut monitor = KeepaliveMonitor::new();

        let counter = Arc::clone(&ticks);
        monitor.start(Duration::from_millis(10), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(monitor.arm_countdown(Duration::from_millis(5), |_| {}));
        monitor.stop();

        assert!(!monitor.is_running());
        assert!(!monitor.acknowledge());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_countdown_is_not_pushed_back() {
        let expired = Arc::new(AtomicUsize::new(0));
        let mut monitor = KeepaliveMonitor::new();
        monitor.start(Duration::from_secs(60), |_| {});

        let counter = Arc::clone(&expired);
        assert!(monitor.arm_countdown(Duration::from_millis(50), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sleep(Duration::from_millis(30)).await;
        assert!(!monitor.arm_countdown(Duration::from_millis(50), |_| {}));

        sleep(Duration::from_millis(21)).await;
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }
}
