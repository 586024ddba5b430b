//! Timers used by the scheduling loop.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

/// Fires once no activity has been recorded for `timeout`.
///
/// The timer holds no background task, so dropping it cancels it. An explicit
/// [`cancel`](Self::cancel) makes [`fired`](Self::fired) pend forever.
pub struct InactivityTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    cancel: CancellationToken,
}

impl InactivityTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            cancel: CancellationToken::new(),
        }
    }

    /// Record activity, pushing the deadline out by a full timeout.
    pub fn touch(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the deadline passes. Cancel-safe; use inside `select!`.
    pub async fn fired(&mut self) {
        if self.cancel.is_cancelled() {
            return pending().await;
        }
        tokio::select! {
            _ = self.sleep.as_mut() => {}
            _ = self.cancel.cancelled() => pending().await,
        }
    }
}

/// Periodic tick that re-triggers scheduling and the auto-retry sweep.
pub struct Watchdog {
    interval: Interval,
}

impl Watchdog {
    pub fn new(period: Duration) -> Self {
        let start = Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}
