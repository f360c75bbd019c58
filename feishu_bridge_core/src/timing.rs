//! Timer primitives shared by the connectors and the dedup store.

use std::time::Duration;

use tokio::task::JoinHandle;

/// A closure scheduled to run once after a delay.
///
/// Dropping the handle detaches the timer (it still fires). Use
/// [`DelayedAction::cancel`] to stop it.
pub struct DelayedAction {
    handle: JoinHandle<()>,
}

impl DelayedAction {
    pub fn schedule<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });
        Self { handle }
    }

    /// Stops the timer. Returns `false` if the action already ran.
    pub fn cancel(self) -> bool {
        let pending = !self.handle.is_finished();
        self.handle.abort();
        pending
    }

    #[cfg(test)]
    fn has_fired(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Exponential reconnect delay: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
