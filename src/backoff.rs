//! Cancel-aware exponential backoff used by both engines' retry loops.

use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Exponential backoff that races its delay against a cancellation signal.
///
/// Each [`wait`](Self::wait) call doubles the duration (capped at `max`)
/// before actually sleeping, so the delay handed out grows on every
/// invocation rather than on every failure explicitly recorded by the
/// caller. Callers that learn a concrete wait time from the server (a
/// `Retry-After` header) can override it with [`set_duration`](Self::set_duration)
/// before the next `wait`.
pub struct ExpBackoff {
    duration: Duration,
    init: Duration,
    max: Duration,
    factor: u32,
    cancel: watch::Receiver<bool>,
}

impl ExpBackoff {
    pub fn new(cancel: watch::Receiver<bool>, init: Duration, max: Duration) -> Self {
        Self {
            duration: init,
            init,
            max,
            factor: 2,
            cancel,
        }
    }

    /// Reset the backoff duration to its initial value.
    pub fn reset(&mut self) {
        self.duration = self.init;
    }

    /// Override the next wait duration directly, bypassing the exponential
    /// progression. Used to honor a server-supplied `Retry-After`.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Block until either the backoff elapses or cancellation is signaled.
    ///
    /// Returns `true` if the backoff elapsed, `false` if cancelled.
    pub async fn wait(&mut self) -> bool {
        let backoff = self.next_duration();

        tokio::select! {
            biased;
            _ = self.cancel.changed() => false,
            _ = tokio::time::sleep(backoff) => true,
        }
    }

    /// Like [`wait`](Self::wait), but reports the outcome on `sink` instead
    /// of returning it. Mirrors the event-loop pattern where backoff
    /// completion is one more coalesced event among several `select!` arms.
    pub async fn wait_and_notify(&mut self, sink: oneshot::Sender<bool>) {
        let completed = self.wait().await;
        let _ = sink.send(completed);
    }

    fn next_duration(&mut self) -> Duration {
        let backoff = self.duration;
        self.duration = (self.duration * self.factor).min(self.max);
        backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duration_doubles_up_to_max() {
        let (_tx, rx) = watch::channel(false);
        let mut backoff =
            ExpBackoff::new(rx, Duration::from_millis(1), Duration::from_millis(4));

        assert_eq!(backoff.next_duration(), Duration::from_millis(1));
        assert_eq!(backoff.next_duration(), Duration::from_millis(2));
        assert_eq!(backoff.next_duration(), Duration::from_millis(4));
        assert_eq!(backoff.next_duration(), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn reset_returns_to_init() {
        let (_tx, rx) = watch::channel(false);
        let mut backoff =
            ExpBackoff::new(rx, Duration::from_millis(1), Duration::from_millis(100));
        backoff.next_duration();
        backoff.next_duration();
        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn set_duration_overrides_progression() {
        let (_tx, rx) = watch::channel(false);
        let mut backoff =
            ExpBackoff::new(rx, Duration::from_millis(1), Duration::from_millis(100));
        backoff.set_duration(Duration::from_millis(50));
        assert_eq!(backoff.next_duration(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_wait() {
        let (tx, rx) = watch::channel(false);
        let mut backoff =
            ExpBackoff::new(rx, Duration::from_secs(30), Duration::from_secs(60));

        tx.send(true).unwrap();
        assert!(!backoff.wait().await);
    }

    #[tokio::test]
    async fn wait_completes_when_not_cancelled() {
        let (_tx, rx) = watch::channel(false);
        let mut backoff =
            ExpBackoff::new(rx, Duration::from_millis(1), Duration::from_millis(10));
        assert!(backoff.wait().await);
    }
}
