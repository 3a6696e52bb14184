//! Cooperative cancellation built on a [`watch`] channel.
//!
//! [`StopHandle`] is the producer side: the coordinator owns one for its workers and one for
//! the operator interrupt, and workers hold clones of the former so that a worker detecting a
//! lost update can stop its siblings. [`StopSignal`] is the consumer side, polled between
//! iterations or awaited alongside a pacing delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Result of waiting on a [`StopSignal`] for a bounded amount of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed without a stop request.
    Elapsed,
    /// A stop was requested before the duration elapsed.
    Stopped,
}

/// Producer side of a cancellation signal.
///
/// Cloning a [`StopHandle`] yields another producer for the same signal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Requests a stop.
    ///
    /// Returns `true` if this call transitioned the signal, `false` if a stop had already been
    /// requested. Requests made when no [`StopSignal`] exists are still recorded.
    pub fn request_stop(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                return false;
            }

            *stopped = true;
            true
        })
    }

    /// Returns whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Creates a new consumer observing this signal.
    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Returns `true` while no stop has been requested. Never blocks.
    pub fn should_continue(&self) -> bool {
        !*self.rx.borrow()
    }

    /// Waits until a stop is requested.
    ///
    /// Returns immediately if one was already requested. If every [`StopHandle`] is dropped
    /// without requesting a stop, this never completes.
    pub async fn wait_for_stop(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Waits for `duration` or until a stop is requested, whichever comes first.
    pub async fn wait_or_stop(&mut self, duration: Duration) -> WaitOutcome {
        if !self.should_continue() {
            return WaitOutcome::Stopped;
        }

        tokio::select! {
            biased;

            _ = self.wait_for_stop() => WaitOutcome::Stopped,
            _ = tokio::time::sleep(duration) => WaitOutcome::Elapsed,
        }
    }
}

/// Creates a fresh cancellation signal in the "continue" state.
pub fn create_stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);

    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_signal_continues() {
        let (handle, signal) = create_stop_signal();

        assert!(signal.should_continue());
        assert!(!handle.is_stop_requested());
    }

    #[test]
    fn request_stop_is_idempotent() {
        let (handle, signal) = create_stop_signal();

        assert!(handle.request_stop());
        assert!(!handle.request_stop());
        assert!(!handle.clone().request_stop());
        assert!(!signal.should_continue());
    }

    #[test]
    fn every_subscriber_observes_the_stop() {
        let (handle, first) = create_stop_signal();
        let second = handle.subscribe();
        let third = first.clone();

        handle.request_stop();

        assert!(!first.should_continue());
        assert!(!second.should_continue());
        assert!(!third.should_continue());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_or_stop_elapses_without_request() {
        let (_handle, mut signal) = create_stop_signal();

        let outcome = signal.wait_or_stop(Duration::from_millis(200)).await;

        assert_eq!(outcome, WaitOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_or_stop_wakes_up_on_request() {
        let (handle, mut signal) = create_stop_signal();

        let waiter =
            tokio::spawn(async move { signal.wait_or_stop(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.request_stop();

        assert_eq!(waiter.await.unwrap(), WaitOutcome::Stopped);
    }

    #[tokio::test]
    async fn wait_for_stop_returns_if_already_stopped() {
        let (handle, mut signal) = create_stop_signal();
        handle.request_stop();

        signal.wait_for_stop().await;

        assert_eq!(
            signal.wait_or_stop(Duration::from_secs(3600)).await,
            WaitOutcome::Stopped
        );
    }
}
