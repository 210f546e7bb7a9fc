//! One-shot cancellation signal shared by every task of a pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Broadcast-once shutdown indicator.
///
/// Transitions from open to closed exactly once and is never reopened.
/// Clones observe the same signal. Waiters use [`CancelSignal::cancelled`],
/// which is cancel-safe and therefore usable as a `tokio::select!` branch.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    ///
    /// Returns `true` only for the call that performed the transition;
    /// every later or concurrent call is a no-op returning `false`.
    pub fn cancel(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(!signal.clone().cancel());
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_concurrent_cancel_fires_once() {
        let signal = CancelSignal::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let signal = signal.clone();
                std::thread::spawn(move || signal.cancel())
            })
            .collect();

        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn test_cancel_wakes_every_waiter() {
        let signal = CancelSignal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.cancelled().await })
            })
            .collect();

        signal.cancel();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not woken")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_the_fact() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-cancelled signal must resolve immediately");
    }
}
