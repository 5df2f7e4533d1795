//! Cooperative cancellation for in-flight sync cycles.

use tokio::sync::watch;

/// A cancellation flag shared between a running cycle and its caller.
///
/// Cancellation is honored between chunks and between retry attempts, never
/// mid-call, so queue entries and record statuses always reflect the last
/// fully-completed chunk.
#[derive(Debug)]
pub struct CancelFlag {
    tx: watch::Sender<bool>,
}

impl CancelFlag {
    /// Creates a flag in the not-cancelled state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Requests cancellation, waking any suspended retry delay.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clears the flag before a new cycle starts.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn flag_roundtrip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());

        flag.cancel();
        assert!(flag.is_cancelled());

        flag.reset();
        assert!(!flag.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_set() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_wakes_a_waiter() {
        let flag = std::sync::Arc::new(CancelFlag::new());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        waiter.await.unwrap();
    }
}
