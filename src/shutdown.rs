//! Cooperative cancellation over a `watch::Receiver<bool>`
//!
//! `true` means shutdown was requested. A dropped sender counts as shutdown.

use std::time::Duration;
use tokio::sync::watch;

/// Resolve once shutdown is requested
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    // wait_for checks the current value first, then every change
    let _ = shutdown_rx.wait_for(|requested| *requested).await;
}

/// Perform interruptible sleep with shutdown monitoring.
/// Returns true if sleep completed, false if shutdown requested.
pub async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut rx, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_promptly() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(true);
        });

        let started = std::time::Instant::now();
        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_requested_skips_sleep() {
        let (_tx, mut rx) = watch::channel(true);
        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(30)).await);
    }
}
