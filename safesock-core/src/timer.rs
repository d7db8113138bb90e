//! Cancellable one-shot deadline alarms backing all timeout detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// One-shot alarm. Armed on construction; a `defuse` before expiry
/// suppresses the callback, otherwise it fires exactly once with the
/// label of the missed obligation. Both outcomes are terminal.
pub struct DeadlineTimer {
    resolved: Arc<AtomicBool>,
    countdown: JoinHandle<()>,
}

impl DeadlineTimer {
    /// Start the countdown. `on_expire` runs on a background task if the
    /// deadline passes without a defuse.
    pub fn arm<F>(duration: Duration, label: impl Into<String>, on_expire: F) -> Self
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let label = label.into();
        let resolved = Arc::new(AtomicBool::new(false));
        let latch = Arc::clone(&resolved);
        let countdown = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Whoever swaps the latch first owns the outcome.
            if !latch.swap(true, Ordering::AcqRel) {
                tracing::warn!(label = %label, "deadline expired without acknowledgment");
                on_expire(&label);
            }
        });
        Self { resolved, countdown }
    }

    /// Suppress the callback. Safe at any time; after the firing decision
    /// it is a harmless no-op.
    pub fn defuse(&self) {
        if !self.resolved.swap(true, Ordering::AcqRel) {
            self.countdown.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_with_its_label_after_the_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = DeadlineTimer::arm(Duration::from_millis(50), "HB-3", move |label| {
            let _ = tx.send(label.to_owned());
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rx.recv().await, Some("HB-3".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn defused_timer_stays_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let timer = DeadlineTimer::arm(Duration::from_millis(50), "HB-3", move |label| {
            let _ = tx.send(label.to_owned());
        });
        timer.defuse();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn defuse_after_firing_is_a_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = DeadlineTimer::arm(Duration::from_millis(10), "MA-x", move |label| {
            let _ = tx.send(label.to_owned());
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.defuse();
        timer.defuse();
        assert_eq!(rx.recv().await, Some("MA-x".to_owned()));
        // Exactly one firing.
        assert!(rx.try_recv().is_err());
    }
}
