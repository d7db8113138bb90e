//! Observer registration and dispatch.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Notified once per payload message reconstructed from the transport.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, message: &str);
}

impl<F> MessageObserver for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_message(&self, message: &str) {
        self(message)
    }
}

/// Notified exactly once when the session transitions to dead.
/// `intended` distinguishes a requested close from a detected failure.
pub trait BreakdownObserver: Send + Sync {
    fn on_breakdown(&self, intended: bool);
}

impl<F> BreakdownObserver for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_breakdown(&self, intended: bool) {
        self(intended)
    }
}

/// Fans completed messages out to observers from a dedicated task, so a
/// slow or reentrant observer can never stall frame ingestion, heartbeat
/// echoing, or ack transmission. Messages reach observers in arrival
/// order. Breakdown notification is synchronous and driven by the
/// teardown path, which guarantees it happens at most once.
pub(crate) struct ObserverDispatch {
    queue: mpsc::UnboundedSender<String>,
    breakdown: Vec<Arc<dyn BreakdownObserver>>,
}

impl ObserverDispatch {
    /// Spawn the dispatch task draining the message queue. The task ends
    /// when the dispatch handle (and with it the session) is dropped.
    pub(crate) fn spawn(
        message: Vec<Arc<dyn MessageObserver>>,
        breakdown: Vec<Arc<dyn BreakdownObserver>>,
    ) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(delivered) = pending.recv().await {
                for observer in &message {
                    observer.on_message(&delivered);
                }
            }
        });
        Self { queue, breakdown }
    }

    pub(crate) fn notify_message(&self, message: String) {
        let _ = self.queue.send(message);
    }

    pub(crate) fn notify_breakdown(&self, intended: bool) {
        for observer in &self.breakdown {
            observer.on_breakdown(intended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Collector(Mutex<Vec<String>>);

    impl MessageObserver for Collector {
        fn on_message(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_owned());
        }
    }

    #[tokio::test]
    async fn messages_reach_observers_in_order() {
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        let registered: Arc<dyn MessageObserver> = collector.clone();
        let dispatch = ObserverDispatch::spawn(vec![registered], Vec::new());

        dispatch.notify_message("first".to_owned());
        dispatch.notify_message("second".to_owned());
        dispatch.notify_message("third".to_owned());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while collector.0.lock().unwrap().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*collector.0.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn breakdown_notification_is_synchronous() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Arc<dyn BreakdownObserver> = Arc::new(move |intended: bool| {
            sink.lock().unwrap().push(intended);
        });
        let dispatch = ObserverDispatch::spawn(Vec::new(), vec![observer]);

        dispatch.notify_breakdown(false);
        // Synchronous: observed before this call returns.
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn closure_observers_satisfy_the_traits() {
        let counter = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&counter);
        let observer: Arc<dyn MessageObserver> = Arc::new(move |_message: &str| {
            *sink.lock().unwrap() += 1;
        });
        let dispatch = ObserverDispatch::spawn(vec![observer], Vec::new());
        dispatch.notify_message("ping".to_owned());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while *counter.lock().unwrap() < 1 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*counter.lock().unwrap(), 1);
    }
}
