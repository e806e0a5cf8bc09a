use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// Status Poller
// ============================================================================

/// Repeated status observation with caller-controlled cancellation.
///
/// Runs `fetch` on a fixed period (first observation immediately) and
/// forwards each successful result over the channel. The task ends
/// deterministically when [`StatusPoller::stop`] is called, when the
/// poller is dropped, or when the receiver goes away.
pub struct StatusPoller {
    handle: JoinHandle<()>,
}

impl StatusPoller {
    pub fn spawn<T, F, Fut>(period: Duration, tx: mpsc::Sender<T>, fetch: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(value) = fetch().await {
                    if tx.send(value).await.is_err() {
                        // Receiver gone; the owning context was torn down.
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
