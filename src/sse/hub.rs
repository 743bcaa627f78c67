use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Tracks the live SSE sinks of one sandbox.
///
/// Streaming handlers register before replying; sandbox teardown calls
/// [`SseHub::shutdown_all`] so every open stream ends instead of dangling on
/// a dead sandbox.
pub struct SseHub {
    shutdown: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl SseHub {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(4);
        SseHub {
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers a sink; the guard unregisters on drop.
    pub fn register(&self) -> SseSinkGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        SseSinkGuard {
            shutdown: self.shutdown.subscribe(),
            active: self.active.clone(),
        }
    }

    pub fn active_sinks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Asks every registered sink to finish.
    pub fn shutdown_all(&self) {
        let receivers = self.shutdown.receiver_count();
        if receivers > 0 {
            debug!("Closing {} active SSE sinks", receivers);
        }
        let _ = self.shutdown.send(());
    }
}

impl Default for SseHub {
    fn default() -> Self {
        SseHub::new()
    }
}

/// Live-sink handle. Select on [`SseSinkGuard::closed`] inside stream loops.
pub struct SseSinkGuard {
    shutdown: broadcast::Receiver<()>,
    active: Arc<AtomicUsize>,
}

impl SseSinkGuard {
    /// Resolves when the hub shuts down.
    pub async fn closed(&mut self) {
        let _ = self.shutdown.recv().await;
    }
}

impl Drop for SseSinkGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn counts_and_releases_sinks() {
        let hub = SseHub::new();
        assert_eq!(hub.active_sinks(), 0);

        let first = hub.register();
        let second = hub.register();
        assert_eq!(hub.active_sinks(), 2);

        drop(first);
        assert_eq!(hub.active_sinks(), 1);
        drop(second);
        assert_eq!(hub.active_sinks(), 0);
    }

    #[tokio::test]
    async fn shutdown_reaches_registered_sinks() {
        let hub = SseHub::new();
        let mut guard = hub.register();

        let waiter = tokio::spawn(async move {
            guard.closed().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.shutdown_all();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("sink should observe shutdown")
            .unwrap();
    }
}
