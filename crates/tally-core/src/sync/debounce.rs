//! Per-collection trailing-edge debounced refresh.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type RefreshFn = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Debouncer {
    trigger: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

/// Coalesces bursts of refresh requests into one callback per collection.
///
/// Debouncers are created lazily on first use and reused afterwards.
pub struct RefreshScheduler {
    delay: Duration,
    callback: RefreshFn,
    debouncers: Mutex<HashMap<String, Debouncer>>,
}

impl RefreshScheduler {
    /// `callback` runs with the collection name once a burst settles
    pub fn new<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: RefreshFn = Arc::new(
            move |collection: String| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(callback(collection))
            },
        );
        Self {
            delay,
            callback,
            debouncers: Mutex::new(HashMap::new()),
        }
    }

    fn debouncers(&self) -> MutexGuard<'_, HashMap<String, Debouncer>> {
        self.debouncers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a refresh; fires `delay` after the last request of a burst
    pub fn schedule(&self, collection: &str) {
        let mut debouncers = self.debouncers();
        if let Some(debouncer) = debouncers.get(collection) {
            if debouncer.trigger.send(()).is_ok() {
                return;
            }
        }

        let (trigger, rx) = mpsc::unbounded_channel();
        let _ = trigger.send(());
        let task = tokio::spawn(run_debouncer(
            collection.to_string(),
            self.delay,
            rx,
            Arc::clone(&self.callback),
        ));
        debouncers.insert(collection.to_string(), Debouncer { trigger, task });
    }

    /// Number of collections with a live debouncer
    pub fn debouncer_count(&self) -> usize {
        self.debouncers().len()
    }

    /// Abort every debouncer; pending refreshes are dropped
    pub fn shutdown(&self) {
        for (_, debouncer) in self.debouncers().drain() {
            debouncer.task.abort();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_debouncer(
    collection: String,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<()>,
    callback: RefreshFn,
) {
    while rx.recv().await.is_some() {
        // Keep extending the window while requests arrive
        loop {
            match tokio::time::timeout(delay, rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => {
                    callback(collection.clone()).await;
                    return;
                }
                Err(_) => break,
            }
        }
        tracing::trace!("Debounced refresh of {collection}");
        callback(collection.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler() -> (RefreshScheduler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let scheduler = RefreshScheduler::new(Duration::from_millis(500), move |_collection| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (scheduler, count)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_fires_once_after_quiet_window() {
        let (scheduler, count) = counting_scheduler();

        scheduler.schedule("products");
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.schedule("products");
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.schedule("products");

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.debouncer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_fire_separately() {
        let (scheduler, count) = counting_scheduler();

        scheduler.schedule("products");
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.schedule("products");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn collections_debounce_independently() {
        let (scheduler, count) = counting_scheduler();

        scheduler.schedule("products");
        scheduler.schedule("sales");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.debouncer_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_refreshes() {
        let (scheduler, count) = counting_scheduler();

        scheduler.schedule("products");
        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.debouncer_count(), 0);
    }
}
