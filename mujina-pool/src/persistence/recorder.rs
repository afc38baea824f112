//! Queue and consumer task for the share pipeline.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ExponentialBackoff, ShareFallback, ShareStore};
use crate::config::PersistenceConfig;
use crate::share::Share;
use crate::tracing::prelude::*;

/// Producer side of the pipeline. Cheap to clone; one per connection.
#[derive(Clone)]
pub struct ShareRecorder {
    tx: mpsc::UnboundedSender<Share>,
    depth: Arc<QueueDepth>,
}

impl ShareRecorder {
    /// Queue a share for persistence. Returns immediately.
    ///
    /// Returns false when the consumer has gone away, in which case the
    /// share could not be queued.
    pub fn enqueue(&self, share: Share) -> bool {
        self.depth.increment();
        match self.tx.send(share) {
            Ok(()) => true,
            Err(mpsc::error::SendError(share)) => {
                self.depth.decrement();
                error!(
                    miner = %share.miner,
                    height = share.block_height,
                    "Share pipeline closed, share not queued."
                );
                false
            }
        }
    }

    /// Shares waiting to be persisted.
    pub fn queue_depth(&self) -> usize {
        self.depth.get()
    }
}

/// Queue depth with a hysteresis backlog warning.
#[derive(Debug)]
struct QueueDepth {
    depth: AtomicUsize,
    warned: AtomicBool,
    threshold: usize,
}

impl QueueDepth {
    fn new(threshold: usize) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            warned: AtomicBool::new(false),
            threshold: threshold.max(1),
        }
    }

    fn get(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > self.threshold && !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                depth,
                threshold = self.threshold,
                "Share queue backlog, storage is not keeping up."
            );
        }
    }

    fn decrement(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        if depth <= self.threshold / 2 && self.warned.swap(false, Ordering::Relaxed) {
            info!(depth, "Share queue backlog cleared.");
        }
    }

    fn is_warning(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }
}

/// Consumer side of the pipeline.
pub struct ShareConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Share>>,
    depth: Arc<QueueDepth>,
    store: Arc<dyn ShareStore>,
    fallback: Arc<dyn ShareFallback>,
    attempts: u32,
    base_delay: Duration,
    // Share being written when the consumer last died
    in_flight: Mutex<Option<Share>>,
}

/// Create a connected recorder/consumer pair.
pub fn share_recorder(
    config: &PersistenceConfig,
    store: Arc<dyn ShareStore>,
    fallback: Arc<dyn ShareFallback>,
) -> (ShareRecorder, ShareConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(QueueDepth::new(config.queue_warning_threshold));

    let recorder = ShareRecorder {
        tx,
        depth: depth.clone(),
    };
    let consumer = ShareConsumer {
        inner: Arc::new(ConsumerInner {
            rx: tokio::sync::Mutex::new(rx),
            depth,
            store,
            fallback,
            attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
            in_flight: Mutex::new(None),
        }),
    };
    (recorder, consumer)
}

impl ShareConsumer {
    /// Drain the queue until `shutdown`, restarting the worker if it dies.
    ///
    /// On shutdown the shares still queued get one store attempt each and
    /// go to the fallback on failure.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let worker = tokio::spawn(consume(self.inner.clone(), shutdown.clone()));
            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(fatal = true, "Share consumer crashed, restarting.");
                }
                Err(e) => {
                    error!(error = %e, "Share consumer cancelled.");
                    break;
                }
            }
        }
        debug!("Share consumer stopped.");
    }
}

async fn consume(inner: Arc<ConsumerInner>, shutdown: CancellationToken) {
    // Don't retry a share that may have crashed the last worker
    let orphan = inner.in_flight.lock().take();
    if let Some(share) = orphan {
        warn!(miner = %share.miner, "Recovering share from crashed consumer.");
        inner.fall_back(&share).await;
    }

    let mut rx = inner.rx.lock().await;
    loop {
        let share = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            share = rx.recv() => match share {
                Some(share) => share,
                None => return,
            },
        };
        inner.depth.decrement();

        *inner.in_flight.lock() = Some(share.clone());
        inner.persist_with_retry(&share, &shutdown).await;
        *inner.in_flight.lock() = None;
    }

    let mut drained = 0;
    while let Ok(share) = rx.try_recv() {
        inner.depth.decrement();
        if let Err(e) = inner.store.persist(&share).await {
            warn!(error = %e, "Failed to persist share during shutdown.");
            inner.fall_back(&share).await;
        }
        drained += 1;
    }
    if drained > 0 {
        info!(drained, "Flushed share queue.");
    }
}

impl ConsumerInner {
    async fn persist_with_retry(&self, share: &Share, shutdown: &CancellationToken) {
        let mut backoff = ExponentialBackoff::new(
            self.base_delay,
            self.base_delay
                .checked_mul(1 << self.attempts.min(16))
                .unwrap_or(Duration::MAX),
        );

        let mut attempt = 1;
        loop {
            let err = match self.store.persist(share).await {
                Ok(()) => return,
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.attempts {
                error!(
                    fatal = true,
                    miner = %share.miner,
                    height = share.block_height,
                    attempt,
                    error = %err,
                    "Failed to persist share."
                );
                break;
            }

            let delay = backoff.next_delay();
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Failed to persist share, retrying."
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
            attempt += 1;
        }

        self.fall_back(share).await;
    }

    async fn fall_back(&self, share: &Share) {
        if let Err(e) = self.fallback.handle(share).await {
            error!(
                fatal = true,
                miner = %share.miner,
                height = share.block_height,
                error = %e,
                "Share fallback failed, share lost."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StoreError;
    use crate::share::test_support::share;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Records shares, failing according to a script first.
    #[derive(Default)]
    struct ScriptedStore {
        failures: Mutex<VecDeque<Option<StoreError>>>,
        written: Mutex<Vec<String>>,
        calls: AtomicUsize,
        panic_on: Mutex<Option<String>>,
    }

    impl ScriptedStore {
        fn failing(failures: Vec<Option<StoreError>>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures.into()),
                ..Default::default()
            })
        }

        fn written(&self) -> Vec<String> {
            self.written.lock().clone()
        }
    }

    #[async_trait]
    impl ShareStore for ScriptedStore {
        async fn persist(&self, share: &Share) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on.lock().take().as_deref() == Some(share.miner.as_str()) {
                panic!("store blew up");
            }
            if let Some(Some(err)) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.written.lock().push(share.miner.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingFallback {
        shares: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ShareFallback for CollectingFallback {
        async fn handle(&self, share: &Share) -> anyhow::Result<()> {
            self.shares.lock().push(share.miner.clone());
            Ok(())
        }
    }

    /// Never completes.
    #[derive(Default)]
    struct StalledStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShareStore for StalledStore {
        async fn persist(&self, _share: &Share) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn config(attempts: u32, threshold: usize) -> PersistenceConfig {
        PersistenceConfig {
            retry_attempts: attempts,
            retry_base_delay_ms: 1000,
            queue_warning_threshold: threshold,
            ..Default::default()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persists_in_order() {
        let store = ScriptedStore::failing(vec![]);
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        for name in ["a", "b", "c"] {
            assert!(recorder.enqueue(share(name, 1)));
        }
        wait_for(|| store.written().len() == 3).await;

        assert_eq!(store.written(), vec!["a", "b", "c"]);
        assert_eq!(recorder.queue_depth(), 0);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() {
        let store = ScriptedStore::failing(vec![
            Some(StoreError::Transient("down".into())),
            Some(StoreError::Transient("still down".into())),
        ]);
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        recorder.enqueue(share("a", 1));
        wait_for(|| store.written().len() == 1).await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(fallback.shares.lock().is_empty());
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_go_to_fallback() {
        let store = ScriptedStore::failing(vec![
            Some(StoreError::Transient("down".into())),
            Some(StoreError::Transient("down".into())),
            Some(StoreError::Transient("down".into())),
        ]);
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        recorder.enqueue(share("a", 1));
        recorder.enqueue(share("b", 1));
        wait_for(|| store.written().len() == 1).await;

        assert_eq!(*fallback.shares.lock(), vec!["a"]);
        assert_eq!(store.written(), vec!["b"]);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_retry() {
        let store = ScriptedStore::failing(vec![Some(StoreError::Permanent("bad row".into()))]);
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        recorder.enqueue(share("a", 1));
        wait_for(|| fallback.shares.lock().len() == 1).await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_restarts_after_panic() {
        let store = ScriptedStore::failing(vec![]);
        *store.panic_on.lock() = Some("boom".into());
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        recorder.enqueue(share("boom", 1));
        recorder.enqueue(share("after", 1));
        wait_for(|| store.written().len() == 1).await;

        assert_eq!(store.written(), vec!["after"]);
        assert_eq!(*fallback.shares.lock(), vec!["boom"]);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_never_waits_on_store() {
        let store = Arc::new(StalledStore::default());
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        let producers: Vec<_> = (0..50)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move { recorder.enqueue(share(&i.to_string(), 1)) })
            })
            .collect();
        for producer in producers {
            assert!(producer.await.unwrap());
        }

        // The consumer holds one share in the stalled store
        assert!(recorder.queue_depth() >= 49);
        assert!(store.calls.load(Ordering::SeqCst) <= 1);

        shutdown.cancel();
        drop(task);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let store = ScriptedStore::failing(vec![]);
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store.clone(), fallback);
        let shutdown = CancellationToken::new();

        for name in ["a", "b"] {
            recorder.enqueue(share(name, 1));
        }
        shutdown.cancel();
        consumer.run(shutdown).await;

        assert_eq!(store.written(), vec!["a", "b"]);
        assert_eq!(recorder.queue_depth(), 0);
    }

    #[test]
    fn test_backlog_warning_hysteresis() {
        let depth = QueueDepth::new(4);
        for _ in 0..4 {
            depth.increment();
        }
        assert!(!depth.is_warning());

        depth.increment();
        assert!(depth.is_warning());

        // Stays raised until depth falls to half the threshold
        depth.decrement();
        depth.decrement();
        assert!(depth.is_warning());
        depth.decrement();
        assert!(!depth.is_warning());
        assert_eq!(depth.get(), 2);
    }

    #[test]
    fn test_enqueue_after_consumer_gone() {
        let store = ScriptedStore::failing(vec![]);
        let fallback = Arc::new(CollectingFallback::default());
        let (recorder, consumer) = share_recorder(&config(3, 1024), store, fallback);
        drop(consumer);

        assert!(!recorder.enqueue(share("a", 1)));
        assert_eq!(recorder.queue_depth(), 0);
    }
}
