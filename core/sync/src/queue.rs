//! Durable retry queue that drains itself through the sync adapter.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use keepsync_common::{
    notify_best_effort, Error, Notification, Notifier, OperationId, Result, Urgency,
};
use keepsync_storage::KeyValueStore;

use crate::adapter::{SyncAdapter, SyncResponse};
use crate::connectivity::ConnectivityProber;
use crate::retry::BackoffPolicy;
use crate::state::{NewOperation, OperationStatus, QueueStatus, SyncOperation};

/// Store key holding the persisted queue.
pub const QUEUE_KEY: &str = "syncQueue";

/// Configuration for the retry queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of operations kept in the queue.
    pub max_queue_size: usize,
    /// Attempts before an operation is marked failed.
    pub max_retries: u32,
    /// Backoff between attempts of the same operation.
    pub backoff: BackoffPolicy,
    /// Operations processed per persisted batch.
    pub batch_size: usize,
    /// Maximum adapter calls in flight within a batch.
    pub concurrency_limit: usize,
    /// How long synced operations are kept before cleanup.
    pub retention: Duration,
    /// Whether enqueue triggers processing automatically.
    pub auto_sync: bool,
}

impl QueueConfig {
    /// Set the queue capacity.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the concurrency limit.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the retention window for synced operations.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Enable or disable automatic processing.
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_retries: 5,
            backoff: BackoffPolicy::default(),
            batch_size: 10,
            concurrency_limit: 3,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            auto_sync: true,
        }
    }
}

/// Why a `process` call did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass is in flight.
    AlreadyProcessing,
    /// The prober reports the backend unreachable.
    Offline,
    /// No adapter has been configured.
    NoAdapter,
}

/// Counters for one completed processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Operations synced in this pass.
    pub processed: usize,
    /// Attempts that failed in this pass.
    pub failed: usize,
    /// Operations still pending afterwards.
    pub pending: usize,
}

/// Result of a `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(ProcessSummary),
    Skipped(SkipReason),
}

impl ProcessOutcome {
    /// Summary of a completed pass, if one ran.
    pub fn summary(&self) -> Option<&ProcessSummary> {
        match self {
            ProcessOutcome::Completed(summary) => Some(summary),
            ProcessOutcome::Skipped(_) => None,
        }
    }
}

/// Durable queue of mutations awaiting synchronization.
///
/// Cloning the queue yields another handle to the same state. Every
/// read-modify-write of the operation list happens under one lock that is
/// never held across an await point, and every change is written back to
/// the store under [`QUEUE_KEY`] before the lock is released.
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Arc<dyn KeyValueStore>,
    prober: Arc<ConnectivityProber>,
    notifier: Arc<dyn Notifier>,
    adapter: RwLock<Option<Arc<dyn SyncAdapter>>>,
    operations: Mutex<Vec<SyncOperation>>,
    processing: AtomicBool,
    /// Set under the `operations` lock while a [`QueuePause`] is held.
    paused: AtomicBool,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
    retention: chrono::Duration,
    config: QueueConfig,
}

/// Holds the non-reentrancy flag for the duration of a pass.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Exclusive hold on a [`RetryQueue`] while its persisted state is replaced
/// from outside, e.g. by a backup restore.
///
/// While held, no processing pass starts and every mutation of the queue
/// fails with `InvalidInput`, so nothing overwrites [`QUEUE_KEY`]. Dropping
/// the pause releases the queue.
pub struct QueuePause {
    inner: Arc<QueueInner>,
}

impl QueuePause {
    /// Replace the in-memory operations with what the store holds under
    /// [`QUEUE_KEY`]. Returns the number of operations loaded.
    ///
    /// # Errors
    /// - The persisted queue cannot be read or decoded; the in-memory list
    ///   is left untouched
    pub fn reload(&self) -> Result<usize> {
        let mut operations = lock(&self.inner.operations);
        let loaded: Vec<SyncOperation> = self.inner.store.get_or(QUEUE_KEY, Vec::new())?;
        info!(
            "Reloaded sync queue: {} operations (was {})",
            loaded.len(),
            operations.len()
        );
        *operations = loaded;
        Ok(operations.len())
    }
}

impl Drop for QueuePause {
    fn drop(&mut self) {
        {
            let _operations = lock(&self.inner.operations);
            self.inner.paused.store(false, Ordering::Release);
        }
        self.inner.processing.store(false, Ordering::Release);
        debug!("Sync queue resumed");
    }
}

impl RetryQueue {
    /// Create a queue, loading any operations persisted by a previous run.
    ///
    /// # Errors
    /// - `InvalidInput` if `config.retention` is too large to represent
    /// - The persisted queue cannot be read or decoded
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        prober: Arc<ConnectivityProber>,
        notifier: Arc<dyn Notifier>,
        config: QueueConfig,
    ) -> Result<Self> {
        let retention = chrono::Duration::from_std(config.retention)
            .map_err(|e| Error::InvalidInput(format!("Invalid retention window: {}", e)))?;
        let operations: Vec<SyncOperation> = store.get_or(QUEUE_KEY, Vec::new())?;
        if !operations.is_empty() {
            info!("Loaded {} queued operations", operations.len());
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                prober,
                notifier,
                adapter: RwLock::new(None),
                operations: Mutex::new(operations),
                processing: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                last_processed_at: Mutex::new(None),
                retention,
                config,
            }),
        })
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Install the adapter used to push operations.
    pub fn set_adapter(&self, adapter: Arc<dyn SyncAdapter>) {
        match self.inner.adapter.write() {
            Ok(mut slot) => *slot = Some(adapter),
            Err(poisoned) => *poisoned.into_inner() = Some(adapter),
        }
    }

    fn adapter(&self) -> Option<Arc<dyn SyncAdapter>> {
        match self.inner.adapter.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn persist(&self, operations: &[SyncOperation]) -> Result<()> {
        self.inner.store.set_typed(QUEUE_KEY, operations)
    }

    /// Must be called with the `operations` lock held.
    fn ensure_not_paused(&self) -> Result<()> {
        if self.inner.paused.load(Ordering::Acquire) {
            return Err(Error::InvalidInput(
                "Sync queue is paused while its state is replaced".to_string(),
            ));
        }
        Ok(())
    }

    /// Take exclusive hold of the queue.
    ///
    /// # Errors
    /// - `InvalidInput` if a processing pass is in flight or the queue is
    ///   already paused
    pub fn pause(&self) -> Result<QueuePause> {
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidInput(
                "Cannot pause the sync queue while a pass is in flight".to_string(),
            ));
        }
        {
            let _operations = lock(&self.inner.operations);
            self.inner.paused.store(true, Ordering::Release);
        }
        debug!("Sync queue paused");
        Ok(QueuePause {
            inner: self.inner.clone(),
        })
    }

    /// Re-read the persisted queue, replacing the in-memory operations.
    /// Returns the number of operations loaded.
    ///
    /// # Errors
    /// - `InvalidInput` if a processing pass is in flight
    /// - The persisted queue cannot be read or decoded
    pub fn reload(&self) -> Result<usize> {
        self.pause()?.reload()
    }

    /// Whether a [`QueuePause`] is held.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Append an operation to the queue.
    ///
    /// # Postconditions
    /// - The operation is persisted as pending with zero retries
    /// - A processing pass is spawned (not awaited) when auto-sync is
    ///   enabled, the prober reports online and no pass is running
    ///
    /// # Errors
    /// - `Capacity` if the queue already holds `max_queue_size` operations;
    ///   the stored queue is left untouched
    /// - `InvalidInput` while the queue is paused
    /// - Store errors while persisting
    pub fn enqueue(&self, operation: NewOperation) -> Result<OperationId> {
        let id = {
            let mut operations = lock(&self.inner.operations);
            self.ensure_not_paused()?;
            if operations.len() >= self.inner.config.max_queue_size {
                warn!(
                    "Rejecting {} on {}: queue is full",
                    operation.op_type, operation.entity
                );
                return Err(Error::Capacity(format!(
                    "Sync queue is full ({} operations)",
                    self.inner.config.max_queue_size
                )));
            }

            let op = SyncOperation::new(operation, Utc::now());
            let id = op.id.clone();
            debug!("Enqueued {} {} as {}", op.op_type, op.entity, id);
            operations.push(op);

            if let Err(e) = self.persist(&operations) {
                operations.pop();
                return Err(e);
            }
            id
        };

        self.schedule_process();
        Ok(id)
    }

    /// Spawn a processing pass if conditions allow it.
    fn schedule_process(&self) {
        if !self.inner.config.auto_sync
            || !self.inner.prober.is_online()
            || self.is_processing()
        {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move {
                    if let Err(e) = queue.process().await {
                        error!("Automatic sync pass failed: {}", e);
                    }
                });
            }
            Err(_) => debug!("No async runtime available, deferring sync"),
        }
    }

    /// Whether a processing pass is in flight.
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire) && !self.is_paused()
    }

    /// Push due operations through the adapter.
    ///
    /// Returns immediately with a [`ProcessOutcome::Skipped`] when another
    /// pass is running or the queue is paused, the backend is offline, or no adapter is set. A
    /// failing operation never aborts its batch.
    ///
    /// # Errors
    /// - Store errors while persisting progress
    pub async fn process(&self) -> Result<ProcessOutcome> {
        let Some(_guard) = ProcessingGuard::acquire(&self.inner.processing) else {
            debug!("Sync pass already running");
            return Ok(ProcessOutcome::Skipped(SkipReason::AlreadyProcessing));
        };

        if !self.inner.prober.is_online() {
            debug!("Skipping sync pass while offline");
            return Ok(ProcessOutcome::Skipped(SkipReason::Offline));
        }

        let Some(adapter) = self.adapter() else {
            debug!("Skipping sync pass: no adapter configured");
            return Ok(ProcessOutcome::Skipped(SkipReason::NoAdapter));
        };

        let config = &self.inner.config;
        let due = self.select_due(Utc::now())?;
        let mut summary = ProcessSummary::default();

        if !due.is_empty() {
            info!("Processing {} queued operations", due.len());
        }

        for batch in due.chunks(config.batch_size.max(1)) {
            let attempts = self.begin_attempts(batch);

            let results: Vec<(OperationId, Result<SyncResponse>)> = stream::iter(attempts)
                .map(|op| {
                    let adapter = adapter.clone();
                    async move {
                        let result = adapter.sync(&op).await;
                        (op.id, result)
                    }
                })
                .buffer_unordered(config.concurrency_limit.max(1))
                .collect()
                .await;

            self.finish_attempts(results, &mut summary)?;
        }

        summary.pending = self.cleanup(Utc::now())?;
        *lock(&self.inner.last_processed_at) = Some(Utc::now());

        if summary.processed > 0 || summary.failed > 0 {
            info!(
                "Sync pass completed: {} synced, {} failed, {} pending",
                summary.processed, summary.failed, summary.pending
            );
            self.notify_summary(&summary);
        }

        Ok(ProcessOutcome::Completed(summary))
    }

    /// Flip exhausted operations to failed and collect the ids that are due.
    fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<OperationId>> {
        let config = &self.inner.config;
        let mut operations = lock(&self.inner.operations);
        let mut exhausted = 0;
        let mut due = Vec::new();

        for op in operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Pending)
        {
            if op.retries_exhausted(config.max_retries) {
                op.mark_failed();
                exhausted += 1;
            } else if op.is_due(&config.backoff, now) {
                due.push(op.id.clone());
            }
        }

        if exhausted > 0 {
            warn!("{} operations exceeded {} retries", exhausted, config.max_retries);
            self.persist(&operations)?;
        }
        Ok(due)
    }

    /// Record an attempt on each still-pending operation of the batch.
    fn begin_attempts(&self, batch: &[OperationId]) -> Vec<SyncOperation> {
        let now = Utc::now();
        let mut operations = lock(&self.inner.operations);
        batch
            .iter()
            .filter_map(|id| {
                let op = operations
                    .iter_mut()
                    .find(|op| &op.id == id && op.status == OperationStatus::Pending)?;
                op.mark_attempt(now);
                Some(op.clone())
            })
            .collect()
    }

    /// Apply adapter results and persist the batch.
    fn finish_attempts(
        &self,
        results: Vec<(OperationId, Result<SyncResponse>)>,
        summary: &mut ProcessSummary,
    ) -> Result<()> {
        let max_retries = self.inner.config.max_retries;
        let now = Utc::now();
        let mut operations = lock(&self.inner.operations);

        for (id, result) in results {
            let outcome = match result {
                Ok(response) if response.success => Ok(response),
                Ok(response) => Err(response
                    .error
                    .unwrap_or_else(|| "Adapter reported failure".to_string())),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(_) => summary.processed += 1,
                Err(_) => summary.failed += 1,
            }

            // Cleared while the adapter call was in flight.
            let Some(op) = operations.iter_mut().find(|op| op.id == id) else {
                continue;
            };

            match outcome {
                Ok(response) => {
                    debug!(
                        "Synced {} (remote id {:?})",
                        id, response.remote_id
                    );
                    op.mark_synced(now);
                }
                Err(message) => {
                    warn!(
                        "Sync attempt {} for {} failed: {}",
                        op.retries, id, message
                    );
                    op.mark_error(message, max_retries);
                }
            }
        }

        self.persist(&operations)
    }

    /// Drop synced operations past retention. Returns the pending count.
    fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut operations = lock(&self.inner.operations);

        let before = operations.len();
        operations.retain(|op| !op.is_expired(self.inner.retention, now));
        let removed = before - operations.len();
        if removed > 0 {
            debug!("Removed {} synced operations past retention", removed);
            self.persist(&operations)?;
        }

        Ok(operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count())
    }

    fn notify_summary(&self, summary: &ProcessSummary) {
        let (title, urgency) = if summary.failed > 0 {
            ("Sync incomplete", Urgency::Normal)
        } else {
            ("Sync complete", Urgency::Low)
        };
        let body = format!(
            "{} synced, {} failed, {} pending",
            summary.processed, summary.failed, summary.pending
        );
        notify_best_effort(
            self.inner.notifier.as_ref(),
            Notification::new(title, body).with_urgency(urgency),
        );
    }

    /// Current queue status.
    pub fn status(&self) -> QueueStatus {
        let mut status = QueueStatus::count(lock(&self.inner.operations).iter());
        status.is_processing = self.is_processing();
        status.online = self.inner.prober.is_online();
        status.adapter_configured = self.adapter().is_some();
        status.last_processed_at = *lock(&self.inner.last_processed_at);
        status
    }

    /// Copy of every operation in the queue, oldest first.
    pub fn operations(&self) -> Vec<SyncOperation> {
        lock(&self.inner.operations).clone()
    }

    /// Remove every operation. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut operations = lock(&self.inner.operations);
        self.ensure_not_paused()?;
        let removed = std::mem::take(&mut *operations);
        if let Err(e) = self.persist(&operations) {
            *operations = removed;
            return Err(e);
        }
        info!("Cleared {} queued operations", removed.len());
        Ok(removed.len())
    }

    /// Return failed operations to pending with a fresh retry budget.
    pub fn retry_failed(&self) -> Result<usize> {
        let reset = {
            let mut operations = lock(&self.inner.operations);
            self.ensure_not_paused()?;
            let mut reset = 0;
            for op in operations
                .iter_mut()
                .filter(|op| op.status == OperationStatus::Failed)
            {
                op.reset();
                reset += 1;
            }
            if reset > 0 {
                self.persist(&operations)?;
            }
            reset
        };

        if reset > 0 {
            info!("Re-queued {} failed operations", reset);
            self.schedule_process();
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{Probe, ProberConfig};
    use async_trait::async_trait;
    use keepsync_common::NoopNotifier;
    use keepsync_storage::{FileStore, MemoryStore};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct StaticProbe(bool);

    #[async_trait]
    impl Probe for StaticProbe {
        async fn probe(&self) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(Error::Network("unreachable".to_string()))
            }
        }
    }

    /// Adapter that succeeds or fails and counts its calls.
    struct CountingAdapter {
        succeed: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl CountingAdapter {
        fn new(succeed: bool) -> Arc<Self> {
            Self::with_delay(succeed, Duration::ZERO)
        }

        fn with_delay(succeed: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl SyncAdapter for CountingAdapter {
        async fn sync(&self, _operation: &SyncOperation) -> Result<SyncResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.succeed {
                Ok(SyncResponse::ok().with_remote_id("remote-1"))
            } else {
                Err(Error::Network("backend unavailable".to_string()))
            }
        }
    }

    /// Adapter that blocks until released.
    struct GatedAdapter {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SyncAdapter for GatedAdapter {
        async fn sync(&self, _operation: &SyncOperation) -> Result<SyncResponse> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SyncResponse::ok())
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig::default()
            .with_auto_sync(false)
            .with_backoff(BackoffPolicy::new(Duration::ZERO, Duration::ZERO))
    }

    async fn prober(online: bool) -> Arc<ConnectivityProber> {
        let prober = ConnectivityProber::new(Arc::new(StaticProbe(online)), ProberConfig::default());
        prober.check_now().await;
        Arc::new(prober)
    }

    async fn queue_with(store: Arc<dyn KeyValueStore>, config: QueueConfig) -> RetryQueue {
        RetryQueue::new(store, prober(true).await, Arc::new(NoopNotifier), config).unwrap()
    }

    fn note(n: usize) -> NewOperation {
        NewOperation::new("update", "note", format!("{{\"n\":{}}}", n).into_bytes())
    }

    #[tokio::test]
    async fn test_enqueue_below_capacity() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config()).await;

        let id = queue.enqueue(note(1)).unwrap();

        let ops = queue.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, id);
        assert_eq!(ops[0].status, OperationStatus::Pending);
        assert_eq!(ops[0].retries, 0);

        let persisted: Vec<SyncOperation> = store.get_or(QUEUE_KEY, Vec::new()).unwrap();
        assert_eq!(persisted, ops);
    }

    #[tokio::test]
    async fn test_enqueue_beyond_capacity_leaves_store_untouched() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config().with_max_queue_size(2)).await;

        queue.enqueue(note(1)).unwrap();
        queue.enqueue(note(2)).unwrap();
        let before = store.get(QUEUE_KEY).unwrap();

        let result = queue.enqueue(note(3));
        assert!(matches!(result, Err(Error::Capacity(_))));
        assert_eq!(store.get(QUEUE_KEY).unwrap(), before);
        assert_eq!(queue.operations().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");

        let id = {
            let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
            let queue = queue_with(store, test_config()).await;
            queue.enqueue(note(7)).unwrap()
        };

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
        let queue = queue_with(store, test_config()).await;
        let ops = queue.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, id);
        assert_eq!(ops[0].data, b"{\"n\":7}".to_vec());
    }

    #[tokio::test]
    async fn test_process_syncs_pending_operations() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config()).await;
        let adapter = CountingAdapter::new(true);
        queue.set_adapter(adapter.clone());

        for n in 0..4 {
            queue.enqueue(note(n)).unwrap();
        }

        let outcome = queue.process().await.unwrap();
        let summary = outcome.summary().copied().unwrap();
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pending, 0);

        for op in queue.operations() {
            assert_eq!(op.status, OperationStatus::Synced);
            assert_eq!(op.retries, 1);
            assert!(op.synced_at.is_some());
        }

        // Synced operations are terminal.
        queue.process().await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 4);

        let persisted: Vec<SyncOperation> = store.get_or(QUEUE_KEY, Vec::new()).unwrap();
        assert!(persisted.iter().all(|op| op.status == OperationStatus::Synced));
    }

    #[tokio::test]
    async fn test_process_skips_when_offline_or_without_adapter() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config()).await;
        queue.enqueue(note(1)).unwrap();

        assert_eq!(
            queue.process().await.unwrap(),
            ProcessOutcome::Skipped(SkipReason::NoAdapter)
        );

        let offline = RetryQueue::new(
            store,
            prober(false).await,
            Arc::new(NoopNotifier),
            test_config(),
        )
        .unwrap();
        offline.set_adapter(CountingAdapter::new(true));
        assert_eq!(
            offline.process().await.unwrap(),
            ProcessOutcome::Skipped(SkipReason::Offline)
        );
    }

    #[tokio::test]
    async fn test_failed_after_max_retries_and_never_attempted_again() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store, test_config().with_max_retries(3)).await;
        let adapter = CountingAdapter::new(false);
        queue.set_adapter(adapter.clone());
        queue.enqueue(note(1)).unwrap();

        for _ in 0..6 {
            queue.process().await.unwrap();
        }

        let op = &queue.operations()[0];
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retries, 3);
        assert!(op.error.as_deref().unwrap().contains("backend unavailable"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_window_defers_retry() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let backoff = BackoffPolicy::new(Duration::from_secs(3600), Duration::from_secs(7200));
        let queue = queue_with(store, test_config().with_backoff(backoff)).await;
        let adapter = CountingAdapter::new(false);
        queue.set_adapter(adapter.clone());
        queue.enqueue(note(1)).unwrap();

        let first = queue.process().await.unwrap();
        assert_eq!(first.summary().unwrap().failed, 1);

        let second = queue.process().await.unwrap();
        assert_eq!(second.summary().unwrap().failed, 0);
        assert_eq!(second.summary().unwrap().pending, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_never_exceeded() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = test_config().with_batch_size(10).with_concurrency_limit(3);
        let queue = queue_with(store, config).await;
        let adapter = CountingAdapter::with_delay(true, Duration::from_millis(20));
        queue.set_adapter(adapter.clone());

        for n in 0..25 {
            queue.enqueue(note(n)).unwrap();
        }

        let outcome = queue.process().await.unwrap();
        assert_eq!(outcome.summary().unwrap().processed, 25);
        assert!(adapter.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(adapter.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_second_process_call_returns_already_processing() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store, test_config()).await;
        let adapter = Arc::new(GatedAdapter {
            entered: Notify::new(),
            release: Notify::new(),
        });
        queue.set_adapter(adapter.clone());
        queue.enqueue(note(1)).unwrap();

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process().await })
        };
        adapter.entered.notified().await;

        let before = queue.operations();
        let second = queue.process().await.unwrap();
        assert_eq!(second, ProcessOutcome::Skipped(SkipReason::AlreadyProcessing));
        assert_eq!(queue.operations(), before);
        assert!(queue.status().is_processing);

        adapter.release.notify_one();
        let first = running.await.unwrap().unwrap();
        assert_eq!(first.summary().unwrap().processed, 1);
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn test_retention_only_drops_old_synced_entries() {
        let long_ago = Utc::now() - chrono::Duration::days(8);
        let mut old_synced = SyncOperation::new(note(1), long_ago);
        old_synced.mark_attempt(long_ago);
        old_synced.mark_synced(long_ago);
        let mut recent_synced = SyncOperation::new(note(2), Utc::now());
        recent_synced.mark_attempt(Utc::now());
        recent_synced.mark_synced(Utc::now());
        let mut old_failed = SyncOperation::new(note(3), long_ago);
        old_failed.mark_failed();

        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .set_typed(
                QUEUE_KEY,
                &vec![old_synced, recent_synced.clone(), old_failed.clone()],
            )
            .unwrap();

        let queue = queue_with(store, test_config()).await;
        queue.set_adapter(CountingAdapter::new(true));
        queue.process().await.unwrap();

        let ids: Vec<OperationId> = queue.operations().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![recent_synced.id, old_failed.id]);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_budget() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store, test_config().with_max_retries(1)).await;
        queue.set_adapter(CountingAdapter::new(false));
        queue.enqueue(note(1)).unwrap();
        queue.process().await.unwrap();
        assert_eq!(queue.status().failed, 1);

        assert_eq!(queue.retry_failed().unwrap(), 1);
        let op = &queue.operations()[0];
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retries, 0);
    }

    #[tokio::test]
    async fn test_enqueue_triggers_auto_sync() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store, test_config().with_auto_sync(true)).await;
        let adapter = CountingAdapter::new(true);
        queue.set_adapter(adapter.clone());

        queue.enqueue(note(1)).unwrap();

        for _ in 0..100 {
            if queue.status().synced == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.status().synced, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_queue() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config()).await;
        queue.enqueue(note(1)).unwrap();
        queue.enqueue(note(2)).unwrap();

        assert_eq!(queue.clear().unwrap(), 2);
        assert!(queue.operations().is_empty());
        let persisted: Vec<SyncOperation> = store.get_or(QUEUE_KEY, Vec::new()).unwrap();
        assert!(persisted.is_empty());
    }

    #[tokio::test]
    async fn test_reload_replaces_operations_with_persisted_queue() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config()).await;
        let kept = queue.enqueue(note(1)).unwrap();
        let earlier = store.get(QUEUE_KEY).unwrap().unwrap();
        queue.enqueue(note(2)).unwrap();

        store.set(QUEUE_KEY, earlier).unwrap();
        assert_eq!(queue.reload().unwrap(), 1);
        assert_eq!(queue.operations().len(), 1);
        assert_eq!(queue.operations()[0].id, kept);

        queue.enqueue(note(3)).unwrap();
        let persisted: Vec<SyncOperation> = store.get_or(QUEUE_KEY, Vec::new()).unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].id, kept);
    }

    #[tokio::test]
    async fn test_pause_blocks_processing_and_mutation() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), test_config()).await;
        let adapter = CountingAdapter::new(true);
        queue.set_adapter(adapter.clone());
        queue.enqueue(note(1)).unwrap();
        let before = store.get(QUEUE_KEY).unwrap();

        let pause = queue.pause().unwrap();
        assert!(queue.is_paused());
        assert!(!queue.is_processing());
        assert!(queue.pause().is_err());

        assert_eq!(
            queue.process().await.unwrap(),
            ProcessOutcome::Skipped(SkipReason::AlreadyProcessing)
        );
        assert!(matches!(queue.enqueue(note(2)), Err(Error::InvalidInput(_))));
        assert!(matches!(queue.clear(), Err(Error::InvalidInput(_))));
        assert!(matches!(queue.retry_failed(), Err(Error::InvalidInput(_))));
        assert_eq!(store.get(QUEUE_KEY).unwrap(), before);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);

        drop(pause);
        assert!(!queue.is_paused());
        let outcome = queue.process().await.unwrap();
        assert_eq!(outcome.summary().unwrap().processed, 1);
    }

    #[tokio::test]
    async fn test_pause_refused_while_pass_in_flight() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = queue_with(store, test_config()).await;
        let adapter = Arc::new(GatedAdapter {
            entered: Notify::new(),
            release: Notify::new(),
        });
        queue.set_adapter(adapter.clone());
        queue.enqueue(note(1)).unwrap();

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process().await })
        };
        adapter.entered.notified().await;

        assert!(matches!(queue.pause(), Err(Error::InvalidInput(_))));
        assert!(matches!(queue.reload(), Err(Error::InvalidInput(_))));
        assert!(!queue.is_paused());

        adapter.release.notify_one();
        running.await.unwrap().unwrap();
        queue.pause().unwrap();
    }

    #[tokio::test]
    async fn test_unrepresentable_retention_is_rejected_at_creation() {
        let result = RetryQueue::new(
            Arc::new(MemoryStore::new()),
            prober(true).await,
            Arc::new(NoopNotifier),
            test_config().with_retention(Duration::MAX),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
