//! Sync scheduling - reconnect-triggered and periodic queue draining.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use keepsync_common::{Error, Result};

use crate::connectivity::{ConnectivityProber, Subscription};
use crate::queue::{ProcessOutcome, RetryQueue};

/// When the scheduler drains the queue on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only on explicit requests.
    Manual,
    /// Whenever the prober reports an offline to online transition.
    OnReconnect,
    /// At regular intervals.
    Periodic { interval: Duration },
    /// Both on reconnect and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn reacts_to_reconnect(&self) -> bool {
        matches!(self, SyncMode::OnReconnect | SyncMode::Hybrid { .. })
    }

    fn period(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }
}

/// Requests accepted by the scheduler loop.
#[derive(Debug)]
enum SchedulerRequest {
    /// Run a processing pass now.
    Process,
    /// Stop the loop.
    Shutdown,
}

type RequestChannel = (SchedulerRequest, oneshot::Sender<Result<ProcessOutcome>>);

/// Front end for requesting passes from a running scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: SyncMode,
    request_tx: mpsc::Sender<RequestChannel>,
}

impl SyncScheduler {
    /// Create a scheduler draining `queue`.
    ///
    /// The reconnect listener is registered on `prober` immediately, so a
    /// transition that happens before [`SyncSchedulerHandle::run`] is polled
    /// is still delivered.
    pub fn new(
        mode: SyncMode,
        queue: RetryQueue,
        prober: &ConnectivityProber,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);

        let subscription = mode.reacts_to_reconnect().then(|| {
            prober.subscribe(move |state| {
                if state.online {
                    // A full channel already holds a pending trigger.
                    let _ = reconnect_tx.try_send(());
                }
                Ok(())
            })
        });

        let scheduler = Self { mode, request_tx };
        let handle = SyncSchedulerHandle {
            mode,
            queue,
            request_rx,
            reconnect_rx,
            _subscription: subscription,
        };

        (scheduler, handle)
    }

    /// Get the sync mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Run a processing pass on the scheduler loop and wait for its outcome.
    pub async fn request_sync(&self) -> Result<ProcessOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SchedulerRequest::Process, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Failed to receive sync result".to_string()))?
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SchedulerRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    queue: RetryQueue,
    request_rx: mpsc::Receiver<RequestChannel>,
    reconnect_rx: mpsc::Receiver<()>,
    _subscription: Option<Subscription>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown or until every
    /// [`SyncScheduler`] has been dropped.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self) {
        let mut periodic = self.mode.period().map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let reconnect_enabled = self.mode.reacts_to_reconnect();

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SchedulerRequest::Process, response_tx)) => {
                            debug!("Processing requested sync pass");
                            let result = self.queue.process().await;
                            let _ = response_tx.send(result);
                        }
                        Some((SchedulerRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        None => {
                            debug!("All scheduler front ends dropped");
                            break;
                        }
                    }
                }

                Some(()) = self.reconnect_rx.recv(), if reconnect_enabled => {
                    info!("Connectivity restored, draining sync queue");
                    Self::log_pass(self.queue.process().await);
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync pass");
                    Self::log_pass(self.queue.process().await);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    fn log_pass(result: Result<ProcessOutcome>) {
        match result {
            Ok(ProcessOutcome::Completed(summary)) => debug!(
                "Scheduled pass finished: {} synced, {} failed, {} pending",
                summary.processed, summary.failed, summary.pending
            ),
            Ok(ProcessOutcome::Skipped(reason)) => debug!("Scheduled pass skipped: {:?}", reason),
            Err(e) => error!("Scheduled sync pass failed: {}", e),
        }
    }

    async fn wait_for_periodic(periodic: &mut Option<Interval>) {
        match periodic {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{SyncAdapter, SyncResponse};
    use crate::connectivity::{Probe, ProberConfig};
    use crate::queue::{QueueConfig, SkipReason};
    use crate::retry::BackoffPolicy;
    use crate::state::{NewOperation, SyncOperation};
    use async_trait::async_trait;
    use keepsync_common::NoopNotifier;
    use keepsync_storage::{KeyValueStore, MemoryStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct SwitchProbe(AtomicBool);

    #[async_trait]
    impl Probe for SwitchProbe {
        async fn probe(&self) -> Result<()> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Network("unreachable".to_string()))
            }
        }
    }

    struct OkAdapter(AtomicUsize);

    #[async_trait]
    impl SyncAdapter for OkAdapter {
        async fn sync(&self, _operation: &SyncOperation) -> Result<SyncResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SyncResponse::ok())
        }
    }

    fn setup(reachable: bool) -> (Arc<SwitchProbe>, Arc<ConnectivityProber>, RetryQueue, Arc<OkAdapter>) {
        let probe = Arc::new(SwitchProbe(AtomicBool::new(reachable)));
        let prober = Arc::new(ConnectivityProber::new(probe.clone(), ProberConfig::default()));
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = QueueConfig::default()
            .with_auto_sync(false)
            .with_backoff(BackoffPolicy::new(Duration::ZERO, Duration::ZERO));
        let queue = RetryQueue::new(store, prober.clone(), Arc::new(NoopNotifier), config).unwrap();
        let adapter = Arc::new(OkAdapter(AtomicUsize::new(0)));
        queue.set_adapter(adapter.clone());
        (probe, prober, queue, adapter)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_request_sync() {
        let (_probe, prober, queue, adapter) = setup(true);
        queue.enqueue(NewOperation::new("create", "task", b"x".to_vec())).unwrap();

        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual, queue.clone(), &prober);
        let task = tokio::spawn(handle.run());

        let outcome = scheduler.request_sync().await.unwrap();
        assert_eq!(outcome.summary().unwrap().processed, 1);
        assert_eq!(adapter.0.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(scheduler.request_sync().await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue() {
        let (probe, prober, queue, adapter) = setup(false);
        prober.check_now().await;
        queue.enqueue(NewOperation::new("update", "task", b"y".to_vec())).unwrap();

        let (scheduler, handle) =
            SyncScheduler::new(SyncMode::OnReconnect, queue.clone(), &prober);
        let task = tokio::spawn(handle.run());

        assert_eq!(
            scheduler.request_sync().await.unwrap(),
            ProcessOutcome::Skipped(SkipReason::Offline)
        );

        probe.0.store(true, Ordering::SeqCst);
        prober.check_now().await;

        wait_until(|| queue.status().synced == 1).await;
        assert_eq!(queue.status().synced, 1);
        assert_eq!(adapter.0.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_mode_drains_queue() {
        let (_probe, prober, queue, _adapter) = setup(true);
        queue.enqueue(NewOperation::new("delete", "task", b"z".to_vec())).unwrap();

        let mode = SyncMode::Periodic {
            interval: Duration::from_millis(10),
        };
        let (scheduler, handle) = SyncScheduler::new(mode, queue.clone(), &prober);
        assert_eq!(prober.listener_count(), 0);
        let task = tokio::spawn(handle.run());

        wait_until(|| queue.status().synced == 1).await;
        assert_eq!(queue.status().synced, 1);

        drop(scheduler);
        task.await.unwrap();
    }
}
