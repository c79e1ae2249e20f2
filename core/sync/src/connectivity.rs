//! Connectivity probing with a debounced online/offline state machine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use keepsync_common::{Error, Result};

/// Default reachability endpoint.
pub const DEFAULT_PROBE_ENDPOINT: &str = "https://www.gstatic.com/generate_204";

/// Current reachability as last observed by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub online: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            online: true,
            last_checked_at: None,
        }
    }
}

/// A single active reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Succeeds when the backend is reachable.
    async fn probe(&self) -> Result<()>;
}

/// Probe issuing a HEAD request against an endpoint.
pub struct HttpProbe {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpProbe {
    /// Create a probe for `endpoint` whose requests abort after `request_timeout`.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("KeepSync/0.1")
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<()> {
        let response = self
            .http
            .head(&self.endpoint)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Probe request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!(
                "Probe endpoint answered {}",
                status
            )));
        }
        Ok(())
    }
}

/// Configuration for the prober.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Reachability endpoint for [`HttpProbe`].
    pub endpoint: String,
    /// Time between background checks.
    pub interval: Duration,
    /// Hard limit for a single probe.
    pub timeout: Duration,
}

impl ProberConfig {
    /// Set the probe endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_PROBE_ENDPOINT.to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

type Listener = Arc<dyn Fn(&ConnectivityState) -> Result<()> + Send + Sync>;
type ListenerMap = Mutex<BTreeMap<u64, Listener>>;

/// Turns individual probe results into a stable online/offline state.
///
/// The state starts optimistic (`online = true`). Listeners are notified
/// only when a probe result differs from the stored state; repeated
/// identical results are silent.
pub struct ConnectivityProber {
    probe: Arc<dyn Probe>,
    config: ProberConfig,
    state: RwLock<ConnectivityState>,
    listeners: Arc<ListenerMap>,
    next_listener_id: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityProber {
    /// Create a prober using `probe` for each check.
    pub fn new(probe: Arc<dyn Probe>, config: ProberConfig) -> Self {
        Self {
            probe,
            config,
            state: RwLock::new(ConnectivityState::default()),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener_id: AtomicU64::new(0),
            monitor: Mutex::new(None),
        }
    }

    /// Create a prober issuing HEAD requests against the configured endpoint.
    pub fn http(config: ProberConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.endpoint.clone(), config.timeout)?;
        Ok(Self::new(Arc::new(probe), config))
    }

    /// Get the prober configuration.
    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Shorthand for `state().online`.
    pub fn is_online(&self) -> bool {
        self.state().online
    }

    /// Probe now and update the state. Returns whether the backend is reachable.
    pub async fn check_now(&self) -> bool {
        let online = match timeout(self.config.timeout, self.probe.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Connectivity probe timed out after {:?}", self.config.timeout);
                false
            }
        };
        self.record(online);
        online
    }

    /// Store a probe result, notifying listeners on a transition.
    fn record(&self, online: bool) {
        let changed = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.last_checked_at = Some(Utc::now());
            let changed = state.online != online;
            state.online = online;
            changed.then_some(*state)
        };

        if let Some(state) = changed {
            info!(
                "Connectivity changed: {}",
                if state.online { "online" } else { "offline" }
            );
            self.broadcast(&state);
        }
    }

    fn broadcast(&self, state: &ConnectivityState) {
        let listeners: Vec<(u64, Listener)> = match self.listeners.lock() {
            Ok(map) => map.iter().map(|(id, l)| (*id, l.clone())).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(id, l)| (*id, l.clone()))
                .collect(),
        };

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(state))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Connectivity listener {} failed: {}", id, e),
                Err(_) => error!("Connectivity listener {} panicked", id),
            }
        }
    }

    /// Register a listener for state transitions.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityState) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        match self.listeners.lock() {
            Ok(mut map) => map.insert(id, Arc::new(listener)),
            Err(poisoned) => poisoned.into_inner().insert(id, Arc::new(listener)),
        };
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        match self.listeners.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Start the background polling loop.
    ///
    /// The first check runs immediately. Calling `start` while the loop is
    /// already running has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut monitor = match self.monitor.lock() {
            Ok(monitor) => monitor,
            Err(poisoned) => poisoned.into_inner(),
        };
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let prober = Arc::downgrade(self);
        let period = self.config.interval;
        info!("Connectivity monitor started (every {:?})", period);

        *monitor = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(prober) = prober.upgrade() else {
                    break;
                };
                prober.check_now().await;
            }
        }));
    }

    /// Stop the background polling loop.
    pub fn stop(&self) {
        let handle = match self.monitor.lock() {
            Ok(mut monitor) => monitor.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("Connectivity monitor stopped");
        }
    }
}

impl Drop for ConnectivityProber {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Registration handle returned by [`ConnectivityProber::subscribe`].
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl Subscription {
    /// Remove the listener.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            match listeners.lock() {
                Ok(mut map) => map.remove(&self.id),
                Err(poisoned) => poisoned.into_inner().remove(&self.id),
            };
        }
    }
}
