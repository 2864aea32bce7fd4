use crate::backoff::BackoffPolicy;
use crate::broadcast::MultiBroadcaster;
use crate::clock::{Clock, SystemClock};
use crate::error::{BuildError, ScheduleError, ShutdownError, StoreError};
use crate::events::{LoggingEvents, ScheduleEvents};
use crate::job::{Definition, DefinitionInput, JobOutcome, JobRegistry};
use crate::manager::DefinitionManager;
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::store::{KeySpace, ScheduleStore};
use crate::sweeper::SweepEngine;
use crate::worker::{ConsumptionLoop, Executor};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Node configuration. Every field has a default, so a partial document
/// deserializes.
///
/// # Example
///
/// ```
/// use clusterkeeper::SchedulerConfig;
///
/// let config: SchedulerConfig = serde_json::from_value(serde_json::json!({
///   "process_interval_ms": 250,
///   "schedules": [
///     { "name": "nightly-report", "runs": "reports.nightly", "interval": "every day at 3am" }
///   ]
/// })).unwrap();
/// assert_eq!(config.process_interval_lock_ms, 5_000);
/// assert_eq!(config.schedules.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Sweep cadence, in milliseconds.
  pub process_interval_ms: u64,
  /// Sweep lock TTL, in milliseconds.
  pub process_interval_lock_ms: u64,
  /// How long claimed and completed occurrence ids stay visible, in seconds.
  pub occurrence_lock_time_secs: u64,
  /// When false, `start()` does nothing.
  pub enabled: bool,
  /// Static defaults, registered create-only on start and after a flush.
  pub schedules: Vec<DefinitionInput>,
  /// Prefix of every store key.
  pub namespace: String,
  /// Hash-tag the namespace for clustered key-value servers.
  pub clustered: bool,
  /// Pub/sub channel carrying multi broadcasts.
  pub multi_channel: String,
  /// Backoff while another node holds the sweep lock. Defaults to steps of
  /// `process_interval_ms`, five steps, 10% jitter.
  pub lock_backoff: Option<BackoffPolicy>,
  /// Backoff after store errors.
  pub error_backoff: BackoffPolicy,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      process_interval_ms: 500,
      process_interval_lock_ms: 5_000,
      occurrence_lock_time_secs: 1_800,
      enabled: true,
      schedules: Vec::new(),
      namespace: "schedule".to_string(),
      clustered: false,
      multi_channel: "exec:multi".to_string(),
      lock_backoff: None,
      error_backoff: BackoffPolicy::default(),
    }
  }
}

impl SchedulerConfig {
  pub fn process_interval(&self) -> Duration {
    Duration::from_millis(self.process_interval_ms)
  }

  pub fn process_interval_lock(&self) -> Duration {
    Duration::from_millis(self.process_interval_lock_ms)
  }

  pub fn occurrence_lock_time(&self) -> Duration {
    Duration::from_secs(self.occurrence_lock_time_secs)
  }

  /// The configured lock backoff, or the one derived from the process interval.
  pub fn lock_backoff_policy(&self) -> BackoffPolicy {
    self.lock_backoff.unwrap_or(BackoffPolicy {
      base_ms: self.process_interval_ms,
      max_steps: 5,
      jitter: Some(0.1),
    })
  }
}

/// Builder for configuring and creating a [`ClusterKeeper`] node.
///
/// Only the store is required. Nodes sharing one store (and namespace) form
/// a cluster.
///
/// # Example
///
/// ```no_run
/// use clusterkeeper::{ClusterKeeper, JobOutcome, MemoryStore};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let node = ClusterKeeper::builder()
///   .store(MemoryStore::new())
///   .process_interval(Duration::from_millis(250))
///   .job("reports.nightly", |schedule| JobOutcome::ok(schedule.data))
///   .build()?;
/// node.start().await;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  config: SchedulerConfig,
  store: Option<Arc<dyn ScheduleStore>>,
  registry: Arc<JobRegistry>,
  events: Arc<dyn ScheduleEvents>,
  clock: Arc<dyn Clock>,
  node_id: Option<String>,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      config: SchedulerConfig::default(),
      store: None,
      registry: Arc::new(JobRegistry::new()),
      events: Arc::new(LoggingEvents),
      clock: Arc::new(SystemClock),
      node_id: None,
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("config", &self.config)
      .field("has_store", &self.store.is_some())
      .field("registry", &self.registry)
      .field("node_id", &self.node_id)
      .finish_non_exhaustive()
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces the whole configuration.
  pub fn config(mut self, config: SchedulerConfig) -> Self {
    self.config = config;
    self
  }

  /// Sets the shared store (required).
  pub fn store<S: ScheduleStore>(mut self, store: S) -> Self {
    self.store = Some(Arc::new(store));
    self
  }

  /// Sets an already shared store.
  pub fn shared_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Uses `registry` for job lookup, e.g. to share it between nodes.
  pub fn registry(mut self, registry: Arc<JobRegistry>) -> Self {
    self.registry = registry;
    self
  }

  /// Registers the callable for `runs` in the current registry.
  pub fn job<F>(self, runs: impl Into<String>, job: F) -> Self
  where
    F: Fn(Definition) -> JobOutcome + Send + Sync + 'static,
  {
    self.registry.register(runs, job);
    self
  }

  /// Replaces the default [`LoggingEvents`] handler.
  pub fn events<E: ScheduleEvents>(mut self, events: E) -> Self {
    self.events = Arc::new(events);
    self
  }

  pub fn clock<C: Clock>(mut self, clock: C) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  /// Overrides the generated (UUID v4) node identifier.
  pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
    self.node_id = Some(node_id.into());
    self
  }

  pub fn process_interval(mut self, interval: Duration) -> Self {
    self.config.process_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
    self
  }

  /// Appends a static default definition.
  pub fn schedule(mut self, input: DefinitionInput) -> Self {
    self.config.schedules.push(input);
    self
  }

  /// Builds the node. Nothing runs until [`ClusterKeeper::start`].
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingStore`] when no store was provided.
  /// - [`BuildError::ZeroProcessInterval`] when the sweep cadence is zero.
  pub fn build(self) -> Result<ClusterKeeper, BuildError> {
    let store = self.store.ok_or(BuildError::MissingStore)?;
    if self.config.process_interval_ms == 0 {
      return Err(BuildError::ZeroProcessInterval);
    }

    let node_id = self.node_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let keys = KeySpace::new(&self.config.namespace, self.config.clustered);
    let manager = DefinitionManager::new(store, keys, self.clock, self.config.occurrence_lock_time());
    debug!(%node_id, namespace = %self.config.namespace, "Scheduler node built.");

    Ok(ClusterKeeper {
      defaults: Arc::new(self.config.schedules.clone()),
      config: self.config,
      node_id,
      manager,
      registry: self.registry,
      events: self.events,
      metrics: SchedulerMetrics::new(),
      running: Mutex::new(None),
    })
  }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
  Stopped,
  Active,
}

struct RunningNode {
  shutdown_tx: watch::Sender<bool>,
  handles: Vec<JoinHandle<()>>,
}

/// One scheduler node.
///
/// Definitions live in the shared store, so any node can create, update or
/// query them; execution of each occurrence happens on exactly one node
/// (every node for `multi` definitions).
///
/// Use [`ClusterKeeper::builder()`] to create and configure an instance.
pub struct ClusterKeeper {
  config: SchedulerConfig,
  defaults: Arc<Vec<DefinitionInput>>,
  node_id: String,
  manager: DefinitionManager,
  registry: Arc<JobRegistry>,
  events: Arc<dyn ScheduleEvents>,
  metrics: SchedulerMetrics,
  running: Mutex<Option<RunningNode>>,
}

impl fmt::Debug for ClusterKeeper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClusterKeeper")
      .field("node_id", &self.node_id)
      .field("state", &self.state())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl ClusterKeeper {
  /// Returns a builder to configure and create a `ClusterKeeper` node.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  pub fn config(&self) -> &SchedulerConfig {
    &self.config
  }

  pub fn state(&self) -> NodeState {
    if self.running.lock().is_some() {
      NodeState::Active
    } else {
      NodeState::Stopped
    }
  }

  /// Registers default definitions and spawns the sweep, consumption and
  /// broadcast tasks. Calling it on an active node does nothing.
  pub async fn start(&self) {
    if !self.config.enabled {
      info!(node_id = %self.node_id, "Scheduler disabled by configuration, not starting.");
      return;
    }
    if self.state() == NodeState::Active {
      debug!(node_id = %self.node_id, "Scheduler already active.");
      return;
    }

    let registered = self.manager.register_defaults(&self.defaults).await;
    debug!(node_id = %self.node_id, registered, "Default schedules registered.");
    match self.manager.store().touch_sentinel(self.manager.keys(), &self.node_id).await {
      Ok(created) => debug!(node_id = %self.node_id, created, "Flush sentinel in place."),
      Err(e) => warn!(
        node_id = %self.node_id,
        error = %e,
        "Failed to set flush sentinel, first sweep will re-register defaults."
      ),
    }

    let mut running = self.running.lock();
    if running.is_some() {
      return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broadcaster = MultiBroadcaster::new(
      self.manager.store().clone(),
      self.config.multi_channel.clone(),
      self.node_id.clone(),
      self.metrics.clone(),
    );
    let executor = Executor::new(
      self.registry.clone(),
      self.events.clone(),
      self.metrics.clone(),
      self.node_id.clone(),
    );
    let sweeper = SweepEngine::new(
      self.manager.clone(),
      self.node_id.clone(),
      self.config.process_interval(),
      self.config.process_interval_lock(),
      self.defaults.clone(),
      self.config.lock_backoff_policy(),
      self.config.error_backoff,
      self.metrics.clone(),
    );
    let consumer = ConsumptionLoop::new(
      self.manager.clone(),
      executor.clone(),
      broadcaster.clone(),
      self.metrics.clone(),
      self.node_id.clone(),
      self.config.error_backoff,
    );

    let handles = vec![
      tokio::spawn(sweeper.run(shutdown_rx.clone())),
      tokio::spawn(consumer.run(shutdown_rx.clone())),
      tokio::spawn(broadcaster.run(executor, shutdown_rx)),
    ];
    *running = Some(RunningNode { shutdown_tx, handles });
    info!(node_id = %self.node_id, "Scheduler node active.");
  }

  /// Signals every node task to stop and waits for them to exit.
  ///
  /// Jobs already executing are left to finish on their own.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyStopped`]: the node was not active.
  /// - [`ShutdownError::TaskPanic`]: a node task panicked.
  pub async fn stop(&self) -> Result<(), ShutdownError> {
    let node = self.running.lock().take().ok_or(ShutdownError::AlreadyStopped)?;
    info!(node_id = %self.node_id, "Stopping scheduler node...");
    node.shutdown_tx.send_replace(true);

    match try_join_all(node.handles).await {
      Ok(_) => {
        info!(node_id = %self.node_id, "Scheduler node stopped.");
        Ok(())
      }
      Err(e) => {
        error!(node_id = %self.node_id, error = ?e, "A node task panicked during shutdown.");
        Err(ShutdownError::TaskPanic)
      }
    }
  }

  /// Validates and stores a definition; see [`DefinitionInput`] for fields.
  ///
  /// # Errors
  ///
  /// Validation failures are returned before anything is written.
  pub async fn create_or_update(
    &self,
    input: DefinitionInput,
    create_only: bool,
  ) -> Result<Definition, ScheduleError> {
    self.manager.create_or_update(input, create_only).await
  }

  /// Removes the named definition. Returns whether it existed.
  pub async fn destroy(&self, name: &str) -> Result<bool, StoreError> {
    self.manager.destroy(name).await
  }

  pub async fn find_one(&self, name: &str) -> Result<Option<Definition>, StoreError> {
    self.manager.find_one(name).await
  }

  /// All stored definitions, ordered by name.
  pub async fn find_all(&self) -> Result<Vec<Definition>, StoreError> {
    self.manager.find_all().await
  }

  /// Registers (or replaces) the callable for `runs` on this node.
  pub fn register_job<F>(&self, runs: impl Into<String>, job: F)
  where
    F: Fn(Definition) -> JobOutcome + Send + Sync + 'static,
  {
    self.registry.register(runs, job);
  }

  pub fn registry(&self) -> &Arc<JobRegistry> {
    &self.registry
  }

  /// Point-in-time copy of this node's counters.
  pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}
