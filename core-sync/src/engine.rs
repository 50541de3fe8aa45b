//! # Sync Engine
//!
//! Host-facing facade that wires the registry, content store, aggregator and
//! scheduler together from a [`CoreConfig`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncEngine, SyncSelection};
//!
//! let engine = SyncEngine::new(config).await?;
//! engine.start().await?;               // re-attach to jobs from a previous run
//!
//! let mut views = engine.subscribe_views();
//! engine
//!     .sync_now(&SyncSelection::new().with_course("42", ["pages", "files"]))
//!     .await?;
//!
//! while let Ok(view) = views.recv().await {
//!     println!("{}% ({:?})", view.progress_percent, view.state);
//! }
//! ```

use crate::aggregator::ProgressAggregator;
use crate::progress::{AggregatedSyncView, SyncSelection};
use crate::registry::{JobRegistry, SqliteJobRegistry};
use crate::scheduler::{PeriodicOutcome, SchedulerDeps, SyncFrequency, SyncReport, SyncScheduler, SyncSettings};
use crate::store::ContentStore;
use crate::Result;
use bridge_traits::{BridgeError, JobHandle};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest wait for a cancelled job to stop writing before its content is
/// deleted anyway.
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

struct PeriodicTask {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SyncEngine {
    config: CoreConfig,
    event_bus: EventBus,
    registry: Arc<dyn JobRegistry>,
    store: Arc<ContentStore>,
    aggregator: Arc<ProgressAggregator>,
    scheduler: Arc<SyncScheduler>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl SyncEngine {
    /// Build the engine with a SQLite registry at `config.database_path`.
    pub async fn new(config: CoreConfig) -> Result<Self> {
        let registry =
            SqliteJobRegistry::connect(&config.database_path, config.clock.clone()).await?;
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    /// Build the engine on an existing registry.
    pub fn with_registry(config: CoreConfig, registry: Arc<dyn JobRegistry>) -> Self {
        let event_bus = EventBus::new(config.event_buffer_size);

        let mut store = ContentStore::new(config.file_system.clone(), config.data_dir.clone());
        if let Some(budget) = config.content_budget_bytes {
            store = store.with_budget(budget);
        }
        let store = Arc::new(store);

        let aggregator = ProgressAggregator::new(
            registry.clone(),
            config.work_dispatcher.clone(),
            event_bus.clone(),
            config.cleanup_grace_period,
        );

        let scheduler = Arc::new(SyncScheduler::new(SchedulerDeps {
            dispatcher: config.work_dispatcher.clone(),
            registry: registry.clone(),
            aggregator: aggregator.clone(),
            settings: config.settings_store.clone(),
            fetcher: config.content_fetcher.clone(),
            store: store.clone(),
            network_monitor: config.network_monitor.clone(),
            clock: config.clock.clone(),
            event_bus: event_bus.clone(),
            item_concurrency: config.item_concurrency,
            retry_policy: config.retry_policy.clone(),
        }));

        Self {
            config,
            event_bus,
            registry,
            store,
            aggregator,
            scheduler,
            periodic: Mutex::new(None),
        }
    }

    /// Re-attach to every job registered by a previous run. Returns how many
    /// courses are being observed.
    pub async fn start(&self) -> Result<usize> {
        let attached = self.aggregator.activate().await?;
        info!(attached, "Sync engine started");
        Ok(attached)
    }

    pub async fn sync_now(&self, selection: &SyncSelection) -> Result<SyncReport> {
        self.scheduler.sync_now(selection).await
    }

    pub async fn run_periodic(&self) -> Result<PeriodicOutcome> {
        self.scheduler.run_periodic().await
    }

    /// Evaluate the periodic trigger every `poll_interval`. Replaces a loop
    /// started earlier.
    pub async fn start_periodic(&self, poll_interval: Duration) {
        let mut periodic = self.periodic.lock().await;
        if let Some(previous) = periodic.take() {
            previous.shutdown.cancel();
        }
        let shutdown = CancellationToken::new();
        let task = self.scheduler.start_periodic(poll_interval, shutdown.clone());
        *periodic = Some(PeriodicTask { shutdown, task });
    }

    pub async fn stop_periodic(&self) {
        if let Some(periodic) = self.periodic.lock().await.take() {
            periodic.shutdown.cancel();
            let _ = periodic.task.await;
        }
    }

    pub async fn cancel(&self, course_id: &str) -> Result<bool> {
        self.scheduler.cancel(course_id).await
    }

    pub async fn acknowledge(&self, course_id: &str) -> Result<bool> {
        self.aggregator.acknowledge(course_id).await
    }

    /// Cancel any live job for the course and delete its offline content.
    /// Deletion waits until the job has stopped, so no in-flight write can
    /// recreate the course directory afterwards.
    pub async fn remove_offline_content(&self, course_id: &str) -> Result<()> {
        let handle = self.registry.get(course_id).await?;
        if self.scheduler.cancel(course_id).await? {
            if let Some(handle) = handle {
                self.wait_until_stopped(&handle).await;
            }
        }
        self.store.remove_course(course_id).await?;
        info!(course_id, "Removed offline content");
        Ok(())
    }

    async fn wait_until_stopped(&self, handle: &JobHandle) {
        let mut updates = match self.config.work_dispatcher.observe(handle).await {
            Ok(updates) => updates,
            Err(BridgeError::UnknownHandle(_)) => return,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Could not observe cancelled job");
                return;
            }
        };

        let stopped = tokio::time::timeout(CANCEL_SETTLE_TIMEOUT, async {
            while let Some(update) = updates.next().await {
                if update.state.is_terminal() {
                    return;
                }
            }
        })
        .await;

        match stopped {
            Ok(()) => debug!(handle = %handle, "Cancelled job stopped"),
            Err(_) => warn!(handle = %handle, "Cancelled job still running, removing content anyway"),
        }
    }

    /// Every view in order. A receiver that lags must resync through
    /// [`current_view`](Self::current_view).
    pub fn subscribe_views(&self) -> broadcast::Receiver<Arc<AggregatedSyncView>> {
        self.aggregator.subscribe()
    }

    /// The newest view, for observers that only render the latest state.
    pub fn watch_views(&self) -> watch::Receiver<Arc<AggregatedSyncView>> {
        self.aggregator.watch()
    }

    pub async fn current_view(&self) -> Arc<AggregatedSyncView> {
        self.aggregator.current_view().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn settings(&self) -> Result<SyncSettings> {
        self.scheduler.settings().await
    }

    pub async fn set_auto_sync(&self, enabled: bool) -> Result<()> {
        self.scheduler.set_auto_sync(enabled).await
    }

    pub async fn set_frequency(&self, frequency: SyncFrequency) -> Result<()> {
        self.scheduler.set_frequency(frequency).await
    }

    pub async fn set_wifi_only(&self, enabled: bool, confirmed: bool) -> Result<()> {
        self.scheduler.set_wifi_only(enabled, confirmed).await
    }

    pub async fn stored_selection(&self) -> Result<Option<SyncSelection>> {
        self.scheduler.stored_selection().await
    }

    /// Stop the periodic loop and every observer. Jobs keep running in the
    /// dispatcher and are picked up again by the next [`start`](Self::start).
    pub async fn shutdown(&self) {
        self.stop_periodic().await;
        self.aggregator.shutdown().await;
        info!("Sync engine shut down");
    }
}
