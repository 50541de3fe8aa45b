//! # Sync Scheduler
//!
//! Decides when course sync jobs are enqueued.
//!
//! ## Overview
//!
//! Two triggers feed the work dispatcher:
//!
//! - **Manual**: [`SyncScheduler::sync_now`] enqueues one job per course of an
//!   explicit selection and remembers the selection for periodic runs.
//! - **Periodic**: [`SyncScheduler::run_periodic`] re-enqueues the remembered
//!   selection when auto-sync is on, the configured frequency has elapsed and
//!   the Wi-Fi-only policy is satisfied *right now*. The policy check happens
//!   before anything is enqueued.
//!
//! A course that already has a live job is skipped, so there is at most one
//! active job per course.
//!
//! ## Enqueue Protocol
//!
//! ```text
//! enqueue (job waits on start gate)
//!   → registry.register ──ok──→ release gate → aggregator.attach → Enqueued
//!                       └─err─→ abort gate → dispatcher.cancel → EnqueueAborted
//! ```
//!
//! A job whose handle could not be persisted never does any work.

use crate::aggregator::ProgressAggregator;
use crate::job::{start_gate, CourseSyncJob};
use crate::progress::{CourseSelection, SyncSelection};
use crate::registry::JobRegistry;
use crate::store::ContentStore;
use crate::{Result, SyncError};
use bridge_traits::{
    BridgeError, Clock, ContentFetcher, JobHandle, NetworkMonitor, NetworkRequirement, RetryPolicy,
    SettingsStore, WorkConstraints, WorkDispatcher,
};
use core_runtime::events::{CoreEvent, EventBus, ScheduleEvent, SyncEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const KEY_AUTO_SYNC_ENABLED: &str = "offline_sync.auto_sync_enabled";
pub const KEY_SYNC_FREQUENCY: &str = "offline_sync.frequency";
pub const KEY_WIFI_ONLY: &str = "offline_sync.wifi_only";
pub const KEY_SELECTION: &str = "offline_sync.selection";
pub const KEY_LAST_PERIODIC_RUN: &str = "offline_sync.last_periodic_run";

// ============================================================================
// Settings
// ============================================================================

/// How often a periodic sync may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFrequency {
    Daily,
    Weekly,
}

impl SyncFrequency {
    pub fn interval(&self) -> Duration {
        match self {
            SyncFrequency::Daily => Duration::from_secs(24 * 60 * 60),
            SyncFrequency::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFrequency::Daily => "daily",
            SyncFrequency::Weekly => "weekly",
        }
    }
}

impl FromStr for SyncFrequency {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(SyncFrequency::Daily),
            "weekly" => Ok(SyncFrequency::Weekly),
            other => Err(SyncError::Settings(format!("Unknown sync frequency: {}", other))),
        }
    }
}

impl fmt::Display for SyncFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User-configurable sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub auto_sync_enabled: bool,
    pub frequency: SyncFrequency,
    pub wifi_only: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync_enabled: false,
            frequency: SyncFrequency::Daily,
            wifi_only: true,
        }
    }
}

impl SyncSettings {
    pub fn network_requirement(&self) -> NetworkRequirement {
        NetworkRequirement::for_wifi_only(self.wifi_only)
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedCourse {
    pub course_id: String,
    pub handle: JobHandle,
}

/// Outcome of one trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub enqueued: Vec<EnqueuedCourse>,
    /// Courses left alone because they already have a live job.
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn handle_for(&self, course_id: &str) -> Option<&JobHandle> {
        self.enqueued
            .iter()
            .find(|e| e.course_id == course_id)
            .map(|e| &e.handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodicOutcome {
    Ran(SyncReport),
    Skipped(String),
}

// ============================================================================
// Scheduler
// ============================================================================

/// Everything the scheduler needs to build and hand out jobs.
pub struct SchedulerDeps {
    pub dispatcher: Arc<dyn WorkDispatcher>,
    pub registry: Arc<dyn JobRegistry>,
    pub aggregator: Arc<ProgressAggregator>,
    pub settings: Arc<dyn SettingsStore>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub store: Arc<ContentStore>,
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Arc<dyn Clock>,
    pub event_bus: EventBus,
    pub item_concurrency: usize,
    pub retry_policy: RetryPolicy,
}

pub struct SyncScheduler {
    deps: SchedulerDeps,
    enqueue_lock: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        Self {
            deps,
            enqueue_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Manual trigger. Remembers `selection` for periodic runs.
    #[instrument(skip_all, fields(courses = selection.courses.len()))]
    pub async fn sync_now(&self, selection: &SyncSelection) -> Result<SyncReport> {
        selection.validate()?;
        let encoded = serde_json::to_string(selection)?;
        self.deps.settings.set_string(KEY_SELECTION, &encoded).await?;

        let settings = self.settings().await?;
        self.enqueue_selection(selection, &settings).await
    }

    /// Periodic trigger. Does nothing unless auto-sync is on, the frequency
    /// has elapsed and the network satisfies the Wi-Fi-only policy.
    #[instrument(skip(self))]
    pub async fn run_periodic(&self) -> Result<PeriodicOutcome> {
        let settings = self.settings().await?;

        if !settings.auto_sync_enabled {
            return Ok(self.skip_periodic("Auto-sync is disabled"));
        }

        let now = self.deps.clock.unix_timestamp_millis();
        if let Some(last) = self.deps.settings.get_i64(KEY_LAST_PERIODIC_RUN).await? {
            let interval = settings.frequency.interval().as_millis() as i64;
            if now.saturating_sub(last) < interval {
                return Ok(self.skip_periodic("Sync frequency has not elapsed"));
            }
        }

        if settings.wifi_only {
            let Some(monitor) = &self.deps.network_monitor else {
                return Ok(self.skip_periodic("Wi-Fi only is set and the network cannot be checked"));
            };
            let info = monitor.get_network_info().await?;
            if !NetworkRequirement::Unmetered.is_satisfied_by(&info) {
                return Ok(self.skip_periodic("Wi-Fi only is set and the current network is metered"));
            }
        }

        let Some(selection) = self.stored_selection().await? else {
            return Ok(self.skip_periodic("No courses selected for offline use"));
        };
        if selection.is_empty() {
            return Ok(self.skip_periodic("No courses selected for offline use"));
        }

        let report = self.enqueue_selection(&selection, &settings).await?;
        self.deps.settings.set_i64(KEY_LAST_PERIODIC_RUN, now).await?;

        let courses: Vec<String> = report.enqueued.iter().map(|e| e.course_id.clone()).collect();
        info!(enqueued = courses.len(), skipped = report.skipped.len(), "Periodic sync ran");
        self.emit(CoreEvent::Schedule(ScheduleEvent::PeriodicRun { courses }));
        Ok(PeriodicOutcome::Ran(report))
    }

    /// Evaluate the periodic trigger every `poll_interval` until `shutdown`
    /// fires. Settings are re-read on every tick.
    pub fn start_periodic(
        self: &Arc<Self>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Periodic scheduler stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.run_periodic().await {
                            warn!(error = %e, "Periodic sync evaluation failed");
                        }
                    }
                }
            }
        })
    }

    /// Cancel the live job of a course. Returns whether a job was found.
    #[instrument(skip(self))]
    pub async fn cancel(&self, course_id: &str) -> Result<bool> {
        let Some(handle) = self.deps.registry.get(course_id).await? else {
            return Ok(false);
        };
        match self.deps.dispatcher.cancel(&handle).await {
            Ok(()) => {
                info!(handle = %handle, "Cancellation requested");
                Ok(true)
            }
            Err(BridgeError::UnknownHandle(_)) => {
                // Left over from a previous run; nothing to cancel.
                self.deps.registry.remove_handle(course_id, &handle).await?;
                debug!(handle = %handle, "Dropped stale registry entry");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn settings(&self) -> Result<SyncSettings> {
        let defaults = SyncSettings::default();
        let store = &self.deps.settings;

        let frequency = match store.get_string(KEY_SYNC_FREQUENCY).await? {
            Some(raw) => raw.parse()?,
            None => defaults.frequency,
        };

        Ok(SyncSettings {
            auto_sync_enabled: store
                .get_bool(KEY_AUTO_SYNC_ENABLED)
                .await?
                .unwrap_or(defaults.auto_sync_enabled),
            frequency,
            wifi_only: store.get_bool(KEY_WIFI_ONLY).await?.unwrap_or(defaults.wifi_only),
        })
    }

    pub async fn set_auto_sync(&self, enabled: bool) -> Result<()> {
        self.deps.settings.set_bool(KEY_AUTO_SYNC_ENABLED, enabled).await?;
        self.policy_changed().await
    }

    pub async fn set_frequency(&self, frequency: SyncFrequency) -> Result<()> {
        self.deps
            .settings
            .set_string(KEY_SYNC_FREQUENCY, frequency.as_str())
            .await?;
        self.policy_changed().await
    }

    /// Turning Wi-Fi-only off always applies. Turning it on requires the user
    /// to have confirmed.
    pub async fn set_wifi_only(&self, enabled: bool, confirmed: bool) -> Result<()> {
        let current = self.settings().await?;
        if enabled && !current.wifi_only && !confirmed {
            return Err(SyncError::ConfirmationRequired(
                "Enabling Wi-Fi only sync must be confirmed by the user".to_string(),
            ));
        }
        self.deps.settings.set_bool(KEY_WIFI_ONLY, enabled).await?;
        self.policy_changed().await
    }

    /// The selection the periodic trigger will use.
    pub async fn stored_selection(&self) -> Result<Option<SyncSelection>> {
        match self.deps.settings.get_string(KEY_SELECTION).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn enqueue_selection(
        &self,
        selection: &SyncSelection,
        settings: &SyncSettings,
    ) -> Result<SyncReport> {
        let _guard = self.enqueue_lock.lock().await;

        let constraints = WorkConstraints::default()
            .with_network(settings.network_requirement())
            .with_retry(self.deps.retry_policy.clone());

        let mut report = SyncReport::default();
        for course in &selection.courses {
            if self.is_active(&course.course_id).await? {
                debug!(course_id = %course.course_id, "Course already has a live job");
                report.skipped.push(course.course_id.clone());
                self.emit(CoreEvent::Sync(SyncEvent::Skipped {
                    course_id: course.course_id.clone(),
                    reason: "already active".to_string(),
                }));
                continue;
            }

            let handle = self.enqueue_course(course, constraints.clone()).await?;
            report.enqueued.push(EnqueuedCourse {
                course_id: course.course_id.clone(),
                handle,
            });
        }
        Ok(report)
    }

    /// A course is active if its registered handle is still live in the
    /// dispatcher. Handles the dispatcher forgot are dropped.
    async fn is_active(&self, course_id: &str) -> Result<bool> {
        let Some(handle) = self.deps.registry.get(course_id).await? else {
            return Ok(false);
        };
        match self.deps.dispatcher.state(&handle).await? {
            Some(state) => Ok(!state.is_terminal()),
            None => {
                debug!(course_id, handle = %handle, "Dropping stale registry entry");
                self.deps.registry.remove_handle(course_id, &handle).await?;
                Ok(false)
            }
        }
    }

    #[instrument(skip_all, fields(course_id = %course.course_id))]
    async fn enqueue_course(
        &self,
        course: &CourseSelection,
        constraints: WorkConstraints,
    ) -> Result<JobHandle> {
        let (gate, waiter) = start_gate();
        let job = CourseSyncJob::new(
            course.course_id.clone(),
            course.tab_ids.clone(),
            self.deps.fetcher.clone(),
            self.deps.store.clone(),
        )
        .with_item_concurrency(self.deps.item_concurrency)
        .with_start_gate(waiter);

        let handle = self.deps.dispatcher.enqueue(Arc::new(job), constraints).await?;

        if let Err(e) = self.deps.registry.register(&course.course_id, &handle).await {
            error!(handle = %handle, error = %e, "Could not register job, withdrawing it");
            gate.abort();
            if let Err(cancel_err) = self.deps.dispatcher.cancel(&handle).await {
                warn!(error = %cancel_err, "Failed to cancel unregistered job");
            }
            self.emit(CoreEvent::Sync(SyncEvent::EnqueueAborted {
                course_id: course.course_id.clone(),
                message: e.to_string(),
            }));
            return Err(e);
        }

        gate.release();
        self.deps
            .aggregator
            .attach(&course.course_id, handle.clone())
            .await;

        info!(handle = %handle, tabs = course.tab_ids.len(), "Course sync enqueued");
        self.emit(CoreEvent::Sync(SyncEvent::Enqueued {
            course_id: course.course_id.clone(),
            handle: handle.to_string(),
        }));
        Ok(handle)
    }

    fn skip_periodic(&self, reason: &str) -> PeriodicOutcome {
        info!(reason, "Periodic sync skipped");
        self.emit(CoreEvent::Schedule(ScheduleEvent::PeriodicSkipped {
            reason: reason.to_string(),
        }));
        PeriodicOutcome::Skipped(reason.to_string())
    }

    async fn policy_changed(&self) -> Result<()> {
        let settings = self.settings().await?;
        info!(
            auto_sync = settings.auto_sync_enabled,
            wifi_only = settings.wifi_only,
            frequency = %settings.frequency,
            "Sync policy changed"
        );
        self.emit(CoreEvent::Schedule(ScheduleEvent::PolicyChanged {
            auto_sync_enabled: settings.auto_sync_enabled,
            wifi_only: settings.wifi_only,
            frequency: settings.frequency.to_string(),
        }));
        Ok(())
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.deps.event_bus.emit(event);
    }
}
