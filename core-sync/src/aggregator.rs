//! # Progress Aggregator
//!
//! One consistent, observable view of every in-flight and recently finished
//! course sync.
//!
//! ## Overview
//!
//! The aggregator keeps exactly one piece of state besides its observer
//! bookkeeping: the latest [`CourseProgress`] per tracked course. Every update
//! replaces the whole map (copy-on-write) and recomputes an
//! [`AggregatedSyncView`], which is pushed to all subscribers under the same
//! lock, so every subscriber sees the same sequence of views.
//!
//! Views go out two ways. [`subscribe`](ProgressAggregator::subscribe) yields
//! every view but is bounded: a receiver that falls more than
//! `VIEW_BUFFER_SIZE` views behind gets `Lagged` and must resync from
//! [`current_view`](ProgressAggregator::current_view).
//! [`watch`](ProgressAggregator::watch) only ever holds the latest view and
//! never lags, which suits UI observers that render the newest state.
//!
//! ## Lifecycle
//!
//! - [`activate`](ProgressAggregator::activate) re-attaches to every handle in
//!   the job registry, which is how progress survives a restart
//! - [`attach`](ProgressAggregator::attach) spawns one observer task per course
//! - a terminal course stays visible for the grace period (or until
//!   [`acknowledge`](ProgressAggregator::acknowledge)), then its registry entry
//!   and snapshot are removed
//! - cancelled work is removed immediately
//!
//! Cleanup is compare-and-remove on the handle, so it never drops a newer
//! registration for the same course.

use crate::progress::{AggregatedSyncView, CourseProgress};
use crate::registry::JobRegistry;
use crate::Result;
use bridge_traits::{BridgeError, JobHandle, WorkDispatcher, WorkState, WorkUpdate};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

/// Reason shown for a course whose job failed as a whole.
pub const JOB_FAILED_REASON: &str = "Sync could not be completed";

const VIEW_BUFFER_SIZE: usize = 64;

struct AggregatorState {
    snapshots: Arc<BTreeMap<String, CourseProgress>>,
    handles: HashMap<String, JobHandle>,
    observers: HashMap<String, AbortHandle>,
    view: Arc<AggregatedSyncView>,
}

/// Merges live job progress into an [`AggregatedSyncView`].
pub struct ProgressAggregator {
    registry: Arc<dyn JobRegistry>,
    dispatcher: Arc<dyn WorkDispatcher>,
    event_bus: EventBus,
    grace_period: Duration,
    state: Mutex<AggregatorState>,
    views: broadcast::Sender<Arc<AggregatedSyncView>>,
    latest: watch::Sender<Arc<AggregatedSyncView>>,
}

impl ProgressAggregator {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        dispatcher: Arc<dyn WorkDispatcher>,
        event_bus: EventBus,
        grace_period: Duration,
    ) -> Arc<Self> {
        let (views, _) = broadcast::channel(VIEW_BUFFER_SIZE);
        let empty = Arc::new(AggregatedSyncView::empty());
        let (latest, _) = watch::channel(empty.clone());
        Arc::new(Self {
            registry,
            dispatcher,
            event_bus,
            grace_period,
            state: Mutex::new(AggregatorState {
                snapshots: Arc::new(BTreeMap::new()),
                handles: HashMap::new(),
                observers: HashMap::new(),
                view: empty,
            }),
            views,
            latest,
        })
    }

    /// Re-attach to every registered job. Returns how many were attached.
    #[instrument(skip(self))]
    pub async fn activate(self: &Arc<Self>) -> Result<usize> {
        let entries = self.registry.all_active().await?;
        let count = entries.len();
        for entry in entries {
            self.attach(&entry.course_id, entry.handle).await;
        }
        info!(courses = count, "Progress aggregator activated");
        Ok(count)
    }

    /// Start observing `handle` for `course_id`. A different handle for the
    /// same course supersedes the old one.
    pub async fn attach(self: &Arc<Self>, course_id: &str, handle: JobHandle) {
        let mut state = self.state.lock().await;

        if state.handles.get(course_id) == Some(&handle) && state.observers.contains_key(course_id)
        {
            return;
        }
        if let Some(previous) = state.observers.remove(course_id) {
            previous.abort();
        }
        let superseded = match state.handles.insert(course_id.to_string(), handle.clone()) {
            Some(old) => old != handle,
            None => false,
        };
        if superseded && state.snapshots.contains_key(course_id) {
            let mut next = (*state.snapshots).clone();
            next.remove(course_id);
            self.publish_view(&mut state, next);
        }

        debug!(course_id, handle = %handle, "Attaching observer");
        let task = tokio::spawn(Arc::clone(self).observe(course_id.to_string(), handle));
        state.observers.insert(course_id.to_string(), task.abort_handle());
    }

    /// Receive every recomputed view from now on. On `Lagged`, resync with
    /// [`current_view`](Self::current_view).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AggregatedSyncView>> {
        self.views.subscribe()
    }

    /// Latest view only; intermediate views may be skipped but the receiver
    /// always converges on the newest one.
    pub fn watch(&self) -> watch::Receiver<Arc<AggregatedSyncView>> {
        self.latest.subscribe()
    }

    pub async fn current_view(&self) -> Arc<AggregatedSyncView> {
        self.state.lock().await.view.clone()
    }

    pub async fn snapshot(&self, course_id: &str) -> Option<CourseProgress> {
        self.state.lock().await.snapshots.get(course_id).cloned()
    }

    /// The UI has shown a terminal course; clean it up now instead of after
    /// the grace period. Returns `false` if the course is not terminal.
    pub async fn acknowledge(&self, course_id: &str) -> Result<bool> {
        let handle = {
            let state = self.state.lock().await;
            match (state.handles.get(course_id), state.snapshots.get(course_id)) {
                (Some(handle), Some(progress)) if progress.is_terminal() => handle.clone(),
                _ => return Ok(false),
            }
        };
        self.cleanup(course_id, &handle, true).await?;
        Ok(true)
    }

    /// Stop every observer. Registry entries are left for the next activation.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, observer) in state.observers.drain() {
            observer.abort();
        }
        state.handles.clear();
    }

    #[instrument(skip_all, fields(course_id = %course_id, handle = %handle))]
    async fn observe(self: Arc<Self>, course_id: String, handle: JobHandle) {
        let mut updates = match self.dispatcher.observe(&handle).await {
            Ok(updates) => updates,
            Err(BridgeError::UnknownHandle(_)) => {
                warn!("Dispatcher has no record of this job, dropping it");
                if let Err(e) = self.cleanup(&course_id, &handle, false).await {
                    warn!(error = %e, "Failed to remove stale registry entry");
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Could not observe job");
                self.detach(&course_id, &handle).await;
                return;
            }
        };

        let mut finished = false;
        while let Some(update) = updates.next().await {
            if update.state == WorkState::Cancelled {
                info!("Job cancelled, removing course from view");
                if let Err(e) = self.cleanup(&course_id, &handle, false).await {
                    warn!(error = %e, "Failed to remove cancelled job from registry");
                }
                self.emit(SyncEvent::Cancelled {
                    course_id: course_id.clone(),
                });
                return;
            }

            if let Some(progress) = decode_update(&course_id, &update) {
                if !self.apply(&course_id, &handle, progress).await {
                    debug!("Observer superseded by a newer job");
                    return;
                }
            }

            if update.state.is_terminal() {
                finished = true;
                break;
            }
        }

        if !finished {
            debug!("Update stream ended before a terminal state");
            self.detach(&course_id, &handle).await;
            return;
        }

        let state = self
            .snapshot(&course_id)
            .await
            .map(|p| p.state().as_str().to_string())
            .unwrap_or_else(|| "completed".to_string());
        info!(state = %state, "Course sync reached a terminal state");
        self.emit(SyncEvent::Finished {
            course_id: course_id.clone(),
            state,
        });

        tokio::time::sleep(self.grace_period).await;
        if let Err(e) = self.cleanup(&course_id, &handle, false).await {
            warn!(error = %e, "Failed to remove finished job from registry");
        }
    }

    /// Replace the course's snapshot. `false` if `handle` is no longer the
    /// course's current job.
    async fn apply(&self, course_id: &str, handle: &JobHandle, progress: CourseProgress) -> bool {
        let mut state = self.state.lock().await;
        if state.handles.get(course_id) != Some(handle) {
            return false;
        }
        let mut next = (*state.snapshots).clone();
        next.insert(course_id.to_string(), progress);
        self.publish_view(&mut state, next);
        true
    }

    /// Drop a finished or cancelled course from the registry and the view.
    async fn cleanup(&self, course_id: &str, handle: &JobHandle, abort_observer: bool) -> Result<()> {
        let removed = self.registry.remove_handle(course_id, handle).await;
        self.forget(course_id, handle, abort_observer).await;
        if removed? {
            debug!(course_id, "Removed registry entry");
        }
        Ok(())
    }

    /// Stop tracking without touching the registry.
    async fn detach(&self, course_id: &str, handle: &JobHandle) {
        self.forget(course_id, handle, false).await;
    }

    async fn forget(&self, course_id: &str, handle: &JobHandle, abort_observer: bool) {
        let mut state = self.state.lock().await;
        if state.handles.get(course_id) != Some(handle) {
            return;
        }
        state.handles.remove(course_id);
        if let Some(observer) = state.observers.remove(course_id) {
            if abort_observer {
                observer.abort();
            }
        }
        if state.snapshots.contains_key(course_id) {
            let mut next = (*state.snapshots).clone();
            next.remove(course_id);
            self.publish_view(&mut state, next);
        }
    }

    fn publish_view(&self, state: &mut AggregatorState, snapshots: BTreeMap<String, CourseProgress>) {
        state.snapshots = Arc::new(snapshots);
        let view = Arc::new(AggregatedSyncView::from_snapshots(state.snapshots.values()));
        state.view = view.clone();
        self.latest.send_replace(view.clone());
        // No subscribers is fine; the view is still available via current_view.
        let _ = self.views.send(view);
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_bus.emit(CoreEvent::Sync(event));
    }
}

/// Turn a dispatcher update into the snapshot to show, if any.
fn decode_update(course_id: &str, update: &WorkUpdate) -> Option<CourseProgress> {
    let decoded = match &update.payload {
        Some(payload) => match CourseProgress::from_payload(payload) {
            Ok(progress) => Some(progress),
            Err(e) => {
                warn!(course_id, error = %e, "Ignoring undecodable progress payload");
                None
            }
        },
        None => None,
    };

    if update.state != WorkState::Failed {
        return decoded;
    }

    if let Some(failure) = &update.failure {
        warn!(course_id, failure = %failure, "Course sync job failed");
    }
    match decoded {
        Some(mut progress) if !progress.is_terminal() => {
            progress.job_error = Some(JOB_FAILED_REASON.to_string());
            Some(progress)
        }
        Some(progress) => Some(progress),
        None => Some(CourseProgress::job_failed(course_id, JOB_FAILED_REASON)),
    }
}
