//! # Course Sync Job
//!
//! The unit of background work that downloads one course's selected tabs.
//!
//! ## Overview
//!
//! A [`CourseSyncJob`] runs inside the work dispatcher. It owns a private
//! [`CourseProgress`], mutates it as content arrives and publishes a clone
//! after every meaningful step. Tabs are processed sequentially in selection
//! order; items inside a tab are fetched in bounded waves.
//!
//! ## Workflow
//!
//! 1. Wait for the start gate (the registry must know the handle first)
//! 2. Resolve the course name and tab labels
//! 3. Prepare local storage
//! 4. Publish every selected tab as `Starting`
//! 5. Per tab: list items, drop stale local copies, fetch and store each
//!    item, publish after every item, finish as `Completed` or `Failed`
//! 6. Prune local tabs that are no longer selected
//!
//! ## Failure Isolation
//!
//! A failing item is recorded against its tab and the tab keeps going. A tab
//! that fails does not stop the course. Only a failure to start at all (course
//! unknown, storage unavailable) makes `run` return an error, and in that
//! case nothing was published.
//!
//! ## Cancellation
//!
//! Checked before each tab, before each wave of items and after each item.
//! Once observed, the job stops publishing and returns; the tab in flight
//! keeps its last published state.

use crate::progress::{failure_reason, CourseProgress, ItemProgress, ProgressState, TabProgress};
use crate::store::ContentStore;
use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{BridgeError, ContentFetcher, ContentItem, CourseSummary, WorkContext, WorkUnit};
use core_runtime::logging::redact_url;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Reason recorded for a selected tab the course does not expose.
pub const TAB_UNAVAILABLE: &str = "Tab is not available";

// ============================================================================
// Start Gate
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Released,
    Aborted,
}

/// Held by whoever enqueues the job; decides whether it may start.
#[derive(Debug)]
pub struct StartGate {
    tx: watch::Sender<GateState>,
}

/// Held by the job; resolves once the gate is released or aborted.
#[derive(Debug, Clone)]
pub struct StartGateWaiter {
    rx: watch::Receiver<GateState>,
}

/// Create a closed gate and its waiter.
pub fn start_gate() -> (StartGate, StartGateWaiter) {
    let (tx, rx) = watch::channel(GateState::Pending);
    (StartGate { tx }, StartGateWaiter { rx })
}

impl StartGate {
    pub fn release(&self) {
        self.tx.send_replace(GateState::Released);
    }

    pub fn abort(&self) {
        self.tx.send_replace(GateState::Aborted);
    }
}

impl StartGateWaiter {
    /// `true` if the job may start. A gate dropped while still pending counts
    /// as aborted.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                GateState::Released => return true,
                GateState::Aborted => return false,
                GateState::Pending => {
                    if rx.changed().await.is_err() {
                        return *rx.borrow() == GateState::Released;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Job
// ============================================================================

enum TabOutcome {
    Finished,
    Cancelled,
}

/// Downloads one course's selected tabs.
pub struct CourseSyncJob {
    course_id: String,
    tab_ids: Vec<String>,
    fetcher: Arc<dyn ContentFetcher>,
    store: Arc<ContentStore>,
    item_concurrency: usize,
    gate: Option<StartGateWaiter>,
}

impl CourseSyncJob {
    pub fn new(
        course_id: impl Into<String>,
        tab_ids: Vec<String>,
        fetcher: Arc<dyn ContentFetcher>,
        store: Arc<ContentStore>,
    ) -> Self {
        Self {
            course_id: course_id.into(),
            tab_ids,
            fetcher,
            store,
            item_concurrency: core_runtime::config::DEFAULT_ITEM_CONCURRENCY,
            gate: None,
        }
    }

    pub fn with_item_concurrency(mut self, n: usize) -> Self {
        self.item_concurrency = n.max(1);
        self
    }

    /// Hold the job until `waiter` is released.
    pub fn with_start_gate(mut self, waiter: StartGateWaiter) -> Self {
        self.gate = Some(waiter);
        self
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    fn publish(&self, ctx: &WorkContext, progress: &CourseProgress) -> Result<()> {
        if ctx.cancellation.is_cancelled() {
            return Ok(());
        }
        ctx.reporter.publish(progress.to_payload()?)?;
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(course_id = %self.course_id, attempt = ctx.attempt))]
    async fn execute(&self, ctx: WorkContext) -> Result<()> {
        if let Some(gate) = &self.gate {
            let released = tokio::select! {
                _ = ctx.cancellation.cancelled() => false,
                released = gate.wait() => released,
            };
            if !released {
                info!("Start gate not released, exiting without syncing");
                return Ok(());
            }
        }
        if ctx.cancellation.is_cancelled() {
            return Ok(());
        }

        let summary = self.fetcher.course(&self.course_id).await.map_err(|e| {
            warn!(error = %e, "Could not resolve course");
            SyncError::Bridge(BridgeError::OperationFailed(format!(
                "Course {} could not be resolved: {}",
                self.course_id, e
            )))
        })?;
        self.store.prepare_course(&self.course_id).await?;

        let mut progress = self.initial_progress(&summary);
        info!(tabs = progress.tabs.len(), "Starting course sync");
        self.publish(&ctx, &progress)?;

        for tab_id in &self.tab_ids {
            if ctx.cancellation.is_cancelled() {
                info!("Course sync cancelled between tabs");
                return Ok(());
            }

            if summary.tab(tab_id).is_none() {
                warn!(tab_id = %tab_id, "Selected tab is not exposed by the course");
                progress.set_tab_state(tab_id, ProgressState::failed(TAB_UNAVAILABLE))?;
                self.publish(&ctx, &progress)?;
                continue;
            }

            match self.sync_tab(&ctx, &mut progress, tab_id).await? {
                TabOutcome::Finished => {}
                TabOutcome::Cancelled => {
                    info!(tab_id = %tab_id, "Course sync cancelled mid-tab");
                    return Ok(());
                }
            }
        }

        if let Err(e) = self.store.prune_tabs(&self.course_id, &self.tab_ids).await {
            warn!(error = %e, "Failed to prune deselected tabs");
        }

        info!(state = %progress.state(), "Course sync finished");
        Ok(())
    }

    fn initial_progress(&self, summary: &CourseSummary) -> CourseProgress {
        let mut progress = CourseProgress::new(&self.course_id, &summary.name);
        progress.tabs = self
            .tab_ids
            .iter()
            .map(|tab_id| {
                let label = summary
                    .tab(tab_id)
                    .map(|t| t.label.clone())
                    .unwrap_or_else(|| tab_id.clone());
                TabProgress::starting(tab_id, label)
            })
            .collect();
        progress
    }

    #[instrument(skip_all, fields(tab_id = %tab_id))]
    async fn sync_tab(
        &self,
        ctx: &WorkContext,
        progress: &mut CourseProgress,
        tab_id: &str,
    ) -> Result<TabOutcome> {
        let items = match self.fetcher.list_items(&self.course_id, tab_id).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Could not list tab content");
                progress.set_tab_state(
                    tab_id,
                    ProgressState::failed(format!("Could not list content: {}", e)),
                )?;
                self.publish(ctx, progress)?;
                return Ok(TabOutcome::Finished);
            }
        };

        if let Err(e) = self.store.remove_stale_items(&self.course_id, tab_id, &items).await {
            warn!(error = %e, "Failed to remove stale offline items");
        }

        if let Some(tab) = progress.tab_mut(tab_id) {
            tab.items = items
                .iter()
                .map(|item| ItemProgress {
                    item_id: item.id.clone(),
                    name: item.name.clone(),
                    size: item.size,
                    state: ProgressState::Starting,
                })
                .collect();
        }

        if items.is_empty() {
            progress.set_tab_state(tab_id, ProgressState::Completed)?;
            self.publish(ctx, progress)?;
            return Ok(TabOutcome::Finished);
        }

        progress.set_tab_state(tab_id, ProgressState::in_progress(0))?;
        self.publish(ctx, progress)?;

        let total = items.len();
        let mut processed = 0usize;
        let mut failed = 0usize;

        for wave in items.chunks(self.item_concurrency) {
            if ctx.cancellation.is_cancelled() {
                return Ok(TabOutcome::Cancelled);
            }

            let mut in_flight: FuturesUnordered<_> = wave
                .iter()
                .map(|item| async move { (item, self.fetch_item(tab_id, item).await) })
                .collect();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancellation.cancelled() => return Ok(TabOutcome::Cancelled),
                    next = in_flight.next() => next,
                };
                let Some((item, outcome)) = next else {
                    break;
                };
                if ctx.cancellation.is_cancelled() {
                    return Ok(TabOutcome::Cancelled);
                }

                processed += 1;
                match outcome {
                    Ok(written) => {
                        debug!(item = %item.name, bytes = written, "Item stored");
                        self.record_item(progress, tab_id, &item.id, ProgressState::Completed, Some(written));
                    }
                    Err(reason) => {
                        failed += 1;
                        warn!(item = %item.name, url = %redact_url(&item.url), error = %reason, "Item failed");
                        self.record_item(progress, tab_id, &item.id, ProgressState::failed(reason), None);
                    }
                }

                let percent = (processed * 100 / total) as u8;
                progress.set_tab_state(tab_id, ProgressState::in_progress(percent))?;
                self.publish(ctx, progress)?;
            }
        }

        let final_state = if failed == 0 {
            ProgressState::Completed
        } else {
            ProgressState::failed(failure_reason(failed))
        };
        info!(items = total, failed, "Tab finished");
        progress.set_tab_state(tab_id, final_state)?;
        self.publish(ctx, progress)?;
        Ok(TabOutcome::Finished)
    }

    fn record_item(
        &self,
        progress: &mut CourseProgress,
        tab_id: &str,
        item_id: &str,
        state: ProgressState,
        written: Option<u64>,
    ) {
        let Some(item) = progress
            .tab_mut(tab_id)
            .and_then(|tab| tab.items.iter_mut().find(|i| i.item_id == item_id))
        else {
            return;
        };
        item.state = state;
        if item.size.is_none() {
            item.size = written;
        }
    }

    async fn fetch_item(&self, tab_id: &str, item: &ContentItem) -> std::result::Result<u64, String> {
        let data = self.fetcher.fetch(item).await.map_err(|e| e.to_string())?;
        self.store
            .write_item(&self.course_id, tab_id, item, data)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl WorkUnit for CourseSyncJob {
    fn describe(&self) -> String {
        format!("course-sync:{}", self.course_id)
    }

    async fn run(&self, ctx: WorkContext) -> BridgeResult<()> {
        self.execute(ctx).await.map_err(BridgeError::from)
    }
}
