//! In-process Work Dispatcher
//!
//! Runs [`WorkUnit`]s on the Tokio runtime. A semaphore bounds how many units
//! run at once; queued units wait for their network and battery constraints
//! before taking a slot. The latest update per handle is kept in a `watch`
//! channel, so observers that attach late still see the current payload.
//!
//! Records are kept for the lifetime of the dispatcher. Work does not survive
//! the process; a handle from a previous run is unknown here.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    network::NetworkMonitor,
    power::PowerMonitor,
    work::{
        JobHandle, ProgressReporter, WorkConstraints, WorkContext, WorkDispatcher, WorkState,
        WorkUnit, WorkUpdate, WorkUpdateStream,
    },
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often queued work re-checks its constraints.
pub const DEFAULT_CONSTRAINT_POLL_INTERVAL: Duration = Duration::from_secs(5);

struct JobRecord {
    updates: watch::Sender<WorkUpdate>,
    cancellation: CancellationToken,
}

struct DispatcherShared {
    permits: Arc<Semaphore>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    power_monitor: Option<Arc<dyn PowerMonitor>>,
    constraint_poll_interval: Duration,
}

/// Tokio-based work dispatcher for desktop hosts.
pub struct TokioWorkDispatcher {
    jobs: Arc<RwLock<HashMap<JobHandle, JobRecord>>>,
    shared: Arc<DispatcherShared>,
}

impl TokioWorkDispatcher {
    /// Create a dispatcher that runs at most `max_concurrent` units at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            shared: Arc::new(DispatcherShared {
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                network_monitor: None,
                power_monitor: None,
                constraint_poll_interval: DEFAULT_CONSTRAINT_POLL_INTERVAL,
            }),
        }
    }

    pub fn with_network_monitor(self, monitor: Option<Arc<dyn NetworkMonitor>>) -> Self {
        self.map_shared(|shared| shared.network_monitor = monitor)
    }

    pub fn with_power_monitor(self, monitor: Option<Arc<dyn PowerMonitor>>) -> Self {
        self.map_shared(|shared| shared.power_monitor = monitor)
    }

    pub fn with_constraint_poll_interval(self, interval: Duration) -> Self {
        self.map_shared(|shared| shared.constraint_poll_interval = interval)
    }

    fn map_shared(self, update: impl FnOnce(&mut DispatcherShared)) -> Self {
        let mut shared = DispatcherShared {
            permits: self.shared.permits.clone(),
            network_monitor: self.shared.network_monitor.clone(),
            power_monitor: self.shared.power_monitor.clone(),
            constraint_poll_interval: self.shared.constraint_poll_interval,
        };
        update(&mut shared);
        Self {
            jobs: self.jobs,
            shared: Arc::new(shared),
        }
    }

    async fn constraints_satisfied(shared: &DispatcherShared, constraints: &WorkConstraints) -> bool {
        match &shared.network_monitor {
            Some(monitor) => match monitor.get_network_info().await {
                Ok(info) => {
                    if !constraints.network.is_satisfied_by(&info) {
                        return false;
                    }
                }
                Err(err) => {
                    warn!("Network monitor error: {}", err);
                    return false;
                }
            },
            None => {
                debug!("No network monitor provided; assuming network constraint satisfied");
            }
        }

        if constraints.requires_battery_not_low {
            if let Some(monitor) = &shared.power_monitor {
                match monitor.is_battery_low().await {
                    Ok(true) => return false,
                    Ok(false) => {}
                    Err(err) => warn!("Power monitor error: {}", err),
                }
            }
        }

        true
    }

    /// Wait for the constraints and a free slot. `None` means cancelled.
    async fn wait_for_slot(
        shared: &DispatcherShared,
        constraints: &WorkConstraints,
        cancellation: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        loop {
            if Self::constraints_satisfied(shared, constraints).await {
                break;
            }
            tokio::select! {
                _ = cancellation.cancelled() => return None,
                _ = tokio::time::sleep(shared.constraint_poll_interval) => {}
            }
        }

        tokio::select! {
            _ = cancellation.cancelled() => None,
            permit = shared.permits.clone().acquire_owned() => permit.ok(),
        }
    }

    async fn run_job(
        shared: Arc<DispatcherShared>,
        unit: Arc<dyn WorkUnit>,
        constraints: WorkConstraints,
        handle: JobHandle,
        updates: watch::Sender<WorkUpdate>,
        cancellation: CancellationToken,
    ) {
        let label = unit.describe();
        let max_attempts = constraints.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let Some(permit) = Self::wait_for_slot(&shared, &constraints, &cancellation).await
            else {
                set_state(&updates, WorkState::Cancelled, None);
                info!(handle = %handle, work = %label, "Work cancelled before it started");
                return;
            };

            set_state(&updates, WorkState::Running, None);
            debug!(handle = %handle, work = %label, attempt, "Work attempt started");

            let ctx = WorkContext {
                handle: handle.clone(),
                reporter: Arc::new(WatchReporter {
                    updates: updates.clone(),
                }),
                cancellation: cancellation.clone(),
                attempt,
            };
            let result = unit.run(ctx).await;
            drop(permit);

            if cancellation.is_cancelled() {
                set_state(&updates, WorkState::Cancelled, None);
                info!(handle = %handle, work = %label, "Work cancelled");
                return;
            }

            match result {
                Ok(()) => {
                    set_state(&updates, WorkState::Succeeded, None);
                    info!(handle = %handle, work = %label, attempt, "Work succeeded");
                    return;
                }
                Err(err) if attempt < max_attempts => {
                    attempt += 1;
                    let delay = constraints.retry.delay_for(attempt);
                    warn!(
                        handle = %handle,
                        work = %label,
                        error = %err,
                        next_attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Work attempt failed; retrying"
                    );
                    set_state(&updates, WorkState::Enqueued, Some(err.to_string()));

                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            set_state(&updates, WorkState::Cancelled, None);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(handle = %handle, work = %label, error = %err, attempt, "Work failed");
                    set_state(&updates, WorkState::Failed, Some(err.to_string()));
                    return;
                }
            }
        }
    }
}

fn set_state(updates: &watch::Sender<WorkUpdate>, state: WorkState, failure: Option<String>) {
    updates.send_modify(|update| {
        update.state = state;
        if failure.is_some() || state == WorkState::Running {
            update.failure = failure;
        }
    });
}

struct WatchReporter {
    updates: watch::Sender<WorkUpdate>,
}

impl ProgressReporter for WatchReporter {
    fn publish(&self, payload: serde_json::Value) -> Result<()> {
        self.updates.send_modify(|update| update.payload = Some(payload));
        Ok(())
    }
}

struct WatchUpdateStream {
    updates: watch::Receiver<WorkUpdate>,
    started: bool,
    finished: bool,
}

impl WatchUpdateStream {
    fn take_current(&mut self) -> WorkUpdate {
        let update = self.updates.borrow_and_update().clone();
        self.finished = update.state.is_terminal();
        update
    }
}

#[async_trait]
impl WorkUpdateStream for WatchUpdateStream {
    async fn next(&mut self) -> Option<WorkUpdate> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.take_current());
        }
        match self.updates.changed().await {
            Ok(()) => Some(self.take_current()),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl WorkDispatcher for TokioWorkDispatcher {
    async fn enqueue(
        &self,
        unit: Arc<dyn WorkUnit>,
        constraints: WorkConstraints,
    ) -> Result<JobHandle> {
        let handle = JobHandle::new();
        let (updates, _) = watch::channel(WorkUpdate::enqueued(handle.clone()));
        let cancellation = CancellationToken::new();

        self.jobs.write().await.insert(
            handle.clone(),
            JobRecord {
                updates: updates.clone(),
                cancellation: cancellation.clone(),
            },
        );

        debug!(handle = %handle, work = %unit.describe(), "Work enqueued");
        tokio::spawn(Self::run_job(
            self.shared.clone(),
            unit,
            constraints,
            handle.clone(),
            updates,
            cancellation,
        ));

        Ok(handle)
    }

    async fn observe(&self, handle: &JobHandle) -> Result<Box<dyn WorkUpdateStream>> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(handle)
            .ok_or_else(|| BridgeError::UnknownHandle(handle.to_string()))?;

        Ok(Box::new(WatchUpdateStream {
            updates: record.updates.subscribe(),
            started: false,
            finished: false,
        }))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(handle)
            .ok_or_else(|| BridgeError::UnknownHandle(handle.to_string()))?;

        if !record.updates.borrow().state.is_terminal() {
            record.cancellation.cancel();
            debug!(handle = %handle, "Cancellation requested");
        }
        Ok(())
    }

    async fn state(&self, handle: &JobHandle) -> Result<Option<WorkState>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(handle).map(|record| record.updates.borrow().state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::network::{NetworkInfo, NetworkRequirement, NetworkType};
    use bridge_traits::work::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    struct Counting {
        runs: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl WorkUnit for Counting {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        async fn run(&self, ctx: WorkContext) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.reporter.publish(json!({ "run": run }))?;
            if run <= self.fail_first {
                return Err(BridgeError::OperationFailed(format!("attempt {} failed", run)));
            }
            Ok(())
        }
    }

    struct Blocking {
        started: Notify,
    }

    #[async_trait]
    impl WorkUnit for Blocking {
        fn describe(&self) -> String {
            "blocking".to_string()
        }

        async fn run(&self, ctx: WorkContext) -> Result<()> {
            ctx.reporter.publish(json!({ "step": 1 }))?;
            self.started.notify_one();
            ctx.cancellation.cancelled().await;
            Ok(())
        }
    }

    struct FixedNetwork(NetworkInfo);

    #[async_trait]
    impl NetworkMonitor for FixedNetwork {
        async fn get_network_info(&self) -> Result<NetworkInfo> {
            Ok(self.0.clone())
        }
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            use_exponential_backoff: false,
        }
    }

    async fn drain(dispatcher: &TokioWorkDispatcher, handle: &JobHandle) -> Vec<WorkUpdate> {
        let mut stream = dispatcher.observe(handle).await.unwrap();
        let mut seen = Vec::new();
        while let Some(update) = stream.next().await {
            seen.push(update);
        }
        seen
    }

    #[tokio::test]
    async fn test_successful_work_retains_payload() {
        let dispatcher = TokioWorkDispatcher::new(2);
        let unit = Arc::new(Counting {
            runs: AtomicU32::new(0),
            fail_first: 0,
        });

        let handle = dispatcher
            .enqueue(unit, WorkConstraints::default())
            .await
            .unwrap();
        let updates = drain(&dispatcher, &handle).await;

        let last = updates.last().unwrap();
        assert_eq!(last.state, WorkState::Succeeded);
        assert_eq!(last.payload, Some(json!({ "run": 1 })));

        // A late observer gets the terminal update immediately.
        let late = drain(&dispatcher, &handle).await;
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].state, WorkState::Succeeded);
        assert_eq!(late[0].payload, Some(json!({ "run": 1 })));
    }

    #[tokio::test]
    async fn test_failed_attempts_are_retried() {
        let dispatcher = TokioWorkDispatcher::new(1);
        let unit = Arc::new(Counting {
            runs: AtomicU32::new(0),
            fail_first: 1,
        });

        let handle = dispatcher
            .enqueue(
                unit.clone(),
                WorkConstraints::default().with_retry(quick_retry(3)),
            )
            .await
            .unwrap();
        let updates = drain(&dispatcher, &handle).await;

        assert_eq!(updates.last().unwrap().state, WorkState::Succeeded);
        assert_eq!(unit.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let dispatcher = TokioWorkDispatcher::new(1);
        let unit = Arc::new(Counting {
            runs: AtomicU32::new(0),
            fail_first: u32::MAX,
        });

        let handle = dispatcher
            .enqueue(
                unit.clone(),
                WorkConstraints::default().with_retry(quick_retry(2)),
            )
            .await
            .unwrap();
        let updates = drain(&dispatcher, &handle).await;

        let last = updates.last().unwrap();
        assert_eq!(last.state, WorkState::Failed);
        assert!(last.failure.as_deref().unwrap().contains("attempt 2 failed"));
        assert_eq!(unit.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_running_work() {
        let dispatcher = TokioWorkDispatcher::new(1);
        let unit = Arc::new(Blocking {
            started: Notify::new(),
        });

        let handle = dispatcher
            .enqueue(unit.clone(), WorkConstraints::default())
            .await
            .unwrap();
        unit.started.notified().await;
        assert_eq!(
            dispatcher.state(&handle).await.unwrap(),
            Some(WorkState::Running)
        );

        dispatcher.cancel(&handle).await.unwrap();
        let updates = drain(&dispatcher, &handle).await;

        let last = updates.last().unwrap();
        assert_eq!(last.state, WorkState::Cancelled);
        assert_eq!(last.payload, Some(json!({ "step": 1 })));

        // Cancelling finished work is a no-op.
        dispatcher.cancel(&handle).await.unwrap();
        assert_eq!(
            dispatcher.state(&handle).await.unwrap(),
            Some(WorkState::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_unmet_network_constraint_holds_work() {
        let dispatcher = TokioWorkDispatcher::new(1)
            .with_network_monitor(Some(Arc::new(FixedNetwork(NetworkInfo::connected(
                NetworkType::Cellular,
            )))))
            .with_constraint_poll_interval(Duration::from_millis(5));
        let unit = Arc::new(Counting {
            runs: AtomicU32::new(0),
            fail_first: 0,
        });

        let handle = dispatcher
            .enqueue(
                unit.clone(),
                WorkConstraints::default().with_network(NetworkRequirement::Unmetered),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            dispatcher.state(&handle).await.unwrap(),
            Some(WorkState::Enqueued)
        );
        assert_eq!(unit.runs.load(Ordering::SeqCst), 0);

        dispatcher.cancel(&handle).await.unwrap();
        let updates = drain(&dispatcher, &handle).await;
        assert_eq!(updates.last().unwrap().state, WorkState::Cancelled);
        assert_eq!(unit.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let dispatcher = TokioWorkDispatcher::new(1);
        let handle = JobHandle::new();

        assert_eq!(dispatcher.state(&handle).await.unwrap(), None);
        assert!(matches!(
            dispatcher.observe(&handle).await,
            Err(BridgeError::UnknownHandle(_))
        ));
        assert!(matches!(
            dispatcher.cancel(&handle).await,
            Err(BridgeError::UnknownHandle(_))
        ));
    }
}
