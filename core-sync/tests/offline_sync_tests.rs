//! End-to-end offline sync tests on the desktop bridge implementations.

use async_trait::async_trait;
use bridge_desktop::{ManualNetworkMonitor, SqliteSettingsStore, TokioFileSystem, TokioWorkDispatcher};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::time::ManualClock;
use bridge_traits::{
    ContentFetcher, ContentItem, CourseSummary, NetworkInfo, NetworkMonitor, NetworkType,
    SettingsStore, TabInfo, WorkDispatcher, WorkState,
};
use bytes::Bytes;
use chrono::TimeZone;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, ScheduleEvent, SyncEvent};
use core_sync::scheduler::KEY_SELECTION;
use core_sync::{
    AggregateState, AggregatedSyncView, ContentStore, CourseState, InMemoryJobRegistry,
    JobRegistry, PeriodicOutcome, ProgressState, RegistryEntry, SyncEngine, SyncError,
    SyncSelection, JOB_FAILED_REASON,
};
use mockall::mock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, Semaphore};

// ============================================================================
// Fixtures
// ============================================================================

/// Course API double. Items are listed as `name` (id derived from the tab) or
/// `id:name`. Items named `broken*` fail; fetches in `held_tab` wait for the
/// test to release them.
struct ScriptedFetcher {
    courses: BTreeMap<String, (String, Vec<(String, Vec<String>)>)>,
    held_tab: Option<String>,
    release: Semaphore,
    course_lookups: AtomicUsize,
}

impl ScriptedFetcher {
    fn new() -> Self {
        Self {
            courses: BTreeMap::new(),
            held_tab: None,
            release: Semaphore::new(0),
            course_lookups: AtomicUsize::new(0),
        }
    }

    fn with_course(mut self, id: &str, name: &str, tabs: &[(&str, &[&str])]) -> Self {
        let tabs = tabs
            .iter()
            .map(|(tab, items)| {
                (
                    tab.to_string(),
                    items.iter().map(|i| i.to_string()).collect(),
                )
            })
            .collect();
        self.courses.insert(id.to_string(), (name.to_string(), tabs));
        self
    }

    fn holding(mut self, tab_id: &str) -> Self {
        self.held_tab = Some(tab_id.to_string());
        self
    }

    fn release_all(&self) {
        self.release.add_permits(1_000);
    }
}

#[async_trait]
impl ContentFetcher for ScriptedFetcher {
    async fn course(&self, course_id: &str) -> BridgeResult<CourseSummary> {
        self.course_lookups.fetch_add(1, Ordering::SeqCst);
        let (name, tabs) = self
            .courses
            .get(course_id)
            .ok_or_else(|| BridgeError::OperationFailed(format!("HTTP 404 for course {}", course_id)))?;

        Ok(CourseSummary {
            id: course_id.to_string(),
            name: name.clone(),
            tabs: tabs
                .iter()
                .map(|(id, _)| TabInfo {
                    id: id.clone(),
                    label: id.to_uppercase(),
                })
                .collect(),
        })
    }

    async fn list_items(&self, course_id: &str, tab_id: &str) -> BridgeResult<Vec<ContentItem>> {
        let (_, tabs) = &self.courses[course_id];
        let items = tabs
            .iter()
            .find(|(id, _)| id == tab_id)
            .map(|(_, items)| items.clone())
            .unwrap_or_default();

        Ok(items
            .iter()
            .map(|spec| listed_item(course_id, tab_id, spec))
            .collect())
    }

    async fn fetch(&self, item: &ContentItem) -> BridgeResult<Bytes> {
        if let Some(held) = &self.held_tab {
            if item.id.starts_with(&format!("{}/", held)) {
                let permit = self
                    .release
                    .acquire()
                    .await
                    .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
                permit.forget();
            }
        }
        if item.name.starts_with("broken") {
            return Err(BridgeError::OperationFailed("HTTP 500".to_string()));
        }
        Ok(Bytes::from(format!("content of item {}", item.id)))
    }
}

fn listed_item(course_id: &str, tab_id: &str, spec: &str) -> ContentItem {
    let (id, name) = match spec.split_once(':') {
        Some((id, name)) => (id.to_string(), name.to_string()),
        None => (format!("{}/{}", tab_id, spec), spec.to_string()),
    };
    ContentItem {
        url: format!("https://lms.example.com/{}/{}/{}", course_id, tab_id, id),
        id,
        name,
        size: None,
    }
}

mock! {
    pub Network {}

    #[async_trait]
    impl NetworkMonitor for Network {
        async fn get_network_info(&self) -> BridgeResult<NetworkInfo>;
    }
}

mock! {
    pub Registry {}

    #[async_trait]
    impl JobRegistry for Registry {
        async fn register(&self, course_id: &str, handle: &bridge_traits::JobHandle) -> core_sync::Result<()>;
        async fn all_active(&self) -> core_sync::Result<Vec<RegistryEntry>>;
        async fn get(&self, course_id: &str) -> core_sync::Result<Option<bridge_traits::JobHandle>>;
        async fn remove(&self, course_id: &str) -> core_sync::Result<()>;
        async fn remove_handle(&self, course_id: &str, handle: &bridge_traits::JobHandle) -> core_sync::Result<bool>;
    }
}

struct Harness {
    dir: TempDir,
    fetcher: Arc<ScriptedFetcher>,
    dispatcher: Arc<TokioWorkDispatcher>,
    settings: Arc<SqliteSettingsStore>,
    network: Arc<dyn NetworkMonitor>,
    clock: Arc<ManualClock>,
    grace: Duration,
}

impl Harness {
    async fn new(fetcher: ScriptedFetcher) -> Self {
        Self::with_network(
            fetcher,
            Arc::new(ManualNetworkMonitor::new(NetworkInfo::connected(NetworkType::WiFi))),
        )
        .await
    }

    async fn with_network(fetcher: ScriptedFetcher, network: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            fetcher: Arc::new(fetcher),
            dispatcher: Arc::new(TokioWorkDispatcher::new(2)),
            settings: Arc::new(SqliteSettingsStore::in_memory().await.unwrap()),
            network,
            clock: Arc::new(ManualClock::new(
                chrono::Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap(),
            )),
            grace: Duration::from_millis(50),
        }
    }

    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn content_root(&self) -> PathBuf {
        self.dir.path().join("content")
    }

    fn config(&self) -> CoreConfig {
        CoreConfig::builder()
            .data_dir(self.content_root())
            .database_path(self.dir.path().join("sync.db"))
            .content_fetcher(self.fetcher.clone())
            .work_dispatcher(self.dispatcher.clone())
            .settings_store(self.settings.clone())
            .file_system(Arc::new(TokioFileSystem::with_data_dir(self.content_root())))
            .network_monitor(self.network.clone())
            .clock(self.clock.clone())
            .cleanup_grace_period(self.grace)
            .item_concurrency(2)
            .build()
            .unwrap()
    }

    fn engine(&self, registry: Arc<dyn JobRegistry>) -> SyncEngine {
        SyncEngine::with_registry(self.config(), registry)
    }

    fn store(&self) -> ContentStore {
        let fs = Arc::new(TokioFileSystem::with_data_dir(self.content_root()));
        ContentStore::new(fs, self.content_root())
    }

    /// Where the item listed as `spec` is stored.
    fn item_path(&self, course_id: &str, tab_id: &str, spec: &str) -> PathBuf {
        self.store()
            .item_path(course_id, tab_id, &listed_item(course_id, tab_id, spec))
    }
}

async fn wait_for_view<F>(
    views: &mut broadcast::Receiver<Arc<AggregatedSyncView>>,
    mut done: F,
) -> Arc<AggregatedSyncView>
where
    F: FnMut(&AggregatedSyncView) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match views.recv().await {
                Ok(view) if done(&view) => return view,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("view channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for view")
}

fn course_terminal(course_id: &'static str) -> impl FnMut(&AggregatedSyncView) -> bool {
    move |view| view.course(course_id).map(|c| c.state.is_terminal()).unwrap_or(false)
}

fn biology() -> ScriptedFetcher {
    ScriptedFetcher::new().with_course(
        "42",
        "Biology",
        &[
            ("pages", &["intro.html", "cells.html"]),
            ("files", &["syllabus.pdf", "broken.pdf"]),
        ],
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_partial_failure_is_reported_per_tab() {
    let h = Harness::new(biology()).await;
    let registry = Arc::new(InMemoryJobRegistry::new());
    let engine = h.engine(registry.clone());
    let mut views = engine.subscribe_views();

    let report = engine
        .sync_now(&SyncSelection::new().with_course("42", ["pages", "files"]))
        .await
        .unwrap();
    assert!(report.handle_for("42").is_some());
    assert_eq!(registry.get("42").await.unwrap(), report.handle_for("42").cloned());

    let view = wait_for_view(&mut views, course_terminal("42")).await;
    let course = view.course("42").unwrap();

    assert_eq!(course.state, CourseState::PartiallyFailed);
    assert_eq!(view.state, AggregateState::Failed);
    assert_eq!(course.progress.course_name, "Biology");
    assert_eq!(course.progress.tab("pages").unwrap().state, ProgressState::Completed);
    assert_eq!(
        course.progress.tab("files").unwrap().state,
        ProgressState::failed("1 item failed")
    );

    assert!(h.item_path("42", "pages", "intro.html").exists());
    assert!(h.item_path("42", "files", "syllabus.pdf").exists());
    assert!(!h.item_path("42", "files", "broken.pdf").exists());

    // After the grace period the course leaves the view and the registry.
    wait_for_view(&mut views, |view| view.course("42").is_none()).await;
    assert!(registry.get("42").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unresolvable_course_fails_the_job() {
    let h = Harness::new(ScriptedFetcher::new()).await;
    let engine = h.engine(Arc::new(InMemoryJobRegistry::new()));
    assert_eq!(engine.config().retry_policy.max_attempts, 1);
    let mut views = engine.subscribe_views();

    let report = engine
        .sync_now(&SyncSelection::new().with_course("404", ["pages"]))
        .await
        .unwrap();
    let handle = report.handle_for("404").cloned().unwrap();

    // Reported on the first failure, with no backoff in between.
    let view = tokio::time::timeout(
        Duration::from_secs(2),
        wait_for_view(&mut views, course_terminal("404")),
    )
    .await
    .expect("job failure was not reported promptly");
    let course = view.course("404").unwrap();
    assert_eq!(course.state, CourseState::Failed);
    assert_eq!(course.progress.job_error.as_deref(), Some(JOB_FAILED_REASON));
    assert_eq!(h.dispatcher.state(&handle).await.unwrap(), Some(WorkState::Failed));
    assert_eq!(h.fetcher.course_lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_items_sharing_a_name_are_both_kept() {
    let h = Harness::new(ScriptedFetcher::new().with_course(
        "9",
        "History",
        &[("files", &["101:notes.pdf", "202:notes.pdf"])],
    ))
    .await;
    let engine = h.engine(Arc::new(InMemoryJobRegistry::new()));
    let mut views = engine.subscribe_views();

    engine
        .sync_now(&SyncSelection::new().with_course("9", ["files"]))
        .await
        .unwrap();

    let view = wait_for_view(&mut views, course_terminal("9")).await;
    let tab = view.course("9").unwrap().progress.tab("files").unwrap().clone();
    assert_eq!(tab.state, ProgressState::Completed);
    assert!(tab.items.iter().all(|item| item.state == ProgressState::Completed));

    for id in ["101", "202"] {
        let path = h.item_path("9", "files", &format!("{}:notes.pdf", id));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("content of item {}", id)
        );
    }
    let mut stored: Vec<_> = std::fs::read_dir(h.store().tab_dir("9", "files"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    stored.sort();
    assert_eq!(stored, vec!["101_notes.pdf", "202_notes.pdf"]);
}

#[tokio::test]
async fn test_periodic_run_on_cellular_with_wifi_only_enqueues_nothing() {
    let mut network = MockNetwork::new();
    network
        .expect_get_network_info()
        .returning(|| Ok(NetworkInfo::connected(NetworkType::Cellular)));

    let h = Harness::with_network(biology(), Arc::new(network)).await;
    let registry = Arc::new(InMemoryJobRegistry::new());
    let engine = h.engine(registry.clone());
    let mut events = engine.subscribe_events();

    let selection = SyncSelection::new().with_course("42", ["pages"]);
    h.settings
        .set_string(KEY_SELECTION, &serde_json::to_string(&selection).unwrap())
        .await
        .unwrap();
    engine.set_auto_sync(true).await.unwrap();
    assert!(engine.settings().await.unwrap().wifi_only);

    let outcome = engine.run_periodic().await.unwrap();
    assert!(matches!(outcome, PeriodicOutcome::Skipped(ref reason) if reason.contains("metered")));
    assert!(registry.all_active().await.unwrap().is_empty());
    assert_eq!(h.fetcher.course_lookups.load(Ordering::SeqCst), 0);

    let mut skipped = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CoreEvent::Schedule(ScheduleEvent::PeriodicSkipped { .. })) {
            skipped = true;
        }
    }
    assert!(skipped);
}

#[tokio::test]
async fn test_periodic_run_respects_frequency() {
    let h = Harness::new(biology()).await;
    let engine = h.engine(Arc::new(InMemoryJobRegistry::new()));
    let mut views = engine.subscribe_views();

    assert_eq!(
        engine.run_periodic().await.unwrap(),
        PeriodicOutcome::Skipped("Auto-sync is disabled".to_string())
    );
    engine.set_auto_sync(true).await.unwrap();
    assert_eq!(
        engine.run_periodic().await.unwrap(),
        PeriodicOutcome::Skipped("No courses selected for offline use".to_string())
    );

    // A manual sync remembers its selection for periodic runs.
    let selection = SyncSelection::new().with_course("42", ["pages"]);
    engine.sync_now(&selection).await.unwrap();
    assert_eq!(engine.stored_selection().await.unwrap(), Some(selection));
    wait_for_view(&mut views, course_terminal("42")).await;

    match engine.run_periodic().await.unwrap() {
        PeriodicOutcome::Ran(report) => assert!(report.handle_for("42").is_some()),
        other => panic!("expected a periodic run, got {:?}", other),
    }
    wait_for_view(&mut views, course_terminal("42")).await;

    assert_eq!(
        engine.run_periodic().await.unwrap(),
        PeriodicOutcome::Skipped("Sync frequency has not elapsed".to_string())
    );

    h.clock.advance(chrono::Duration::hours(25));
    assert!(matches!(
        engine.run_periodic().await.unwrap(),
        PeriodicOutcome::Ran(_)
    ));
}

#[tokio::test]
async fn test_progress_survives_restart() {
    let fetcher = biology()
        .with_course("7", "Chemistry", &[("pages", &["lab.html"])])
        .holding("files");
    let h = Harness::new(fetcher).await.with_grace(Duration::from_secs(60));
    let registry = Arc::new(InMemoryJobRegistry::new());

    let first = h.engine(registry.clone());
    let mut first_views = first.subscribe_views();
    let report = first
        .sync_now(
            &SyncSelection::new()
                .with_course("42", ["pages", "files"])
                .with_course("7", ["pages"]),
        )
        .await
        .unwrap();
    let handle = report.handle_for("42").cloned().unwrap();

    // Course 7 has finished and is inside its grace period; course 42 is
    // stuck on its held tab.
    let before = wait_for_view(&mut first_views, |view| {
        let chemistry_done = view.course("7").map(|c| c.state.is_terminal()).unwrap_or(false);
        let biology_waiting = view
            .course("42")
            .and_then(|c| c.progress.tab("files"))
            .map(|tab| tab.state == ProgressState::in_progress(0))
            .unwrap_or(false);
        chemistry_done && biology_waiting
    })
    .await;
    assert_eq!(before.courses.len(), 2);
    assert_eq!(*before, *first.current_view().await);
    first.shutdown().await;

    // A new engine on the same registry and dispatcher rebuilds the same view.
    let second = h.engine(registry.clone());
    let mut views = second.subscribe_views();
    assert_eq!(second.start().await.unwrap(), 2);
    assert_eq!(registry.get("42").await.unwrap(), Some(handle));

    let after = wait_for_view(&mut views, |view| view.courses.len() == 2).await;
    assert_eq!(*after, *before);
    assert_eq!(*second.current_view().await, *before);

    h.fetcher.release_all();
    let view = wait_for_view(&mut views, course_terminal("42")).await;
    assert_eq!(view.course("42").unwrap().state, CourseState::PartiallyFailed);
    assert_eq!(view.course("7").unwrap().state, CourseState::Completed);
}

#[tokio::test]
async fn test_at_most_one_active_job_per_course() {
    let h = Harness::new(biology().holding("pages")).await;
    let engine = h.engine(Arc::new(InMemoryJobRegistry::new()));
    let mut events = engine.subscribe_events();
    let selection = SyncSelection::new().with_course("42", ["pages"]);

    let first = engine.sync_now(&selection).await.unwrap();
    let second = engine.sync_now(&selection).await.unwrap();

    assert_eq!(first.enqueued.len(), 1);
    assert!(second.enqueued.is_empty());
    assert_eq!(second.skipped, vec!["42".to_string()]);

    let mut saw_skip = false;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Sync(SyncEvent::Skipped { course_id, .. }) = event {
            assert_eq!(course_id, "42");
            saw_skip = true;
        }
    }
    assert!(saw_skip);

    engine.cancel("42").await.unwrap();
}

#[tokio::test]
async fn test_cancel_keeps_completed_tabs() {
    let h = Harness::new(biology().holding("files")).await;
    let registry = Arc::new(InMemoryJobRegistry::new());
    let engine = h.engine(registry.clone());
    let mut views = engine.subscribe_views();

    let report = engine
        .sync_now(&SyncSelection::new().with_course("42", ["pages", "files"]))
        .await
        .unwrap();
    let handle = report.handle_for("42").cloned().unwrap();

    wait_for_view(&mut views, |view| {
        view.course("42")
            .and_then(|c| c.progress.tab("pages"))
            .map(|tab| tab.state == ProgressState::Completed)
            .unwrap_or(false)
    })
    .await;

    assert!(engine.cancel("42").await.unwrap());
    wait_for_view(&mut views, |view| view.course("42").is_none()).await;

    assert!(registry.get("42").await.unwrap().is_none());
    assert_eq!(
        h.dispatcher.state(&handle).await.unwrap(),
        Some(WorkState::Cancelled)
    );
    assert!(h.item_path("42", "pages", "intro.html").exists());
    assert!(h.item_path("42", "pages", "cells.html").exists());
}

#[tokio::test]
async fn test_registry_failure_withdraws_the_job() {
    let mut registry = MockRegistry::new();
    registry.expect_get().returning(|_| Ok(None));
    registry
        .expect_register()
        .returning(|_, _| Err(SyncError::Registry("disk I/O error".to_string())));
    registry.expect_remove_handle().returning(|_, _| Ok(false));

    let h = Harness::new(biology()).await;
    let engine = h.engine(Arc::new(registry));
    let mut events = engine.subscribe_events();

    let err = engine
        .sync_now(&SyncSelection::new().with_course("42", ["pages"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Registry(_)));

    let mut aborted = false;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Sync(SyncEvent::EnqueueAborted { course_id, .. }) = event {
            assert_eq!(course_id, "42");
            aborted = true;
        }
    }
    assert!(aborted);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fetcher.course_lookups.load(Ordering::SeqCst), 0);
    assert!(engine.current_view().await.is_empty());
}

#[tokio::test]
async fn test_enabling_wifi_only_requires_confirmation() {
    let h = Harness::new(biology()).await;
    let engine = h.engine(Arc::new(InMemoryJobRegistry::new()));

    engine.set_wifi_only(false, false).await.unwrap();
    assert!(!engine.settings().await.unwrap().wifi_only);

    let err = engine.set_wifi_only(true, false).await.unwrap_err();
    assert!(matches!(err, SyncError::ConfirmationRequired(_)));
    assert!(!engine.settings().await.unwrap().wifi_only);

    engine.set_wifi_only(true, true).await.unwrap();
    assert!(engine.settings().await.unwrap().wifi_only);
}

#[tokio::test]
async fn test_remove_offline_content() {
    let h = Harness::new(biology()).await;
    let engine = h.engine(Arc::new(InMemoryJobRegistry::new()));
    let mut views = engine.subscribe_views();

    engine
        .sync_now(&SyncSelection::new().with_course("42", ["pages"]))
        .await
        .unwrap();
    wait_for_view(&mut views, course_terminal("42")).await;
    assert!(h.item_path("42", "pages", "intro.html").exists());

    engine.remove_offline_content("42").await.unwrap();
    assert!(!h.item_path("42", "pages", "intro.html").exists());
}

#[tokio::test]
async fn test_remove_offline_content_stops_running_sync_first() {
    let h = Harness::new(biology().holding("files")).await;
    let registry = Arc::new(InMemoryJobRegistry::new());
    let engine = h.engine(registry.clone());
    let mut views = engine.subscribe_views();

    let report = engine
        .sync_now(&SyncSelection::new().with_course("42", ["pages", "files"]))
        .await
        .unwrap();
    let handle = report.handle_for("42").cloned().unwrap();
    wait_for_view(&mut views, |view| {
        view.course("42")
            .and_then(|c| c.progress.tab("pages"))
            .map(|tab| tab.state == ProgressState::Completed)
            .unwrap_or(false)
    })
    .await;

    engine.remove_offline_content("42").await.unwrap();

    assert_eq!(h.dispatcher.state(&handle).await.unwrap(), Some(WorkState::Cancelled));
    h.fetcher.release_all();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.store().course_dir("42").exists());
}
