//! # Core Configuration Module
//!
//! Configuration and bridge wiring for the offline sync engine.
//!
//! ## Overview
//!
//! [`CoreConfig`] is assembled with a builder and validated fail-fast, so a
//! host finds out about a missing adapter at startup rather than when the
//! first course sync is attempted.
//!
//! ## Required Dependencies
//!
//! - `ContentFetcher` - always host-provided; there is no generic default
//! - `WorkDispatcher` - desktop default: in-process Tokio dispatcher
//! - `SettingsStore` - desktop default: SQLite key-value store
//!
//! ## Optional Dependencies
//!
//! - `FileSystemAccess` - desktop default: Tokio filesystem rooted at `data_dir`
//! - `NetworkMonitor` - without one, Wi-Fi-only periodic runs are skipped
//! - `PowerMonitor` - consulted by the desktop dispatcher only
//! - `Clock` - defaults to the system clock
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .data_dir("/var/lib/app/offline")
//!     .database_path("/var/lib/app/sync.db")
//!     .content_fetcher(Arc::new(MyApiFetcher::new()))
//!     .item_concurrency(4)
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // No ContentFetcher: fails with an actionable CapabilityMissing error
//! let config = CoreConfig::builder()
//!     .data_dir("/tmp/offline")
//!     .database_path("/tmp/sync.db")
//!     .build()
//!     .expect("Should fail - missing content fetcher");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{
    Clock, ContentFetcher, FileSystemAccess, NetworkMonitor, PowerMonitor, RetryPolicy,
    SettingsStore, SystemClock, WorkDispatcher,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ITEM_CONCURRENCY: usize = 6;
pub const MAX_ITEM_CONCURRENCY: usize = 32;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const DEFAULT_CLEANUP_GRACE_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = crate::events::DEFAULT_EVENT_BUFFER_SIZE;

/// Engine configuration plus the bridges it runs on.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root directory for offline course content
    pub data_dir: PathBuf,

    /// SQLite database holding the job registry
    pub database_path: PathBuf,

    /// Items fetched concurrently within one tab
    pub item_concurrency: usize,

    /// Course jobs the default dispatcher runs at once
    pub max_concurrent_jobs: usize,

    /// How long a finished course stays visible before registry cleanup
    pub cleanup_grace_period: Duration,

    pub event_buffer_size: usize,

    /// Optional size budget for offline content; least recently written
    /// files of other courses are evicted beyond it
    pub content_budget_bytes: Option<u64>,

    /// Retry policy handed to the dispatcher with every job. Defaults to a
    /// single attempt: a failed job is reported at once and retrying is an
    /// explicit new sync.
    pub retry_policy: RetryPolicy,

    pub content_fetcher: Arc<dyn ContentFetcher>,
    pub work_dispatcher: Arc<dyn WorkDispatcher>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub power_monitor: Option<Arc<dyn PowerMonitor>>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("data_dir", &self.data_dir)
            .field("database_path", &self.database_path)
            .field("item_concurrency", &self.item_concurrency)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("cleanup_grace_period", &self.cleanup_grace_period)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("content_budget_bytes", &self.content_budget_bytes)
            .field("retry_policy", &self.retry_policy)
            .field(
                "network_monitor",
                &self.network_monitor.as_ref().map(|_| "NetworkMonitor { ... }"),
            )
            .field(
                "power_monitor",
                &self.power_monitor.as_ref().map(|_| "PowerMonitor { ... }"),
            )
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Paths are not empty
    /// - Item concurrency is within 1..=32
    /// - Job concurrency and event buffer are non-zero
    /// - The retry policy allows at least one attempt
    /// - A content budget, if set, is non-zero
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.item_concurrency == 0 || self.item_concurrency > MAX_ITEM_CONCURRENCY {
            return Err(Error::Config(format!(
                "Item concurrency must be between 1 and {}, got {}",
                MAX_ITEM_CONCURRENCY, self.item_concurrency
            )));
        }

        if self.max_concurrent_jobs == 0 {
            return Err(Error::Config(
                "Max concurrent jobs must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.retry_policy.max_attempts == 0 {
            return Err(Error::Config(
                "Retry policy must allow at least one attempt".to_string(),
            ));
        }

        if self.content_budget_bytes == Some(0) {
            return Err(Error::Config(
                "Content budget must be greater than 0 bytes when set".to_string(),
            ));
        }

        Ok(())
    }
}

fn content_fetcher_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "ContentFetcher".to_string(),
        message: "A ContentFetcher is required to download course content. \
                 Desktop: use bridge_desktop::HttpContentFetcher with the API base URL. \
                 Mobile: inject an adapter over the app's API client."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn missing_bridge_error(capability: &str, purpose: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: format!(
            "{} implementation is required for {}. \
             Desktop: enable the 'desktop-shims' feature to use the bridge-desktop default. \
             Mobile: inject the platform-native adapter.",
            capability, purpose
        ),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_store(database_path: &std::path::Path) -> Result<Arc<dyn SettingsStore>> {
    use bridge_desktop::SqliteSettingsStore;

    let store = SqliteSettingsStore::open_lazy(database_path).map_err(|source| {
        Error::DefaultBridge {
            capability: "SettingsStore",
            source,
        }
    })?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_store(_database_path: &std::path::Path) -> Result<Arc<dyn SettingsStore>> {
    Err(missing_bridge_error("SettingsStore", "sync preferences"))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(data_dir: &std::path::Path) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    Ok(Arc::new(TokioFileSystem::with_data_dir(data_dir.to_path_buf())))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_data_dir: &std::path::Path) -> Result<Arc<dyn FileSystemAccess>> {
    Err(missing_bridge_error("FileSystemAccess", "offline content storage"))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_work_dispatcher(
    max_concurrent_jobs: usize,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    power_monitor: Option<Arc<dyn PowerMonitor>>,
) -> Result<Arc<dyn WorkDispatcher>> {
    use bridge_desktop::TokioWorkDispatcher;

    let dispatcher = TokioWorkDispatcher::new(max_concurrent_jobs)
        .with_network_monitor(network_monitor)
        .with_power_monitor(power_monitor);
    Ok(Arc::new(dispatcher))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_work_dispatcher(
    _max_concurrent_jobs: usize,
    _network_monitor: Option<Arc<dyn NetworkMonitor>>,
    _power_monitor: Option<Arc<dyn PowerMonitor>>,
) -> Result<Arc<dyn WorkDispatcher>> {
    Err(missing_bridge_error("WorkDispatcher", "running course sync jobs"))
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    data_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    item_concurrency: Option<usize>,
    max_concurrent_jobs: Option<usize>,
    cleanup_grace_period: Option<Duration>,
    event_buffer_size: Option<usize>,
    content_budget_bytes: Option<u64>,
    retry_policy: Option<RetryPolicy>,
    content_fetcher: Option<Arc<dyn ContentFetcher>>,
    work_dispatcher: Option<Arc<dyn WorkDispatcher>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    power_monitor: Option<Arc<dyn PowerMonitor>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    /// Root directory for offline course content.
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// SQLite database for the job registry (and the default settings store).
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Items fetched concurrently within one tab. Default: 6.
    pub fn item_concurrency(mut self, n: usize) -> Self {
        self.item_concurrency = Some(n);
        self
    }

    /// Jobs the default dispatcher runs at once. Default: 4.
    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.max_concurrent_jobs = Some(n);
        self
    }

    /// Default: 3 seconds.
    pub fn cleanup_grace_period(mut self, grace: Duration) -> Self {
        self.cleanup_grace_period = Some(grace);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn content_budget_bytes(mut self, bytes: u64) -> Self {
        self.content_budget_bytes = Some(bytes);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the content fetch adapter (required).
    pub fn content_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.content_fetcher = Some(fetcher);
        self
    }

    pub fn work_dispatcher(mut self, dispatcher: Arc<dyn WorkDispatcher>) -> Self {
        self.work_dispatcher = Some(dispatcher);
        self
    }

    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn power_monitor(mut self, monitor: Arc<dyn PowerMonitor>) -> Self {
        self.power_monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for a missing path or an out-of-range setting
    /// - [`Error::CapabilityMissing`] when a required bridge is absent and no
    ///   platform default is compiled in
    pub fn build(self) -> Result<CoreConfig> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| Error::Config("Data directory is required".to_string()))?;
        let database_path = self
            .database_path
            .ok_or_else(|| Error::Config("Database path is required".to_string()))?;

        let content_fetcher = self
            .content_fetcher
            .ok_or_else(content_fetcher_missing_error)?;

        let max_concurrent_jobs = self
            .max_concurrent_jobs
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => provide_default_settings_store(&database_path)?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&data_dir)?,
        };

        let work_dispatcher = match self.work_dispatcher {
            Some(dispatcher) => dispatcher,
            None => provide_default_work_dispatcher(
                max_concurrent_jobs,
                self.network_monitor.clone(),
                self.power_monitor.clone(),
            )?,
        };

        let config = CoreConfig {
            data_dir,
            database_path,
            item_concurrency: self.item_concurrency.unwrap_or(DEFAULT_ITEM_CONCURRENCY),
            max_concurrent_jobs,
            cleanup_grace_period: self
                .cleanup_grace_period
                .unwrap_or(DEFAULT_CLEANUP_GRACE_PERIOD),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            content_budget_bytes: self.content_budget_bytes,
            retry_policy: self.retry_policy.unwrap_or_else(RetryPolicy::no_retry),
            content_fetcher,
            work_dispatcher,
            settings_store,
            file_system,
            network_monitor: self.network_monitor,
            power_monitor: self.power_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;
        Ok(config)
    }
}
