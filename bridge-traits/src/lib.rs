//! # Host Bridge Traits
//!
//! Capabilities the offline sync engine needs from its host platform.
//!
//! ## Overview
//!
//! The engine in `core-sync` only orchestrates. Running background work,
//! talking to the content API, storing files and preferences, and observing
//! connectivity are all delegated to implementations of the traits below.
//! Desktop hosts get ready-made adapters from `bridge-desktop`; mobile hosts
//! inject their own.
//!
//! ## Traits
//!
//! ### Work
//! - [`WorkDispatcher`](work::WorkDispatcher) - Runs [`WorkUnit`](work::WorkUnit)s under constraints, retains progress per handle
//!
//! ### Content & Storage
//! - [`ContentFetcher`](content::ContentFetcher) - Course metadata, tab listings, item payloads
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Offline content files
//! - [`SettingsStore`](storage::SettingsStore) - Sync preferences
//!
//! ### Device State
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity and metered detection
//! - [`PowerMonitor`](power::PowerMonitor) - Low-battery detection
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Every trait reports failures as [`BridgeError`](error::BridgeError).
//! Implementations convert platform errors and include enough context (path,
//! URL without query, handle) to act on.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; the engine shares adapters across many
//! concurrently running jobs.

pub mod content;
pub mod error;
pub mod network;
pub mod power;
pub mod storage;
pub mod time;
pub mod work;

pub use error::BridgeError;

// Re-export commonly used types
pub use content::{ContentFetcher, ContentItem, CourseSummary, TabInfo};
pub use network::{NetworkInfo, NetworkMonitor, NetworkRequirement, NetworkStatus, NetworkType};
pub use power::PowerMonitor;
pub use storage::{FileMetadata, FileSystemAccess, SettingsStore};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
pub use work::{
    JobHandle, ProgressReporter, RetryPolicy, WorkConstraints, WorkContext, WorkDispatcher,
    WorkState, WorkUnit, WorkUpdate, WorkUpdateStream,
};
