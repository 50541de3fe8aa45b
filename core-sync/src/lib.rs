//! # Offline Course Sync Engine
//!
//! Downloads selected course content for offline use and reports one
//! consistent view of progress, across process restarts.
//!
//! ## Overview
//!
//! Work is split into one background job per course. Each job walks its
//! selected tabs, fetching items through the host's `ContentFetcher` and
//! publishing immutable progress snapshots through the work dispatcher.
//! A durable registry maps courses to job handles so the aggregator can
//! re-attach after a restart.
//!
//! ## Components
//!
//! - **Progress Model** (`progress`): selections, tab/course states, snapshots, aggregated view
//! - **Course Sync Job** (`job`): per-course work unit with start gate and cooperative cancellation
//! - **Content Store** (`store`): overwrite-safe local writes, stale cleanup, optional size budget
//! - **Job Registry** (`registry`): `course_id → JobHandle`, SQLite or in-memory
//! - **Progress Aggregator** (`aggregator`): merges live snapshots, cleans up finished courses
//! - **Scheduler** (`scheduler`): manual and periodic triggers, sync policy settings
//! - **Engine** (`engine`): facade wiring everything from a `CoreConfig`

pub mod aggregator;
pub mod engine;
pub mod error;
pub mod job;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use aggregator::{ProgressAggregator, JOB_FAILED_REASON};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use job::{start_gate, CourseSyncJob, StartGate, StartGateWaiter, TAB_UNAVAILABLE};
pub use progress::{
    failure_reason, AggregateState, AggregatedSyncView, CourseProgress, CourseSelection,
    CourseState, CourseSyncView, ItemProgress, ProgressState, SyncSelection, TabProgress,
    TAB_BASE_WEIGHT,
};
pub use registry::{InMemoryJobRegistry, JobRegistry, RegistryEntry, SqliteJobRegistry};
pub use scheduler::{
    EnqueuedCourse, PeriodicOutcome, SchedulerDeps, SyncFrequency, SyncReport, SyncScheduler,
    SyncSettings,
};
pub use store::{item_file_name, ContentStore};
