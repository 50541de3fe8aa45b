//! # Job Registry
//!
//! Durable `course_id → JobHandle` bookkeeping.
//!
//! ## Overview
//!
//! The registry is what lets progress observation survive a process restart:
//! on cold start the aggregator reads [`JobRegistry::all_active`] and
//! re-attaches to every handle the work dispatcher still knows about.
//!
//! Entries are removed once a course's terminal state has been surfaced. The
//! aggregator uses [`JobRegistry::remove_handle`], a compare-and-remove, so a
//! cleanup racing a fresh registration for the same course never deletes the
//! new handle.
//!
//! A registry failure is never swallowed: callers that cannot register a
//! handle must withdraw the job.

use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::{Clock, JobHandle, SystemClock};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One tracked course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub course_id: String,
    pub handle: JobHandle,
    /// Unix millis of the last registration.
    pub registered_at: i64,
}

// ============================================================================
// Registry Trait
// ============================================================================

#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert or replace the handle for a course.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Registry`] if the entry could not be persisted.
    async fn register(&self, course_id: &str, handle: &JobHandle) -> Result<()>;

    /// Every tracked entry, oldest registration first.
    async fn all_active(&self) -> Result<Vec<RegistryEntry>>;

    async fn get(&self, course_id: &str) -> Result<Option<JobHandle>>;

    /// Remove a course's entry. Removing a missing entry is not an error.
    async fn remove(&self, course_id: &str) -> Result<()>;

    /// Remove the entry only if it still points at `handle`. Returns whether
    /// anything was removed.
    async fn remove_handle(&self, course_id: &str, handle: &JobHandle) -> Result<bool>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite-backed job registry.
pub struct SqliteJobRegistry {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, FromRow)]
struct RegistryRow {
    course_id: String,
    handle: String,
    registered_at: i64,
}

impl TryFrom<RegistryRow> for RegistryEntry {
    type Error = SyncError;

    fn try_from(row: RegistryRow) -> Result<Self> {
        let handle = JobHandle::from_string(&row.handle).map_err(|e| {
            SyncError::Registry(format!("Corrupt handle for course {}: {}", row.course_id, e))
        })?;
        Ok(RegistryEntry {
            course_id: row.course_id,
            handle,
            registered_at: row.registered_at,
        })
    }
}

impl SqliteJobRegistry {
    /// Wrap an existing pool, creating the table if needed.
    pub async fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_job_registry (
                course_id TEXT PRIMARY KEY NOT NULL,
                handle TEXT NOT NULL,
                registered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| SyncError::Database(format!("Failed to create registry table: {}", e)))?;

        Ok(Self { pool, clock })
    }

    /// Open (or create) the registry database at `path`.
    pub async fn connect(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::Database(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::Database(format!("Failed to open registry: {}", e)))?;

        debug!(path = %path.display(), "Opened job registry");
        Self::new(pool, clock).await
    }

    /// Private in-memory database, for tests and ephemeral hosts.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| SyncError::Database(format!("Failed to open registry: {}", e)))?;
        Self::new(pool, Arc::new(SystemClock)).await
    }
}

#[async_trait]
impl JobRegistry for SqliteJobRegistry {
    async fn register(&self, course_id: &str, handle: &JobHandle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_job_registry (course_id, handle, registered_at)
            VALUES (?, ?, ?)
            ON CONFLICT(course_id) DO UPDATE SET
                handle = excluded.handle,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(course_id)
        .bind(handle.as_str())
        .bind(self.clock.unix_timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Registry(format!("Failed to register {}: {}", course_id, e)))?;

        debug!(course_id, handle = %handle, "Registered job handle");
        Ok(())
    }

    async fn all_active(&self) -> Result<Vec<RegistryEntry>> {
        let rows = sqlx::query_as::<_, RegistryRow>(
            r#"
            SELECT course_id, handle, registered_at
            FROM sync_job_registry
            ORDER BY registered_at ASC, course_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Registry(e.to_string()))?;

        rows.into_iter()
            .map(RegistryEntry::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn get(&self, course_id: &str) -> Result<Option<JobHandle>> {
        let row = sqlx::query_as::<_, RegistryRow>(
            "SELECT course_id, handle, registered_at FROM sync_job_registry WHERE course_id = ?",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Registry(e.to_string()))?;

        Ok(row.map(RegistryEntry::try_from).transpose()?.map(|e| e.handle))
    }

    async fn remove(&self, course_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_job_registry WHERE course_id = ?")
            .bind(course_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Registry(e.to_string()))?;
        Ok(())
    }

    async fn remove_handle(&self, course_id: &str, handle: &JobHandle) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_job_registry WHERE course_id = ? AND handle = ?")
            .bind(course_id)
            .bind(handle.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Registry(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Registry kept in process memory. Nothing survives a restart unless the
/// instance itself is shared.
pub struct InMemoryJobRegistry {
    entries: RwLock<BTreeMap<String, (JobHandle, i64)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
        }
    }
}

impl Default for InMemoryJobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn register(&self, course_id: &str, handle: &JobHandle) -> Result<()> {
        let now = self.clock.unix_timestamp_millis();
        self.entries
            .write()
            .await
            .insert(course_id.to_string(), (handle.clone(), now));
        Ok(())
    }

    async fn all_active(&self) -> Result<Vec<RegistryEntry>> {
        let mut entries: Vec<RegistryEntry> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(course_id, (handle, registered_at))| RegistryEntry {
                course_id: course_id.clone(),
                handle: handle.clone(),
                registered_at: *registered_at,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.course_id.cmp(&b.course_id))
        });
        Ok(entries)
    }

    async fn get(&self, course_id: &str) -> Result<Option<JobHandle>> {
        Ok(self
            .entries
            .read()
            .await
            .get(course_id)
            .map(|(handle, _)| handle.clone()))
    }

    async fn remove(&self, course_id: &str) -> Result<()> {
        self.entries.write().await.remove(course_id);
        Ok(())
    }

    async fn remove_handle(&self, course_id: &str, handle: &JobHandle) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get(course_id) {
            Some((current, _)) if current == handle => {
                entries.remove(course_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
