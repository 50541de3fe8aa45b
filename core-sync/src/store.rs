//! # Offline Content Store
//!
//! Local layout and write discipline for synced course content.
//!
//! ## Overview
//!
//! Content lives at `<root>/<course>/<tab>/<item id>_<item name>`, or just
//! `<item id>` when the remote name is blank, so two items sharing a display
//! name never collide. Every write goes to
//! a `temp_` sibling first and is renamed over the target, so a reader never
//! sees a half-written file and a retry simply overwrites. Failed writes
//! remove their temp file.
//!
//! An optional byte budget bounds total offline content. Written files are
//! tracked in an LRU; once the budget is exceeded the least recently written
//! files of *other* courses are evicted. The store is an explicitly
//! constructed instance passed to every job, never process-wide state.

use crate::{Result, SyncError};
use bridge_traits::{ContentItem, FileSystemAccess};
use bytes::Bytes;
use core_runtime::logging::strip_path;
use lru::LruCache;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TEMP_PREFIX: &str = "temp_";

struct ContentBudget {
    limit: u64,
    used: u64,
    entries: LruCache<PathBuf, u64>,
}

impl ContentBudget {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            entries: LruCache::unbounded(),
        }
    }

    fn record(&mut self, path: PathBuf, size: u64) {
        if let Some(previous) = self.entries.put(path, size) {
            self.used = self.used.saturating_sub(previous);
        }
        self.used += size;
    }

    fn forget(&mut self, path: &Path) {
        if let Some(size) = self.entries.pop(path) {
            self.used = self.used.saturating_sub(size);
        }
    }

    fn forget_under(&mut self, dir: &Path) {
        let doomed: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(dir))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            self.forget(&path);
        }
    }

    /// Picks files to evict, oldest first, never touching `protected`.
    fn select_evictions(&mut self, protected: &Path) -> Vec<PathBuf> {
        let mut victims = Vec::new();
        let mut projected = self.used;
        for (path, size) in self.entries.iter().rev() {
            if projected <= self.limit {
                break;
            }
            if path.starts_with(protected) {
                continue;
            }
            projected = projected.saturating_sub(*size);
            victims.push(path.clone());
        }
        for path in &victims {
            self.forget(path);
        }
        victims
    }
}

/// Offline content on local storage.
pub struct ContentStore {
    fs: Arc<dyn FileSystemAccess>,
    root: PathBuf,
    budget: Option<Mutex<ContentBudget>>,
}

impl ContentStore {
    pub fn new(fs: Arc<dyn FileSystemAccess>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
            budget: None,
        }
    }

    /// Bound the total bytes of content written through this store.
    pub fn with_budget(mut self, limit_bytes: u64) -> Self {
        self.budget = Some(Mutex::new(ContentBudget::new(limit_bytes)));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn course_dir(&self, course_id: &str) -> PathBuf {
        self.root.join(sanitize_segment(course_id))
    }

    pub fn tab_dir(&self, course_id: &str, tab_id: &str) -> PathBuf {
        self.course_dir(course_id).join(sanitize_segment(tab_id))
    }

    pub fn item_path(&self, course_id: &str, tab_id: &str, item: &ContentItem) -> PathBuf {
        self.tab_dir(course_id, tab_id).join(item_file_name(item))
    }

    /// Ensures the course directory exists. A failure here means the job
    /// cannot run at all.
    pub async fn prepare_course(&self, course_id: &str) -> Result<()> {
        let dir = self.course_dir(course_id);
        self.fs.create_dir_all(&dir).await.map_err(|e| {
            SyncError::Bridge(bridge_traits::BridgeError::OperationFailed(format!(
                "Offline storage unavailable for course {}: {}",
                course_id, e
            )))
        })
    }

    /// Writes one item, replacing any previous copy. Returns the bytes written.
    pub async fn write_item(
        &self,
        course_id: &str,
        tab_id: &str,
        item: &ContentItem,
        data: Bytes,
    ) -> Result<u64> {
        let dir = self.tab_dir(course_id, tab_id);
        self.fs.create_dir_all(&dir).await?;

        let name = item_file_name(item);
        let target = dir.join(&name);
        let temp = dir.join(format!("{}{}", TEMP_PREFIX, name));
        let size = data.len() as u64;

        if let Err(e) = self.fs.write_file(&temp, data).await {
            self.discard_temp(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = self.fs.rename(&temp, &target).await {
            self.discard_temp(&temp).await;
            return Err(e.into());
        }

        debug!(file = strip_path(&target.to_string_lossy()), size, "Stored item");

        if let Some(budget) = &self.budget {
            let victims = {
                let mut budget = budget.lock().await;
                budget.record(target, size);
                budget.select_evictions(&self.course_dir(course_id))
            };
            for victim in victims {
                info!(
                    file = strip_path(&victim.to_string_lossy()),
                    "Evicting offline content over budget"
                );
                if let Err(e) = self.fs.delete_file(&victim).await {
                    warn!(error = %e, "Failed to evict offline content");
                }
            }
        }

        Ok(size)
    }

    async fn discard_temp(&self, temp: &Path) {
        if let Err(e) = self.fs.delete_file(temp).await {
            warn!(
                file = strip_path(&temp.to_string_lossy()),
                error = %e,
                "Failed to remove partial download"
            );
        }
    }

    /// Deletes files in a tab directory that belong to none of the `keep`
    /// items (leftover temp files included). Returns how many were removed.
    pub async fn remove_stale_items(
        &self,
        course_id: &str,
        tab_id: &str,
        keep: &[ContentItem],
    ) -> Result<usize> {
        let dir = self.tab_dir(course_id, tab_id);
        let keep: HashSet<String> = keep.iter().map(item_file_name).collect();

        let mut removed = 0;
        for entry in self.fs.list_directory(&dir).await? {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if keep.contains(&name) {
                continue;
            }
            self.fs.delete_file(&entry).await?;
            if let Some(budget) = &self.budget {
                budget.lock().await.forget(&entry);
            }
            removed += 1;
        }

        if removed > 0 {
            debug!(course_id, tab_id, removed, "Removed stale offline items");
        }
        Ok(removed)
    }

    /// Deletes tab directories of a course that are no longer selected.
    pub async fn prune_tabs(&self, course_id: &str, keep_tabs: &[String]) -> Result<usize> {
        let dir = self.course_dir(course_id);
        let keep: HashSet<String> = keep_tabs.iter().map(|t| sanitize_segment(t)).collect();

        let mut removed = 0;
        for entry in self.fs.list_directory(&dir).await? {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if keep.contains(&name) {
                continue;
            }
            self.remove_dir(&entry).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(course_id, removed, "Pruned deselected tabs");
        }
        Ok(removed)
    }

    /// Deletes everything stored for a course.
    pub async fn remove_course(&self, course_id: &str) -> Result<()> {
        let dir = self.course_dir(course_id);
        self.remove_dir(&dir).await
    }

    async fn remove_dir(&self, dir: &Path) -> Result<()> {
        self.fs.delete_dir_all(dir).await?;
        if let Some(budget) = &self.budget {
            budget.lock().await.forget_under(dir);
        }
        Ok(())
    }

    /// Bytes currently accounted against the budget, if one is set.
    pub async fn used_bytes(&self) -> Option<u64> {
        match &self.budget {
            Some(budget) => Some(budget.lock().await.used),
            None => None,
        }
    }
}

/// File name an item is stored under inside its tab directory.
pub fn item_file_name(item: &ContentItem) -> String {
    if item.name.trim().is_empty() {
        sanitize_segment(&item.id)
    } else {
        sanitize_segment(&format!("{}_{}", item.id, item.name.trim()))
    }
}

/// Makes a remote name safe to use as a single path component.
fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
