//! Storage Abstractions
//!
//! File I/O for offline course content and a typed key-value store for sync
//! preferences.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// File system access trait
///
/// Offline content lives under [`get_data_directory`](Self::get_data_directory)
/// because it must survive cache purges.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn save_page(fs: &dyn FileSystemAccess, html: Bytes) -> Result<()> {
///     let root = fs.get_data_directory().await?;
///     fs.write_file(&root.join("course-1/pages/intro.html"), html).await
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Persistent application data directory.
    async fn get_data_directory(&self) -> Result<PathBuf>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating or truncating it.
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Move `from` over `to`, replacing `to` if it exists.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Delete a file. Deleting a missing file is not an error.
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Delete a directory and all its contents. Missing directories are ignored.
    async fn delete_dir_all(&self, path: &Path) -> Result<()>;

    /// List the direct entries of a directory. A missing directory lists empty.
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Settings storage trait
///
/// Typed key-value preferences. A value read back with a different type than
/// it was written with is an error, not a silent conversion.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    async fn set_bool(&self, key: &str, value: bool) -> Result<()>;

    async fn get_bool(&self, key: &str) -> Result<Option<bool>>;

    async fn set_i64(&self, key: &str, value: i64) -> Result<()>;

    async fn get_i64(&self, key: &str) -> Result<Option<i64>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn has_key(&self, key: &str) -> Result<bool>;
}
