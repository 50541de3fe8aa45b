//! Content Fetch Abstraction
//!
//! The sync engine never speaks HTTP itself. Everything it downloads goes
//! through a [`ContentFetcher`], which resolves course metadata, enumerates
//! the items behind a tab and fetches each item's bytes. Timeouts belong to
//! the implementation; the engine does not impose its own.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A tab the course exposes, with its display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub label: String,
}

/// Course details resolved before any content is downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tabs: Vec<TabInfo>,
}

impl CourseSummary {
    pub fn tab(&self, tab_id: &str) -> Option<&TabInfo> {
        self.tabs.iter().find(|tab| tab.id == tab_id)
    }
}

/// One downloadable piece of course content (a page, a file, a listing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    /// File name the content is stored under locally.
    pub name: String,
    pub url: String,
    /// Size in bytes when known up front.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Content fetch adapter
///
/// # Example
///
/// ```ignore
/// use bridge_traits::content::ContentFetcher;
///
/// async fn first_page(fetcher: &dyn ContentFetcher) -> Result<Bytes> {
///     let items = fetcher.list_items("course-1", "pages").await?;
///     fetcher.fetch(&items[0]).await
/// }
/// ```
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Resolve the course name and the tabs it exposes.
    async fn course(&self, course_id: &str) -> Result<CourseSummary>;

    /// Enumerate the content items behind one tab.
    async fn list_items(&self, course_id: &str, tab_id: &str) -> Result<Vec<ContentItem>>;

    /// Fetch the payload of a single item.
    async fn fetch(&self, item: &ContentItem) -> Result<Bytes>;
}
