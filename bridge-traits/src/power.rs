//! Power State Abstraction

use async_trait::async_trait;

use crate::error::Result;

/// Reports battery conditions that gate background downloads.
#[async_trait]
pub trait PowerMonitor: Send + Sync {
    /// `true` when the OS considers the battery low.
    async fn is_battery_low(&self) -> Result<bool>;
}
