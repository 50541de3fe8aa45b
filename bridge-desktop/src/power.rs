//! Power State Implementation

use async_trait::async_trait;
use bridge_traits::{error::Result, power::PowerMonitor};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Desktop power monitor.
///
/// Desktops are usually on mains power, so the battery starts out "not low".
/// Hosts that read a real battery push updates through
/// [`set_battery_low`](Self::set_battery_low).
#[derive(Default)]
pub struct DesktopPowerMonitor {
    battery_low: AtomicBool,
}

impl DesktopPowerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_battery_low(&self, low: bool) {
        debug!(low, "Battery state updated");
        self.battery_low.store(low, Ordering::SeqCst);
    }
}

#[async_trait]
impl PowerMonitor for DesktopPowerMonitor {
    async fn is_battery_low(&self) -> Result<bool> {
        Ok(self.battery_low.load(Ordering::SeqCst))
    }
}
