//! Network Monitoring Abstraction
//!
//! Reports the device's current connectivity so the scheduler can refuse to
//! start Wi-Fi-only work on a metered connection, and so a work dispatcher can
//! hold queued jobs until their network requirement is met.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Snapshot of the device's connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    /// Connected over the given transport, metered only for cellular.
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: network_type == NetworkType::Cellular,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == NetworkStatus::Connected
    }

    /// Connected, not metered, and not riding on a cellular link.
    pub fn is_unmetered(&self) -> bool {
        self.is_connected()
            && !self.is_metered
            && self.network_type != Some(NetworkType::Cellular)
    }
}

/// Network condition a unit of work needs before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    /// Any live connection.
    Connected,
    /// Wi-Fi or wired, never metered.
    Unmetered,
}

impl NetworkRequirement {
    /// `Unmetered` when the user restricted sync to Wi-Fi.
    pub fn for_wifi_only(wifi_only: bool) -> Self {
        if wifi_only {
            Self::Unmetered
        } else {
            Self::Connected
        }
    }

    pub fn is_satisfied_by(&self, info: &NetworkInfo) -> bool {
        match self {
            Self::Connected => info.is_connected(),
            Self::Unmetered => info.is_unmetered(),
        }
    }
}

/// Network monitor trait
///
/// # Platform Support
///
/// - **Desktop**: connectivity probe, or host-reported state
/// - **iOS**: Network framework path monitor
/// - **Android**: ConnectivityManager
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        matches!(self.get_network_info().await, Ok(info) if info.is_connected())
    }

    /// Evaluate a requirement against the current network. Errors count as
    /// "not satisfied".
    async fn satisfies(&self, requirement: NetworkRequirement) -> bool {
        match self.get_network_info().await {
            Ok(info) => requirement.is_satisfied_by(&info),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use mockall::mock;

    mock! {
        pub Monitor {}

        #[async_trait]
        impl NetworkMonitor for Monitor {
            async fn get_network_info(&self) -> Result<NetworkInfo>;
        }
    }

    #[test]
    fn test_cellular_is_metered() {
        let info = NetworkInfo::connected(NetworkType::Cellular);
        assert!(info.is_connected());
        assert!(info.is_metered);
        assert!(!info.is_unmetered());
    }

    #[test]
    fn test_requirement_evaluation() {
        let wifi = NetworkInfo::connected(NetworkType::WiFi);
        let cellular = NetworkInfo::connected(NetworkType::Cellular);
        let offline = NetworkInfo::disconnected();

        assert!(NetworkRequirement::Unmetered.is_satisfied_by(&wifi));
        assert!(!NetworkRequirement::Unmetered.is_satisfied_by(&cellular));
        assert!(NetworkRequirement::Connected.is_satisfied_by(&cellular));
        assert!(!NetworkRequirement::Connected.is_satisfied_by(&offline));
    }

    #[test]
    fn test_metered_wifi_is_not_unmetered() {
        let hotspot = NetworkInfo {
            status: NetworkStatus::Connected,
            network_type: Some(NetworkType::WiFi),
            is_metered: true,
        };
        assert!(!NetworkRequirement::Unmetered.is_satisfied_by(&hotspot));
    }

    #[test]
    fn test_requirement_for_wifi_only() {
        assert_eq!(
            NetworkRequirement::for_wifi_only(true),
            NetworkRequirement::Unmetered
        );
        assert_eq!(
            NetworkRequirement::for_wifi_only(false),
            NetworkRequirement::Connected
        );
    }

    #[tokio::test]
    async fn test_default_methods_use_network_info() {
        let mut monitor = MockMonitor::new();
        monitor
            .expect_get_network_info()
            .returning(|| Ok(NetworkInfo::connected(NetworkType::Cellular)));

        assert!(monitor.is_connected().await);
        assert!(monitor.satisfies(NetworkRequirement::Connected).await);
        assert!(!monitor.satisfies(NetworkRequirement::Unmetered).await);
    }

    #[tokio::test]
    async fn test_monitor_error_is_not_satisfied() {
        let mut monitor = MockMonitor::new();
        monitor
            .expect_get_network_info()
            .returning(|| Err(BridgeError::NotAvailable("network".to_string())));

        assert!(!monitor.is_connected().await);
        assert!(!monitor.satisfies(NetworkRequirement::Connected).await);
    }
}
