//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `WorkDispatcher` using an in-process Tokio dispatcher
//! - `ContentFetcher` over HTTP using `reqwest`
//! - `FileSystemAccess` using `tokio::fs`
//! - `SettingsStore` using SQLite-backed key-value store
//! - `NetworkMonitor` using a TCP probe, or host-pushed state
//! - `PowerMonitor` with host-pushed battery state
//!
//! Work dispatched here lives as long as the process. Hosts that need jobs to
//! survive restarts (mobile OS schedulers) inject their own dispatcher.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{HttpContentFetcher, TokioFileSystem, TokioWorkDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let fetcher = HttpContentFetcher::new("https://lms.example.com/api/v1")?
//!         .with_auth_token("token");
//!     let dispatcher = TokioWorkDispatcher::new(4);
//!     let fs = TokioFileSystem::new();
//!
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod filesystem;
mod http;
mod network;
mod power;
mod settings;
mod work;

pub use filesystem::TokioFileSystem;
pub use http::{HttpContentFetcher, DEFAULT_REQUEST_TIMEOUT};
pub use network::{DesktopNetworkMonitor, ManualNetworkMonitor};
pub use power::DesktopPowerMonitor;
pub use settings::SqliteSettingsStore;
pub use work::{TokioWorkDispatcher, DEFAULT_CONSTRAINT_POLL_INTERVAL};
