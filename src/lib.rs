//! Workspace facade crate.
//!
//! Host applications depend on `course-sync` and pick a feature instead of
//! wiring the workspace crates individually:
//!
//! - `engine`: the sync engine and bridge traits, every bridge injected by the host
//! - `desktop-shims` (default): `engine` plus the `bridge-desktop` defaults for
//!   the work dispatcher, settings store and file system

#[cfg(feature = "engine")]
pub use bridge_traits;
#[cfg(feature = "engine")]
pub use core_runtime;
#[cfg(feature = "engine")]
pub use core_sync;
