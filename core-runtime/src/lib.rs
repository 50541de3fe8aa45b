//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the offline sync engine:
//! - Logging and tracing bootstrap
//! - Configuration and bridge wiring
//! - Typed event bus
//!
//! ## Overview
//!
//! Nothing in this crate knows how a course is synced. It establishes the
//! logging conventions, the fail-fast configuration builder and the broadcast
//! channel that `core-sync` publishes lifecycle events on.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
