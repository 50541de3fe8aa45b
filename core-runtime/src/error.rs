//! Errors raised while configuring the sync runtime.

use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value is missing or out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A platform bridge was not injected and has no default on this build.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    /// The bundled desktop default for a bridge could not be created.
    #[error("Default {capability} unavailable: {source}")]
    DefaultBridge {
        capability: &'static str,
        #[source]
        source: BridgeError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
