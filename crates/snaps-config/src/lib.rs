//! Layered configuration for the Snaps plugin runtime.
//!
//! Precedence, highest first:
//!
//! 1. The config file passed to [`Config::load`]
//! 2. `SNAPS_*` environment variables (fallback only: they fill fields the
//!    file left unset)
//! 3. Embedded defaults (`defaults.toml`)
//!
//! ```rust,no_run
//! use snaps_config::Config;
//!
//! let config = Config::load(Some(std::path::Path::new("snaps.toml"))).unwrap();
//! println!("request budget: {:?}", config.execution.handler_timeout("onRpcRequest"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Configuration error types.
pub mod error;
/// File and environment loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::{Config, ControllerConfig, ExecutionConfig, IdlePolicy};

impl Config {
    /// Load with the full precedence chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is malformed or the result fails
    /// validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path)
    }

    /// Parse a TOML document layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the document is malformed or invalid.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        loader::load_str(content)
    }
}
