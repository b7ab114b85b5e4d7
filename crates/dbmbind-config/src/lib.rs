#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Runtime configuration for the dbmbind binding layer.
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`DBMBIND_*`)
//! 2. **Config file** passed to [`load`]
//! 3. **Built-in defaults**
//!
//! ```rust,no_run
//! let config = dbmbind_config::load(Some(std::path::Path::new("dbmbind.toml"))).unwrap();
//! println!("default encoding: {}", config.default_encoding);
//! ```

/// Configuration error types.
pub mod error;
/// File and environment loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::{apply_env, apply_env_from, load, load_file, load_str, validate};
pub use types::BindingConfig;
