use dbmbind_telemetry::LogConfig;
use serde::{Deserialize, Serialize};

/// Encoding tag used when an open call does not name one.
pub const DEFAULT_ENCODING: &str = "ASCII-8BIT";

/// Worker count used by async executors created without an explicit size.
pub const DEFAULT_ASYNC_WORKERS: usize = 4;

/// Settings consumed when the binding runtime is initialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Encoding tag applied to returned strings when `encoding` is not
    /// passed to `open`.
    pub default_encoding: String,
    /// Worker threads for executors created with the default size.
    pub default_async_workers: usize,
    /// Logging settings.
    pub log: LogConfig,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            default_encoding: DEFAULT_ENCODING.to_owned(),
            default_async_workers: DEFAULT_ASYNC_WORKERS,
            log: LogConfig::default(),
        }
    }
}
