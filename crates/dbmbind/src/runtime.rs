//! Process-wide binding state shared by every handle.

use std::path::Path;
use std::sync::Arc;

use dbmbind_config::BindingConfig;
use tracing::{debug, info};

use crate::bridge::{Bridge, HostGuard};
use crate::encoding::{Encoding, EncodingTable};
use crate::error::{BindingError, BindingResult};

/// Shared state behind every handle: the bridge and host lock, the encoding
/// table, and the loaded configuration.
#[derive(Debug)]
pub struct Runtime {
    bridge: Bridge,
    encodings: EncodingTable,
    default_encoding: Encoding,
    config: BindingConfig,
}

impl Runtime {
    /// Create a runtime from a validated configuration.
    ///
    /// # Errors
    ///
    /// [`BindingError::UnknownEncoding`] when the configured default encoding
    /// is not supported.
    pub fn init(config: BindingConfig) -> BindingResult<Arc<Self>> {
        let encodings = EncodingTable::standard();
        let default_encoding = encodings
            .find(&config.default_encoding)
            .ok_or_else(|| BindingError::UnknownEncoding(config.default_encoding.clone()))?;
        info!(
            default_encoding = %default_encoding,
            async_workers = config.default_async_workers,
            "binding runtime initialized"
        );
        Ok(Arc::new(Self {
            bridge: Bridge::new(),
            encodings,
            default_encoding,
            config,
        }))
    }

    /// Create a runtime with built-in defaults.
    #[must_use]
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Self {
            bridge: Bridge::new(),
            encodings: EncodingTable::standard(),
            default_encoding: Encoding::Binary,
            config: BindingConfig::default(),
        })
    }

    /// Load configuration (file, then `DBMBIND_*` environment) and create a
    /// runtime from it.
    ///
    /// # Errors
    ///
    /// Configuration failures or an unsupported default encoding.
    pub fn load(path: Option<&Path>) -> BindingResult<Arc<Self>> {
        let config = dbmbind_config::load(path)?;
        Self::init(config)
    }

    /// Install the global log subscriber described by the configuration.
    ///
    /// # Errors
    ///
    /// [`BindingError::Telemetry`] for a malformed filter or when a
    /// subscriber is already installed.
    pub fn install_logging(&self) -> BindingResult<()> {
        dbmbind_telemetry::setup_logging(&self.config.log)?;
        debug!("binding logging installed");
        Ok(())
    }

    /// The concurrency bridge.
    #[must_use]
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Mark the current thread as a host thread holding the host lock.
    pub fn enter_host(&self) -> HostGuard<'_> {
        self.bridge.host_lock().acquire()
    }

    /// Resolve an encoding name; an empty name yields the default.
    ///
    /// # Errors
    ///
    /// [`BindingError::UnknownEncoding`] for an unsupported name.
    pub fn encoding(&self, name: &str) -> BindingResult<Encoding> {
        if name.trim().is_empty() {
            return Ok(self.default_encoding);
        }
        self.encodings
            .find(name)
            .ok_or_else(|| BindingError::UnknownEncoding(name.to_owned()))
    }

    /// The encoding used when a handle names none.
    #[must_use]
    pub fn default_encoding(&self) -> Encoding {
        self.default_encoding
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    /// Version of the binding layer.
    #[must_use]
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_resolves_default_encoding() {
        let config = BindingConfig {
            default_encoding: "utf-8".to_owned(),
            ..BindingConfig::default()
        };
        let runtime = Runtime::init(config).unwrap();
        assert_eq!(runtime.default_encoding(), Encoding::Utf8);
        assert_eq!(runtime.encoding("").unwrap(), Encoding::Utf8);
        assert_eq!(runtime.encoding("ASCII-8BIT").unwrap(), Encoding::Binary);
    }

    #[test]
    fn test_init_rejects_unknown_encoding() {
        let config = BindingConfig {
            default_encoding: "KOI8-R".to_owned(),
            ..BindingConfig::default()
        };
        let err = Runtime::init(config).unwrap_err();
        assert!(matches!(err, BindingError::UnknownEncoding(name) if name == "KOI8-R"));
    }

    #[test]
    fn test_enter_host_holds_lock() {
        let runtime = Runtime::with_defaults();
        let guard = runtime.enter_host();
        assert!(runtime.bridge().host_lock().is_held_by_current_thread());
        drop(guard);
        assert!(!runtime.bridge().host_lock().is_held_by_current_thread());
        assert!(!Runtime::version().is_empty());
    }
}
