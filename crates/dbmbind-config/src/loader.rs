//! Config loading: defaults, then an optional TOML file, then `DBMBIND_*`
//! environment overrides, then validation.

use std::path::Path;

use dbmbind_telemetry::LogFormat;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::BindingConfig;

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Upper bound on async workers per executor.
const MAX_ASYNC_WORKERS: usize = 1024;

const ENV_ENCODING: &str = "DBMBIND_DEFAULT_ENCODING";
const ENV_WORKERS: &str = "DBMBIND_ASYNC_WORKERS";
const ENV_LOG_LEVEL: &str = "DBMBIND_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "DBMBIND_LOG_FORMAT";

/// Load the configuration with full precedence.
///
/// A missing file is skipped; a present but malformed one is an error.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed, an
/// environment override is malformed, or validation fails.
pub fn load(path: Option<&Path>) -> ConfigResult<BindingConfig> {
    let mut config = match path {
        Some(path) => try_load_file(path)?.unwrap_or_default(),
        None => BindingConfig::default(),
    };
    apply_env(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Load a config from a specific file path with no environment layer.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or
/// validated.
pub fn load_file(path: &Path) -> ConfigResult<BindingConfig> {
    let config = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    validate(&config)?;
    Ok(config)
}

/// Parse a config from TOML text.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the text is malformed or fails validation.
pub fn load_str(content: &str) -> ConfigResult<BindingConfig> {
    let config = parse(content, "<inline>")?;
    validate(&config)?;
    Ok(config)
}

fn try_load_file(path: &Path) -> ConfigResult<Option<BindingConfig>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len(),
            ),
        });
    }

    let config = parse(&content, &path.display().to_string())?;
    info!(path = %path.display(), "loaded binding config");
    Ok(Some(config))
}

fn parse(content: &str, origin: &str) -> ConfigResult<BindingConfig> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: e,
    })
}

/// Apply `DBMBIND_*` overrides from the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] for a malformed value.
pub fn apply_env(config: &mut BindingConfig) -> ConfigResult<()> {
    apply_env_from(config, |name| std::env::var(name).ok())
}

/// Apply `DBMBIND_*` overrides from an arbitrary lookup.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] for a malformed value.
pub fn apply_env_from(
    config: &mut BindingConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<()> {
    if let Some(encoding) = lookup(ENV_ENCODING) {
        config.default_encoding = encoding;
    }
    if let Some(workers) = lookup(ENV_WORKERS) {
        config.default_async_workers =
            workers.trim().parse().map_err(|e| ConfigError::EnvError {
                var_name: ENV_WORKERS.to_owned(),
                message: format!("expected a worker count: {e}"),
            })?;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
    }
    if let Some(format) = lookup(ENV_LOG_FORMAT) {
        config.log.format = match format.to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::EnvError {
                    var_name: ENV_LOG_FORMAT.to_owned(),
                    message: format!("unknown format '{other}'; expected pretty, compact or json"),
                });
            },
        };
    }
    Ok(())
}

/// Check that the configuration is usable.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &BindingConfig) -> ConfigResult<()> {
    if config.default_encoding.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "default_encoding".to_owned(),
            message: "encoding name must not be empty".to_owned(),
        });
    }
    if config.default_async_workers == 0 || config.default_async_workers > MAX_ASYNC_WORKERS {
        return Err(ConfigError::ValidationError {
            field: "default_async_workers".to_owned(),
            message: format!("worker count must be between 1 and {MAX_ASYNC_WORKERS}"),
        });
    }
    if config.log.level.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "log.level".to_owned(),
            message: "log level must not be empty".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BindingConfig::default();
        assert_eq!(config.default_encoding, "ASCII-8BIT");
        assert_eq!(config.default_async_workers, 4);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_load_str_partial() {
        let config = load_str(
            r#"
            default_async_workers = 8

            [log]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_async_workers, 8);
        assert_eq!(config.default_encoding, "ASCII-8BIT");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_load_str_rejects_zero_workers() {
        let result = load_str("default_async_workers = 0");
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_load_str_parse_error() {
        let result = load_str("default_async_workers = \"many\"");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = try_load_file(&dir.path().join("absent.toml"))
            .unwrap()
            .unwrap_or_default();
        apply_env_from(&mut config, |_| None).unwrap();
        assert_eq!(config, BindingConfig::default());
    }

    #[test]
    fn test_load_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbmbind.toml");
        std::fs::write(&path, "default_encoding = \"UTF-8\"\n").unwrap();
        let config = load_file(&path).unwrap();
        assert_eq!(config.default_encoding, "UTF-8");

        let missing = load_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DBMBIND_DEFAULT_ENCODING", "UTF-8"),
            ("DBMBIND_ASYNC_WORKERS", "2"),
            ("DBMBIND_LOG_LEVEL", "trace"),
            ("DBMBIND_LOG_FORMAT", "Pretty"),
        ]
        .into_iter()
        .collect();
        let mut config = BindingConfig::default();
        apply_env_from(&mut config, |name| env.get(name).map(|v| (*v).to_owned())).unwrap();
        assert_eq!(config.default_encoding, "UTF-8");
        assert_eq!(config.default_async_workers, 2);
        assert_eq!(config.log.level, "trace");
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = BindingConfig::default();
        let result = apply_env_from(&mut config, |name| {
            (name == "DBMBIND_ASYNC_WORKERS").then(|| "lots".to_owned())
        });
        assert!(matches!(result, Err(ConfigError::EnvError { .. })));

        let result = apply_env_from(&mut config, |name| {
            (name == "DBMBIND_LOG_FORMAT").then(|| "xml".to_owned())
        });
        assert!(matches!(result, Err(ConfigError::EnvError { .. })));
    }
}
