//! Binding error types.
//!
//! Engine failures normally come back as [`Status`] values. A
//! [`BindingError`] is raised instead when the caller breaks the handle
//! contract (using a closed or destructed handle, consuming a future twice)
//! or when the caller explicitly asks for a failing status to be raised.

use dbmbind_config::ConfigError;
use dbmbind_core::{Status, StatusError};
use dbmbind_telemetry::TelemetryError;
use thiserror::Error;

/// Errors raised by binding handles.
#[derive(Debug, Error)]
pub enum BindingError {
    /// The database handle is not bound to an open engine.
    #[error("not opened database")]
    NotOpened,

    /// `open` was called on a handle that is already open.
    #[error("opened database")]
    AlreadyOpened,

    /// A file handle passed as an argument is not open.
    #[error("not opened file")]
    FileNotOpened,

    /// The handle was explicitly destructed.
    #[error("destructed {0}")]
    Destructed(&'static str),

    /// `get` was called on a future that was already consumed.
    #[error("consumed future")]
    FutureConsumed,

    /// An `encoding` parameter named no known encoding.
    #[error("unknown encoding name: {0}")]
    UnknownEncoding(String),

    /// The host runtime could not provide a resource.
    #[error("runtime failure: {0}")]
    Runtime(String),

    /// A failing status was raised.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Logging could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

impl BindingError {
    /// The status carried by a raised status error.
    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Status(err) => Some(err.status()),
            _ => None,
        }
    }

    /// Reconstruct a status from the error.
    ///
    /// Contract errors carry no code of their own, so their message is
    /// parsed the way raised status messages are.
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self {
            Self::Status(err) => err.status().clone(),
            other => StatusError::from_message(&other.to_string()).into_status(),
        }
    }
}

impl From<Status> for BindingError {
    fn from(status: Status) -> Self {
        Self::Status(StatusError::new(status))
    }
}

/// Result type for binding operations.
pub type BindingResult<T> = Result<T, BindingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use dbmbind_core::StatusCode;

    #[test]
    fn test_contract_error_messages() {
        assert_eq!(BindingError::NotOpened.to_string(), "not opened database");
        assert_eq!(BindingError::AlreadyOpened.to_string(), "opened database");
        assert_eq!(
            BindingError::Destructed("Iterator").to_string(),
            "destructed Iterator"
        );
    }

    #[test]
    fn test_raised_status_round_trips() {
        let status = Status::with_message(StatusCode::NotFoundError, "no such key");
        let err = BindingError::from(status.clone());
        assert_eq!(err.to_string(), "NOT_FOUND_ERROR: no such key");
        assert_eq!(err.status(), Some(&status));
        let rebuilt = err.to_status();
        assert_eq!(rebuilt.code(), StatusCode::NotFoundError);
        assert_eq!(rebuilt.message(), "no such key");
    }

    #[test]
    fn test_contract_error_maps_to_system_error() {
        let status = BindingError::NotOpened.to_status();
        assert_eq!(status.code(), StatusCode::SystemError);
        assert_eq!(status.message(), "not opened database");
    }
}
