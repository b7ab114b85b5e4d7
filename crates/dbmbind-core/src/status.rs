//! Status codes and the status value type.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;

/// Ordered set of status codes.
///
/// The numeric values are stable and form part of the binding's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum StatusCode {
    /// Success.
    #[default]
    Success = 0,
    /// Generic error whose cause is unknown.
    UnknownError = 1,
    /// Generic error from the underlying system.
    SystemError = 2,
    /// Error that the feature is not implemented.
    NotImplementedError = 3,
    /// Error that a precondition is not met.
    PreconditionError = 4,
    /// Error that a given argument is invalid.
    InvalidArgumentError = 5,
    /// Error that the operation is canceled.
    CanceledError = 6,
    /// Error that a specific resource is not found.
    NotFoundError = 7,
    /// Error that the operation is not permitted.
    PermissionError = 8,
    /// Error that the operation is infeasible.
    InfeasibleError = 9,
    /// Error that a specific resource is duplicated.
    DuplicationError = 10,
    /// Error that internal data are broken.
    BrokenDataError = 11,
    /// Error caused by networking failure.
    NetworkError = 12,
    /// Generic error caused by the application logic.
    ApplicationError = 13,
}

impl StatusCode {
    /// All codes in numeric order.
    pub const ALL: [StatusCode; 14] = [
        StatusCode::Success,
        StatusCode::UnknownError,
        StatusCode::SystemError,
        StatusCode::NotImplementedError,
        StatusCode::PreconditionError,
        StatusCode::InvalidArgumentError,
        StatusCode::CanceledError,
        StatusCode::NotFoundError,
        StatusCode::PermissionError,
        StatusCode::InfeasibleError,
        StatusCode::DuplicationError,
        StatusCode::BrokenDataError,
        StatusCode::NetworkError,
        StatusCode::ApplicationError,
    ];

    /// Upper-case name of the code, e.g. `NOT_FOUND_ERROR`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
            Self::NotImplementedError => "NOT_IMPLEMENTED_ERROR",
            Self::PreconditionError => "PRECONDITION_ERROR",
            Self::InvalidArgumentError => "INVALID_ARGUMENT_ERROR",
            Self::CanceledError => "CANCELED_ERROR",
            Self::NotFoundError => "NOT_FOUND_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::InfeasibleError => "INFEASIBLE_ERROR",
            Self::DuplicationError => "DUPLICATION_ERROR",
            Self::BrokenDataError => "BROKEN_DATA_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ApplicationError => "APPLICATION_ERROR",
        }
    }

    /// Numeric value of the code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Look up a code by its numeric value.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    /// Look up a code by its upper-case name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.name() == name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an operation: a code and a free-form diagnostic message.
///
/// Two statuses are equal when their codes are equal; the message is
/// bookkeeping only.
#[derive(Debug, Clone, Default)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// A status with the given code and an empty message.
    #[must_use]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }

    /// A status with the given code and message.
    #[must_use]
    pub fn with_message(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The success status.
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// The status code.
    #[must_use]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// The diagnostic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the code is [`StatusCode::Success`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Success
    }

    /// Overwrite both the code and the message.
    pub fn set(&mut self, code: StatusCode, message: impl Into<String>) {
        self.code = code;
        self.message = message.into();
    }

    /// Merge another status into this one.
    ///
    /// A successful status takes over the first failure joined into it; a
    /// failed status is never cleared or replaced.
    pub fn join(&mut self, other: &Status) {
        if self.is_ok() && !other.is_ok() {
            self.code = other.code;
            self.message.clone_from(&other.message);
        }
    }

    /// Convert a failure into an error value.
    ///
    /// # Errors
    ///
    /// Returns a [`StatusError`] carrying this status when it is not a success.
    pub fn or_die(&self) -> Result<(), StatusError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(StatusError::new(self.clone()))
        }
    }

    /// Convert into a `Result`, keeping the status on failure.
    ///
    /// # Errors
    ///
    /// Returns this status when it is not a success.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }

    /// Name of a raw integer code, or `"unknown"` when out of range.
    #[must_use]
    pub fn code_name(code: i32) -> &'static str {
        StatusCode::from_i32(code).map_or("unknown", StatusCode::name)
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.code.name())
        } else {
            write!(f, "{}: {}", self.code.name(), self.message)
        }
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Status {}

impl PartialEq<StatusCode> for Status {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

impl PartialEq<Status> for StatusCode {
    fn eq(&self, other: &Status) -> bool {
        *self == other.code
    }
}

impl PartialEq<i32> for Status {
    fn eq(&self, other: &i32) -> bool {
        self.code.as_i32() == *other
    }
}

impl BitOrAssign<&Status> for Status {
    fn bitor_assign(&mut self, rhs: &Status) {
        self.join(rhs);
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.join(&rhs);
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(mut self, rhs: Status) -> Status {
        self.join(&rhs);
        self
    }
}

/// Error raised when a failed [`Status`] is explicitly propagated.
///
/// The rendered message is `"<CODE_NAME>: <message>"` (or the bare code name),
/// which [`StatusError::from_message`] parses back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{status}")]
pub struct StatusError {
    status: Status,
}

impl StatusError {
    /// Wrap a status.
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self { status }
    }

    /// The carried status.
    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Consume the error, yielding the carried status.
    #[must_use]
    pub fn into_status(self) -> Status {
        self.status
    }

    /// Rebuild a status error from a rendered message.
    ///
    /// `"NOT_FOUND_ERROR: missing"` gives code `NOT_FOUND_ERROR` and message
    /// `"missing"`. A message whose prefix is not a known code name yields
    /// `SYSTEM_ERROR` with the whole text as its message.
    #[must_use]
    pub fn from_message(text: &str) -> Self {
        let (name, rest) = match text.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (text, None),
        };
        let status = match StatusCode::from_name(name) {
            Some(code) => {
                let message = rest.map_or("", |rest| rest.trim_start_matches(' '));
                Status::with_message(code, message)
            },
            None => Status::with_message(StatusCode::SystemError, text),
        };
        Self { status }
    }
}

impl From<Status> for StatusError {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

impl From<StatusError> for Status {
    fn from(err: StatusError) -> Self {
        err.status
    }
}
