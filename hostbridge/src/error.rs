use std::{fmt, sync::Arc};

use thiserror::Error as ThisError;

use crate::{engine::Status, reference::Reference};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The single host-side error type.
#[derive(Clone, ThisError)]
pub enum Error {
    /// A non-success status from an engine call.
    #[error("{message}")]
    Engine { status: Status, message: String },
    /// A script exception surfaced into host code. `value` keeps the thrown
    /// script value alive so it can be rethrown unchanged.
    #[error("{message}")]
    Exception {
        message: String,
        value: Option<Arc<Reference>>,
    },
    /// A failure raised by host code.
    #[error("{message}")]
    Host { message: String },
    /// A programming error: closed scopes, double registration, mismatched
    /// async scopes and the like.
    #[error("{0}")]
    Usage(String),
}

impl Error {
    pub fn engine(status: Status) -> Self {
        Error::Engine {
            status,
            message: status.message().to_string(),
        }
    }

    pub fn host(message: impl Into<String>) -> Self {
        Error::Host {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    pub fn status(&self) -> Status {
        match self {
            Error::Engine { status, .. } => *status,
            Error::Exception { .. } => Status::PendingException,
            Error::Host { .. } => Status::GenericFailure,
            Error::Usage(_) => Status::InvalidArg,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::Engine { message, .. }
            | Error::Exception { message, .. }
            | Error::Host { message } => message,
            Error::Usage(message) => message,
        }
    }

    /// The `code` property given to script errors created from this error.
    pub(crate) fn code(&self) -> Option<String> {
        match self {
            Error::Engine { status, .. } => Some(format!("{status:?}")),
            Error::Usage(_) => Some("ERR_USAGE".to_string()),
            Error::Exception { .. } | Error::Host { .. } => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Engine { status, message } => f
                .debug_struct("Engine")
                .field("status", status)
                .field("message", message)
                .finish(),
            Error::Exception { message, value } => f
                .debug_struct("Exception")
                .field("message", message)
                .field("has_value", &value.is_some())
                .finish(),
            Error::Host { message } => {
                f.debug_struct("Host").field("message", message).finish()
            }
            Error::Usage(message) => f.debug_tuple("Usage").field(message).finish(),
        }
    }
}

/// Logs and aborts the process. Reserved for states where continuing would
/// corrupt the engine, such as a failure while reading a failure.
#[cold]
pub fn fatal_error(location: &str, message: &str) -> ! {
    log::error!("FATAL ERROR: {location} {message}");
    eprintln!("FATAL ERROR: {location} {message}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_bare_message() {
        let error = Error::Exception {
            message: "boom".to_string(),
            value: None,
        };
        assert_eq!(error.to_string(), "boom");
        assert_eq!(error.status(), Status::PendingException);
    }

    #[test]
    fn engine_errors_carry_status_text() {
        let error = Error::engine(Status::ObjectExpected);
        assert_eq!(error.message(), "An object was expected");
        assert_eq!(error.code().as_deref(), Some("ObjectExpected"));
    }

    #[test]
    fn host_errors_map_to_generic_failure() {
        let error = Error::host("disk on fire");
        assert_eq!(error.status(), Status::GenericFailure);
        assert_eq!(error.code(), None);
    }
}
