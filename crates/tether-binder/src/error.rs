use thiserror::Error;

/// How a [`BinderError`] interacts with a masking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Communication or timeout class; swallowed when the `Handled` bit is set.
    Handleable,
    /// Not a communication failure; rerouted to the exception event when the
    /// `Unhandled` bit is set.
    Unhandled,
    /// Protocol violations and programming errors; never masked.
    Fatal,
}

#[derive(Debug, Error)]
pub enum BinderError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("communication failure: {reason}")]
    Communication { reason: String },

    #[error("the reliable binder is faulted")]
    Faulted,

    #[error("the reliable binder was aborted")]
    Aborted,

    #[error("the reliable binder is closed")]
    Closed,

    #[error("{object} cannot be used in the {state} state")]
    InvalidState { object: &'static str, state: String },

    #[error("the channel does not support {operation}")]
    Unsupported { operation: &'static str },

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("fatal error: {reason}")]
    Fatal { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BinderError {
    /// Builds a timeout error for `operation` that was given `timeout`.
    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        BinderError::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Transport failure with a free-form reason.
    pub fn communication(reason: impl Into<String>) -> Self {
        BinderError::Communication { reason: reason.into() }
    }

    /// `object` was used in a state that does not allow the call.
    pub fn invalid_state(object: &'static str, state: impl std::fmt::Debug) -> Self {
        BinderError::InvalidState {
            object,
            state: format!("{:?}", state),
        }
    }

    /// How masking and fault handling treat this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            BinderError::Timeout { .. }
            | BinderError::Communication { .. }
            | BinderError::Faulted
            | BinderError::Aborted
            | BinderError::Io(_) => ErrorClass::Handleable,
            BinderError::Closed
            | BinderError::InvalidState { .. }
            | BinderError::Unsupported { .. } => ErrorClass::Unhandled,
            BinderError::Protocol { .. } | BinderError::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    /// True for communication and timeout class failures.
    pub fn is_handleable(&self) -> bool {
        self.class() == ErrorClass::Handleable
    }

    /// True for deadline expiries.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BinderError::Timeout { .. })
    }
}

/// Result alias for binder operations.
pub type Result<T> = std::result::Result<T, BinderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_message() {
        let err = BinderError::timeout("send", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "send timed out after 1500ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_communication_is_handleable() {
        assert!(BinderError::communication("reset").is_handleable());
        assert!(BinderError::Faulted.is_handleable());
        assert!(BinderError::Aborted.is_handleable());
        let io = BinderError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert!(io.is_handleable());
    }

    #[test]
    fn test_protocol_is_fatal() {
        let err = BinderError::Protocol {
            reason: "bad sequence number".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_handleable());
    }

    #[test]
    fn test_closed_is_unhandled() {
        assert_eq!(BinderError::Closed.class(), ErrorClass::Unhandled);
        assert_eq!(
            BinderError::invalid_state("binder", "Opening").class(),
            ErrorClass::Unhandled
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let err = BinderError::invalid_state("ReliableBinder", "Created");
        assert!(err.to_string().contains("Created"));
    }
}
