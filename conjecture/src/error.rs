//! Error types for test-case execution, choice-tree replay and runner failures.

use std::fmt;

use crate::config::ConfigError;

/// Signal returned by every draw and mark call on a [`ConjectureData`].
///
/// Test functions propagate it with `?`. The runner consumes it at the
/// boundary of the attempt it belongs to, so it never reaches the end user.
///
/// [`ConjectureData`]: crate::data::ConjectureData
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The attempt concluded early (overrun, invalid or interesting).
    StopTest { testcounter: u64 },

    /// A draw or mark was attempted on data that is already frozen.
    Frozen,

    /// Replay disagreed with what the choice tree recorded for the same prefix.
    Flaky(String),

    /// A data call received arguments it cannot honour, such as a repeated
    /// target label.
    InvalidArgument(String),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::StopTest { testcounter } => {
                write!(f, "Test case {} stopped", testcounter)
            }
            DataError::Frozen => write!(f, "Cannot modify frozen data"),
            DataError::Flaky(message) => write!(f, "Inconsistent generation: {}", message),
            DataError::InvalidArgument(message) => write!(f, "Invalid argument: {}", message),
        }
    }
}

impl std::error::Error for DataError {}

/// Result type of every draw primitive.
pub type DrawResult<T> = Result<T, DataError>;

/// Errors surfaced to the caller of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ConjectureError {
    /// The same buffer produced different draws or a different outcome.
    Flaky { message: String },

    /// A draw helper or data call received arguments it cannot honour
    InvalidArgument { message: String },

    /// The test function drew from or marked data after it was frozen
    Frozen,

    /// An engine invariant was broken. This is a bug in the engine, not the test.
    Internal { message: String },

    /// Runner settings failed validation
    Config(ConfigError),
}

impl ConjectureError {
    /// Create a flaky error
    pub fn flaky(message: impl Into<String>) -> Self {
        Self::Flaky {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error reports inconsistent behaviour of the test function
    pub fn is_flaky(&self) -> bool {
        matches!(self, ConjectureError::Flaky { .. })
    }
}

impl fmt::Display for ConjectureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConjectureError::Flaky { message } => write!(f, "Flaky test: {}", message),
            ConjectureError::InvalidArgument { message } => {
                write!(f, "Invalid argument: {}", message)
            }
            ConjectureError::Frozen => write!(f, "Cannot modify frozen data"),
            ConjectureError::Internal { message } => write!(f, "Internal error: {}", message),
            ConjectureError::Config(err) => write!(f, "Configuration error: {}", err),
        }
    }
}

impl std::error::Error for ConjectureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConjectureError::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ConjectureError {
    fn from(err: ConfigError) -> Self {
        ConjectureError::Config(err)
    }
}

impl From<DataError> for ConjectureError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::StopTest { testcounter } => ConjectureError::internal(format!(
                "StopTest for test case {} escaped its attempt",
                testcounter
            )),
            DataError::Frozen => ConjectureError::Frozen,
            DataError::Flaky(message) => ConjectureError::flaky(message),
            DataError::InvalidArgument(message) => ConjectureError::invalid_argument(message),
        }
    }
}

/// Returned by choice-tree simulation when a buffer leaves recorded history.
///
/// Callers fall back to running the real test function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviouslyUnseenBehaviour;

impl fmt::Display for PreviouslyUnseenBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer leaves the recorded choice tree")
    }
}

impl std::error::Error for PreviouslyUnseenBehaviour {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_display() {
        let stop = DataError::StopTest { testcounter: 7 };
        assert_eq!(stop.to_string(), "Test case 7 stopped");

        let flaky = DataError::Flaky("expected 8 bits".to_string());
        assert!(flaky.to_string().contains("expected 8 bits"));
    }

    #[test]
    fn test_conjecture_error_helpers() {
        let err = ConjectureError::flaky("outcome changed");
        assert!(err.is_flaky());
        assert_eq!(err.to_string(), "Flaky test: outcome changed");

        let err = ConjectureError::invalid_argument("lower > upper");
        assert!(!err.is_flaky());
        assert!(err.to_string().contains("lower > upper"));
    }

    #[test]
    fn test_data_error_conversion() {
        let err: ConjectureError = DataError::Flaky("changed".to_string()).into();
        assert_eq!(err, ConjectureError::flaky("changed"));
        let err: ConjectureError = DataError::StopTest { testcounter: 3 }.into();
        assert!(matches!(err, ConjectureError::Internal { .. }));
        let err: ConjectureError = DataError::InvalidArgument("label".to_string()).into();
        assert_eq!(err, ConjectureError::invalid_argument("label"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: ConjectureError = ConfigError::InvalidMaxExamples(0).into();
        assert!(matches!(err, ConjectureError::Config(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
