//! Classified step failures.
//!
//! Step actions report failures through [`StepError`]. The variant decides
//! how the runner treats the failure: most kinds only fail the step, while
//! [`StepErrorKind::TestUsage`] and [`StepErrorKind::Cancelled`] abort the run.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failure raised by a step action or by the machinery around it.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StepError {
    /// A semantic assertion was violated.
    #[error("test failed: {0}")]
    TestFailed(String),
    /// A device refused a command or returned a non-zero status.
    #[error("device command failed: {0}")]
    DeviceCmd(String),
    /// Inputs handed to the action were mis-shaped.
    #[error("device configuration error: {0}")]
    DeviceConfig(String),
    /// Lower-level device misbehaviour.
    #[error("device error: {0}")]
    Device(String),
    /// The test or its arguments are wrong.
    #[error("test usage error: {0}")]
    TestUsage(String),
    /// Anything the action did not classify.
    #[error("unexpected error: {0}")]
    Unexpected(String),
    /// The run was cancelled while the step was in flight.
    #[error("cancelled")]
    Cancelled,
    /// The step ran out of time before or while running its action.
    #[error("step deadline exceeded after {}s", limit.as_secs())]
    DeadlineExceeded {
        /// Budget that was granted to the step.
        limit: Duration,
    },
}

/// Discriminant of [`StepError`], used for classification and reporting.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StepErrorKind {
    /// See [`StepError::TestFailed`].
    TestFailed,
    /// See [`StepError::DeviceCmd`].
    DeviceCmd,
    /// See [`StepError::DeviceConfig`].
    DeviceConfig,
    /// See [`StepError::Device`].
    Device,
    /// See [`StepError::TestUsage`].
    TestUsage,
    /// See [`StepError::Unexpected`].
    Unexpected,
    /// See [`StepError::Cancelled`].
    Cancelled,
    /// See [`StepError::DeadlineExceeded`].
    DeadlineExceeded,
}

impl StepErrorKind {
    /// Stable identifier used in logs and tags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TestFailed => "testFailed",
            Self::DeviceCmd => "deviceCmdError",
            Self::DeviceConfig => "deviceConfigError",
            Self::Device => "deviceError",
            Self::TestUsage => "testUsageError",
            Self::Unexpected => "unexpected",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "stepDeadlineExceeded",
        }
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StepError {
    /// Builds a [`StepError::TestFailed`].
    pub fn test_failed(message: impl Into<String>) -> Self {
        Self::TestFailed(message.into())
    }

    /// Builds a [`StepError::DeviceCmd`].
    pub fn device_cmd(message: impl Into<String>) -> Self {
        Self::DeviceCmd(message.into())
    }

    /// Builds a [`StepError::DeviceConfig`].
    pub fn device_config(message: impl Into<String>) -> Self {
        Self::DeviceConfig(message.into())
    }

    /// Builds a [`StepError::TestUsage`].
    pub fn usage(message: impl Into<String>) -> Self {
        Self::TestUsage(message.into())
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> StepErrorKind {
        match self {
            Self::TestFailed(_) => StepErrorKind::TestFailed,
            Self::DeviceCmd(_) => StepErrorKind::DeviceCmd,
            Self::DeviceConfig(_) => StepErrorKind::DeviceConfig,
            Self::Device(_) => StepErrorKind::Device,
            Self::TestUsage(_) => StepErrorKind::TestUsage,
            Self::Unexpected(_) => StepErrorKind::Unexpected,
            Self::Cancelled => StepErrorKind::Cancelled,
            Self::DeadlineExceeded { .. } => StepErrorKind::DeadlineExceeded,
        }
    }

    /// Returns `true` when the failure must stop the run regardless of
    /// `continue_on_failure`.
    #[must_use]
    pub const fn aborts_run(&self) -> bool {
        matches!(self, Self::TestUsage(_) | Self::Cancelled)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(value: serde_json::Error) -> Self {
        Self::DeviceConfig(value.to_string())
    }
}

impl From<std::io::Error> for StepError {
    fn from(value: std::io::Error) -> Self {
        Self::Unexpected(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_usage_and_cancel_abort_the_run() {
        assert!(StepError::usage("bad").aborts_run());
        assert!(StepError::Cancelled.aborts_run());
        assert!(!StepError::test_failed("ping").aborts_run());
        assert!(!StepError::device_cmd("exit 1").aborts_run());
        assert!(!StepError::DeadlineExceeded { limit: Duration::from_secs(1) }.aborts_run());
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(StepError::device_config("x").kind().as_str(), "deviceConfigError");
        assert_eq!(
            StepError::DeadlineExceeded { limit: Duration::ZERO }.kind().to_string(),
            "stepDeadlineExceeded"
        );
    }
}
