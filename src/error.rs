//! Invocation failure taxonomy.
//!
//! Every stage of an invocation returns `Result<_, InvocationError>` and the
//! sequencer decides the next action from the error's classification rather
//! than from its concrete type. The classification also drives what gets
//! reported to listeners via [`FailureDescription`] and which process exit
//! code the invocation ends with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result type for invocation operations.
pub type InvocationResult<T> = Result<T, InvocationError>;

/// Errors that can abort an invocation stage.
///
/// Variants that originate on a specific device carry its serial so the
/// sequencer can target bugreport capture and recovery decisions at the
/// right device.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The build provider failed while fetching the build under test.
    #[error("build retrieval failed: {0}")]
    BuildRetrieval(String),

    /// A target preparer failed due to environment or device misconfiguration.
    #[error("target setup error: {message}")]
    TargetSetup {
        message: String,
        serial: Option<String>,
    },

    /// The build under test itself is broken (e.g. device failed to boot it).
    ///
    /// When `disable_recovery` is set, device recovery is turned off for the
    /// affected device so recovery attempts do not destroy diagnostics state.
    #[error("build error: {message}")]
    Build {
        message: String,
        serial: Option<String>,
        disable_recovery: bool,
    },

    /// A device stopped responding or disappeared.
    #[error("device {serial} unavailable: {message}")]
    DeviceUnavailable {
        message: String,
        serial: String,
        /// The device is unresponsive but still reports online; a best-effort
        /// bugreport may still be possible.
        unresponsive: bool,
    },

    /// The invocation was stopped by an operator request.
    #[error("invocation cancelled: {0}")]
    Cancelled(String),

    /// Transport, subprocess or other infrastructure fault.
    #[error("infra failure: {0}")]
    Infra(String),

    /// A bounded operation ran past its deadline.
    ///
    /// Kept distinct from [`InvocationError::Infra`] so callers can tell
    /// "ran too long" from "broke".
    #[error("timed out after {timeout:?}: {message}")]
    TimedOut { message: String, timeout: Duration },

    /// Unexpected runtime fault with no better classification.
    #[error("unclassified failure: {0}")]
    Unclassified(String),

    /// I/O error on the host.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InvocationError {
    /// Classification tag used for reporting and exit-code decisions.
    pub fn status(&self) -> FailureStatus {
        match self {
            InvocationError::BuildRetrieval(_) => FailureStatus::InfraFailure,
            InvocationError::TargetSetup { .. } => FailureStatus::InfraFailure,
            InvocationError::Build { .. } => FailureStatus::TestFailure,
            InvocationError::DeviceUnavailable { .. } => FailureStatus::Lost,
            InvocationError::Cancelled(_) => FailureStatus::Cancelled,
            InvocationError::Infra(_) => FailureStatus::InfraFailure,
            InvocationError::TimedOut { .. } => FailureStatus::TimedOut,
            InvocationError::Unclassified(_) => FailureStatus::Unset,
            InvocationError::Io(_) => FailureStatus::InfraFailure,
        }
    }

    /// Serial of the device this failure originated on, if any.
    pub fn serial(&self) -> Option<&str> {
        match self {
            InvocationError::TargetSetup { serial, .. } => serial.as_deref(),
            InvocationError::Build { serial, .. } => serial.as_deref(),
            InvocationError::DeviceUnavailable { serial, .. } => Some(serial),
            _ => None,
        }
    }

    /// Builds the listener-facing description for this failure.
    pub fn describe(&self) -> FailureDescription {
        FailureDescription {
            message: self.to_string(),
            status: self.status(),
            origin_serial: self.serial().map(String::from),
        }
    }
}

/// Coarse failure classification reported with every invocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    /// The test content itself failed (including broken build-under-test).
    TestFailure,
    /// Harness-side fault: transport, subprocess, setup, build fetch.
    InfraFailure,
    /// A device was lost during the invocation.
    Lost,
    /// Stopped by operator request.
    Cancelled,
    /// A bounded operation exceeded its deadline.
    TimedOut,
    /// No classification was possible.
    Unset,
}

/// What gets handed to `invocation_failed` / `test_run_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescription {
    pub message: String,
    pub status: FailureStatus,
    /// Serial of the device the failure is attached to, when known.
    pub origin_serial: Option<String>,
}

impl FailureDescription {
    pub fn new(message: impl Into<String>, status: FailureStatus) -> Self {
        Self {
            message: message.into(),
            status,
            origin_serial: None,
        }
    }

    pub fn with_origin(mut self, serial: impl Into<String>) -> Self {
        self.origin_serial = Some(serial.into());
        self
    }
}

/// Process exit code of one invocation, mirrored to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    NoError = 0,
    NoBuild = 1,
    DeviceUnavailable = 2,
    Fatal = 3,
}

impl ExitCode {
    /// Maps a terminal invocation error to its exit code.
    pub fn from_error(error: &InvocationError) -> Self {
        match error {
            InvocationError::BuildRetrieval(_) => ExitCode::NoBuild,
            InvocationError::DeviceUnavailable { .. } => ExitCode::DeviceUnavailable,
            _ => ExitCode::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_not_an_infra_failure() {
        let err = InvocationError::TimedOut {
            message: "worker".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.status(), FailureStatus::TimedOut);
        assert_ne!(err.status(), FailureStatus::InfraFailure);
    }

    #[test]
    fn failure_description_carries_origin_serial() {
        let err = InvocationError::DeviceUnavailable {
            message: "offline".into(),
            serial: "SER123".into(),
            unresponsive: false,
        };
        let desc = err.describe();
        assert_eq!(desc.origin_serial.as_deref(), Some("SER123"));
        assert_eq!(desc.status, FailureStatus::Lost);
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(
            ExitCode::from_error(&InvocationError::BuildRetrieval("gone".into())),
            ExitCode::NoBuild
        );
        assert_eq!(
            ExitCode::from_error(&InvocationError::DeviceUnavailable {
                message: "x".into(),
                serial: "s".into(),
                unresponsive: true,
            }),
            ExitCode::DeviceUnavailable
        );
    }
}
