use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Selecting,
    Configuring,
    Patching,
    Finished,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finished | Phase::Error)
    }

    /// Forward edges of the session lifecycle. Returning to `Selecting` is a
    /// reset, not a transition, and is always allowed.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Selecting, Phase::Configuring)
                | (Phase::Configuring, Phase::Patching)
                | (Phase::Patching, Phase::Finished)
                | (Phase::Patching, Phase::Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Failure codes follow the package installer's status numbering.
pub const STATUS_FAILURE: i32 = 1;
pub const STATUS_FAILURE_BLOCKED: i32 = 2;
pub const STATUS_FAILURE_ABORTED: i32 = 3;
pub const STATUS_FAILURE_INVALID: i32 = 4;
pub const STATUS_FAILURE_CONFLICT: i32 = 5;
pub const STATUS_FAILURE_STORAGE: i32 = 6;
pub const STATUS_FAILURE_INCOMPATIBLE: i32 = 7;

pub const USER_CANCELLED_MESSAGE: &str = "User cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstallStatus {
    Success,
    Failure { code: i32 },
    UserCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub status: InstallStatus,
    pub message: Option<String>,
}

impl InstallResult {
    pub fn success(message: Option<String>) -> Self {
        Self {
            status: InstallStatus::Success,
            message,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            status: InstallStatus::Failure { code },
            message: Some(message.into()),
        }
    }

    pub fn user_cancelled() -> Self {
        Self {
            status: InstallStatus::UserCancelled,
            message: Some(USER_CANCELLED_MESSAGE.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InstallStatus::Success
    }

    /// Cancellation is neither success nor something to surface as an error.
    pub fn is_reportable_failure(&self) -> bool {
        matches!(self.status, InstallStatus::Failure { .. })
    }

    /// Text offered for copying when a failure is reported.
    pub fn diagnostics(&self) -> Option<&str> {
        if self.is_reportable_failure() {
            self.message.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    Idle,
    Uninstalling,
    Installing,
    Done,
}
