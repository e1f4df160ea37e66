use thiserror::Error;

use crate::{domain::PackageName, session::Phase};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid signature bypass level {0}; expected 0, 1 or 2")]
    InvalidSigBypassLevel(u8),
    #[error("target app has no package name")]
    MissingPackageName,
    #[error("no input APKs selected for {0}")]
    NoInputApks(PackageName),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} is not allowed while the session is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
    #[error("invalid patch configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to stage input APKs: {0}")]
    Staging(String),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("install is not allowed while the session is {phase:?}")]
    InvalidPhase { phase: Phase },
    #[error("install service is unavailable; grant the privileged service permission and retry")]
    ServiceUnavailable,
    #[error("an install or uninstall is already in progress")]
    AlreadyRunning,
    #[error("no patched APKs found in {0}")]
    NoOutputs(String),
}
