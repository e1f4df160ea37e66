use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use anyhow::{anyhow, Result};
use shared::domain::PatchConfig;
use thiserror::Error;

use crate::log_sink::PatchLogger;

/// The external patch engine. Runs synchronously on the caller's thread and
/// may take a long time; the session runs it on a blocking worker.
pub trait PatchEngine: Send + Sync {
    fn patch(&self, logger: &dyn PatchLogger, config: &PatchConfig) -> Result<()>;
}

pub struct MissingPatchEngine;

impl PatchEngine for MissingPatchEngine {
    fn patch(&self, _logger: &dyn PatchLogger, config: &PatchConfig) -> Result<()> {
        Err(anyhow!(
            "patch engine is unavailable; cannot patch {}",
            config.target_app.package_name
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub message: String,
    pub trace: String,
}

impl EngineFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            trace: format!("{err:?}"),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "patch engine panicked".to_string()
        };
        Self {
            trace: format!("panic: {message}"),
            message,
        }
    }

    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        match err.try_into_panic() {
            Ok(payload) => Self::from_panic(payload),
            Err(err) => Self {
                message: "patch worker was cancelled".to_string(),
                trace: err.to_string(),
            },
        }
    }
}

/// Runs the engine and turns every way it can fail, panics included, into an
/// [`EngineFailure`].
pub fn invoke_engine(
    engine: &dyn PatchEngine,
    logger: &dyn PatchLogger,
    config: &PatchConfig,
) -> std::result::Result<(), EngineFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| engine.patch(logger, config))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(EngineFailure::from_error(&err)),
        Err(payload) => Err(EngineFailure::from_panic(payload)),
    }
}
