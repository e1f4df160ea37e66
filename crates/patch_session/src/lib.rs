use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use shared::{
    domain::{AppSource, PackageName, PatchConfig, TargetApp},
    error::{InstallError, SessionError},
    session::{InstallResult, Phase},
};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod bridge;
pub mod engine;
pub mod installer;
pub mod log_sink;
pub mod manifest;
pub mod process_engine;
pub mod scratch;

pub use bridge::{ObserverRegistry, SessionSnapshot, Subscription};
pub use engine::{invoke_engine, EngineFailure, MissingPatchEngine, PatchEngine};
pub use installer::{
    AppInventory, FixedConfirmation, InstallCoordinator, InstallService, UninstallConfirmation,
};
pub use log_sink::{LogFollower, LogSink, PatchLogger};
pub use manifest::{read_apk_manifest, ApkManifest, ManifestError};
pub use process_engine::CommandPatchEngine;
pub use scratch::{ScratchDir, ScratchGuard};

/// Everything a session needs from its host: where inputs are staged, where
/// the engine writes patched APKs, log verbosity and the runtime that runs
/// background work.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub scratch: ScratchDir,
    pub output_dir: PathBuf,
    pub verbose: bool,
    pub runtime: Handle,
}

impl SessionContext {
    /// Uses the runtime of the calling task.
    pub fn new(scratch_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self::with_runtime(scratch_root, output_dir, Handle::current())
    }

    pub fn with_runtime(
        scratch_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        runtime: Handle,
    ) -> Self {
        Self {
            scratch: ScratchDir::new(scratch_root),
            output_dir: output_dir.into(),
            verbose: false,
            runtime,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Patched APKs currently in the output directory, sorted by path.
    pub fn patched_outputs(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.output_dir).with_context(|| {
            format!(
                "failed to read output directory '{}'",
                self.output_dir.display()
            )
        })?;
        let mut apks = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && has_apk_extension(&path) {
                apks.push(path);
            }
        }
        apks.sort();
        Ok(apks)
    }
}

fn has_apk_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("apk"))
        .unwrap_or(false)
}

struct SessionState {
    session_id: Uuid,
    generation: u64,
    phase: Phase,
    config: Option<PatchConfig>,
    logs: Arc<LogSink>,
    install: Option<InstallResult>,
    in_flight: Option<Uuid>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            phase: self.phase,
            config: self.config.clone(),
            log_lines: self.logs.lines(),
            install: self.install.clone(),
        }
    }
}

/// Drives one patch job from app selection to a terminal phase and an
/// optional install. The controller is the only writer of session state.
pub struct PatchSession {
    context: SessionContext,
    engine: Arc<dyn PatchEngine>,
    installer: InstallCoordinator,
    state: Mutex<SessionState>,
    observers: Arc<ObserverRegistry>,
}

impl PatchSession {
    pub fn new(
        context: SessionContext,
        engine: Arc<dyn PatchEngine>,
        installer: InstallCoordinator,
    ) -> Result<Arc<Self>> {
        context.scratch.prepare()?;
        let removed = context.scratch.clear().with_context(|| {
            format!(
                "failed to clear scratch directory '{}'",
                context.scratch.root().display()
            )
        })?;
        if removed > 0 {
            debug!(removed, "session: cleared stale scratch entries");
        }

        let session_id = Uuid::new_v4();
        let logs = Arc::new(LogSink::new(context.verbose));
        Ok(Arc::new(Self {
            engine,
            installer,
            state: Mutex::new(SessionState {
                session_id,
                generation: 0,
                phase: Phase::Selecting,
                config: None,
                logs,
                install: None,
                in_flight: None,
            }),
            observers: ObserverRegistry::new(SessionSnapshot::selecting(session_id)),
            context,
        }))
    }

    pub fn without_engine(context: SessionContext) -> Result<Arc<Self>> {
        Self::new(
            context,
            Arc::new(MissingPatchEngine),
            InstallCoordinator::unavailable(),
        )
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the snapshot while `state` is still locked, so the registry
    /// sees changes in the order they were made, then notifies observers
    /// with the lock released.
    fn publish(&self, state: MutexGuard<'_, SessionState>) {
        self.observers.store(state.snapshot());
        drop(state);
        self.observers.deliver();
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn session_id(&self) -> Uuid {
        self.state().session_id
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn config(&self) -> Option<PatchConfig> {
        self.state().config.clone()
    }

    pub fn logs(&self) -> Arc<LogSink> {
        Arc::clone(&self.state().logs)
    }

    pub fn install_result(&self) -> Option<InstallResult> {
        self.state().install.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state().snapshot()
    }

    /// Back navigation is blocked while the engine runs; leaving would not
    /// stop it.
    pub fn can_navigate_back(&self) -> bool {
        self.phase() != Phase::Patching
    }

    /// Full log text for copying, available once a run has failed.
    pub fn error_report(&self) -> Option<String> {
        let state = self.state();
        (state.phase == Phase::Error).then(|| state.logs.render())
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.observers.watch()
    }

    pub fn stream(&self) -> WatchStream<SessionSnapshot> {
        self.observers.stream()
    }

    pub fn installer(&self) -> &InstallCoordinator {
        &self.installer
    }

    pub fn configure_patch(&self, app: TargetApp) -> Result<(), SessionError> {
        let mut state = self.state();
        if state.phase != Phase::Selecting {
            return Err(SessionError::InvalidPhase {
                operation: "configure_patch",
                phase: state.phase,
            });
        }
        info!(
            session_id = %state.session_id,
            package = %app.package_name,
            "session: configuring patch"
        );
        state.config = Some(PatchConfig::for_target(app));
        state.phase = Phase::Configuring;
        self.publish(state);
        Ok(())
    }

    /// Stages APKs picked from storage into the session scratch directory and
    /// configures the session with the staged copies.
    pub fn select_from_storage(
        &self,
        apk_paths: &[PathBuf],
        package_name: PackageName,
        label: impl Into<String>,
    ) -> Result<(), SessionError> {
        let session_id = {
            let state = self.state();
            if state.phase != Phase::Selecting {
                return Err(SessionError::InvalidPhase {
                    operation: "select_from_storage",
                    phase: state.phase,
                });
            }
            state.session_id
        };

        let staged = self
            .context
            .scratch
            .stage(session_id, apk_paths)
            .map_err(|err| SessionError::Staging(format!("{err:#}")))?;

        let app = TargetApp {
            package_name,
            label: label.into(),
            apk_paths: staged,
            source: AppSource::Storage,
        };
        self.configure_patch(app).inspect_err(|_| {
            if let Err(err) = self.context.scratch.clear_session(session_id) {
                warn!(%session_id, %err, "session: failed to drop staged inputs");
            }
        })
    }

    /// Edits the option set. Only allowed while configuring; options are
    /// frozen once patching starts.
    pub fn update_config<F>(&self, edit: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut PatchConfig),
    {
        let mut state = self.state();
        let phase = state.phase;
        match (phase, state.config.as_mut()) {
            (Phase::Configuring, Some(config)) => edit(config),
            _ => {
                return Err(SessionError::InvalidPhase {
                    operation: "update_config",
                    phase,
                })
            }
        }
        self.publish(state);
        Ok(())
    }

    /// Freezes the configuration, enters `Patching` and runs the engine on a
    /// blocking worker. The returned handle resolves to the terminal phase
    /// (or to the current phase if the session was reset meanwhile).
    pub fn submit_patch(self: &Arc<Self>) -> Result<JoinHandle<Phase>, SessionError> {
        let (generation, session_id, config, logs) = {
            let mut state = self.state();
            if state.phase != Phase::Configuring {
                return Err(SessionError::InvalidPhase {
                    operation: "submit_patch",
                    phase: state.phase,
                });
            }
            let config = match state.config.clone() {
                Some(config) => config,
                None => {
                    return Err(SessionError::InvalidPhase {
                        operation: "submit_patch",
                        phase: state.phase,
                    })
                }
            };
            config.validate()?;

            state.phase = Phase::Patching;
            state.in_flight = Some(state.session_id);
            state.logs.open();
            info!(
                session_id = %state.session_id,
                package = %config.target_app.package_name,
                signatures = %config.signature_label(),
                sig_bypass = config.sig_bypass_level.as_u8(),
                manager_mode = config.use_manager_mode,
                "session: patching started"
            );
            let run = (
                state.generation,
                state.session_id,
                config,
                Arc::clone(&state.logs),
            );
            self.publish(state);
            run
        };

        let guard = ScratchGuard::new(self.context.scratch.clone(), session_id);
        let session = Arc::clone(self);
        Ok(self.context.runtime.spawn(async move {
            let engine = Arc::clone(&session.engine);
            let worker_logs = Arc::clone(&logs);
            let outcome = tokio::task::spawn_blocking(move || {
                invoke_engine(engine.as_ref(), worker_logs.as_ref(), &config)
            })
            .await
            .unwrap_or_else(|err| Err(EngineFailure::from_join(err)));

            guard.release();
            session.complete_patch(generation, session_id, outcome)
        }))
    }

    fn complete_patch(
        &self,
        generation: u64,
        session_id: Uuid,
        outcome: Result<(), EngineFailure>,
    ) -> Phase {
        let mut state = self.state();
        if state.in_flight == Some(session_id) {
            state.in_flight = None;
        }
        if state.generation != generation {
            debug!(
                generation,
                current = state.generation,
                "session: discarded result of a detached run"
            );
            return state.phase;
        }

        match outcome {
            Ok(()) => {
                state.phase = Phase::Finished;
                info!(session_id = %state.session_id, "session: patching finished");
            }
            Err(failure) => {
                state.logs.error(&failure.message);
                state.logs.error(&failure.trace);
                state.phase = Phase::Error;
                error!(
                    session_id = %state.session_id,
                    error = %failure.message,
                    "session: patching failed"
                );
            }
        }
        state.logs.seal();
        let phase = state.phase;
        self.publish(state);
        phase
    }

    /// Returns to `Selecting` with a fresh session id, empty log and no
    /// configuration. A run still in flight keeps going detached; its result
    /// is discarded and its guard releases its own inputs.
    pub fn reset(&self) {
        let mut state = self.state();
        state.logs.seal();
        if state.phase == Phase::Patching {
            warn!(
                session_id = %state.session_id,
                "session: reset while patching; engine keeps running detached"
            );
        }

        let previous = state.session_id;
        state.generation += 1;
        state.session_id = Uuid::new_v4();
        state.phase = Phase::Selecting;
        state.config = None;
        state.install = None;
        state.logs = Arc::new(LogSink::new(self.context.verbose));

        let cleared = match state.in_flight {
            None => self.context.scratch.clear().map(|_| ()),
            Some(running) if running != previous => self.context.scratch.clear_session(previous),
            Some(_) => Ok(()),
        };
        if let Err(err) = cleared {
            warn!(%err, "session: failed to clear scratch directory on reset");
        }
        debug!(session_id = %state.session_id, "session: reset");
        self.publish(state);
    }

    /// Installs the patched outputs, uninstalling an unpatched copy first
    /// when `confirmation` agrees. Only valid once patching has finished.
    pub async fn install(
        &self,
        confirmation: &dyn UninstallConfirmation,
    ) -> Result<InstallResult, InstallError> {
        let (session_id, package) = {
            let state = self.state();
            match (state.phase, state.config.as_ref()) {
                (Phase::Finished, Some(config)) => {
                    (state.session_id, config.target_app.package_name.clone())
                }
                (phase, _) => return Err(InstallError::InvalidPhase { phase }),
            }
        };

        let apks = self
            .context
            .patched_outputs()
            .map_err(|err| InstallError::NoOutputs(format!("{err:#}")))?;
        if apks.is_empty() {
            return Err(InstallError::NoOutputs(
                self.context.output_dir.display().to_string(),
            ));
        }

        let result = self.installer.run(&package, &apks, confirmation).await?;

        let mut state = self.state();
        if state.session_id != session_id {
            debug!(%session_id, "session: install finished after reset");
            return Ok(result);
        }
        state.install = Some(result.clone());
        self.publish(state);
        Ok(result)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
