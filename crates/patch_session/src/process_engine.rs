//! Patch engine backed by an external patcher command (for example
//! `java -jar lspatch.jar`). Output is streamed into the session log.

use std::{
    ffi::OsString,
    fs,
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
};

use anyhow::{bail, Context, Result};
use shared::domain::{PatchConfig, SignatureScheme};
use tracing::{debug, warn};

use crate::{engine::PatchEngine, log_sink::PatchLogger};

pub struct CommandPatchEngine {
    program: PathBuf,
    base_args: Vec<String>,
    output_dir: PathBuf,
    verbose: bool,
}

impl CommandPatchEngine {
    pub fn new(program: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            output_dir: output_dir.into(),
            verbose: false,
        }
    }

    pub fn with_base_args(mut self, base_args: Vec<String>) -> Self {
        self.base_args = base_args;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn command_args(&self, config: &PatchConfig) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        args.extend(
            config
                .target_app
                .apk_paths
                .iter()
                .map(|path| path.as_os_str().to_os_string()),
        );
        args.push("-o".into());
        args.push(self.output_dir.as_os_str().to_os_string());
        args.push("-f".into());
        args.push("-l".into());
        args.push(config.sig_bypass_level.as_u8().to_string().into());
        args.push("--v1".into());
        args.push(config.signs_with(SignatureScheme::V1).to_string().into());
        args.push("--v2".into());
        args.push(config.signs_with(SignatureScheme::V2).to_string().into());
        if config.debuggable {
            args.push("-d".into());
        }
        if config.override_version_code {
            args.push("-r".into());
        }
        if config.use_manager_mode {
            args.push("--manager".into());
        } else {
            for module in config.effective_modules() {
                args.push("-m".into());
                args.push(module.apk_path.as_os_str().to_os_string());
            }
        }
        if self.verbose {
            args.push("-v".into());
        }
        args
    }
}

fn forward_lines(reader: impl Read, mut emit: impl FnMut(&str)) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => emit(line.trim_end()),
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "patcher: stopped reading output");
                break;
            }
        }
    }
}

impl PatchEngine for CommandPatchEngine {
    fn patch(&self, logger: &dyn PatchLogger, config: &PatchConfig) -> Result<()> {
        if config.use_manager_mode && !config.embedded_modules.is_empty() {
            warn!(
                modules = config.embedded_modules.len(),
                "patcher: embedded modules are ignored in manager mode"
            );
        }

        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "failed to create output directory '{}'",
                self.output_dir.display()
            )
        })?;

        let args = self.command_args(config);
        debug!(program = %self.program.display(), ?args, "patcher: spawning");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start patcher '{}'", self.program.display()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        thread::scope(|scope| {
            if let Some(stderr) = stderr {
                scope.spawn(move || forward_lines(stderr, |line| logger.error(line)));
            }
            if let Some(stdout) = stdout {
                forward_lines(stdout, |line| logger.info(line));
            }
        });

        let status = child.wait().context("failed to wait for patcher")?;
        if !status.success() {
            bail!("patcher exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/process_engine_tests.rs"]
mod tests;
