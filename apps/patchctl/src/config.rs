use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "patchctl.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub patcher_program: PathBuf,
    pub patcher_args: Vec<String>,
    pub adb_program: PathBuf,
    pub device_serial: Option<String>,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scratch_dir: env::temp_dir().join("patchctl").join("scratch"),
            output_dir: PathBuf::from("./patched"),
            patcher_program: PathBuf::from("java"),
            patcher_args: vec!["-jar".into(), "lspatch.jar".into()],
            adb_program: PathBuf::from("adb"),
            device_serial: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    scratch_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    patcher_program: Option<PathBuf>,
    patcher_args: Option<Vec<String>>,
    adb_program: Option<PathBuf>,
    device_serial: Option<String>,
    verbose: Option<bool>,
}

/// Defaults, then the settings file (if present), then `PATCHCTL_*`
/// environment variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    load_settings_with(path, |key| env::var(key).ok())
}

pub(crate) fn load_settings_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_SETTINGS_FILE), false),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    }

    if let Some(v) = lookup("PATCHCTL_SCRATCH_DIR") {
        settings.scratch_dir = v.into();
    }
    if let Some(v) = lookup("PATCHCTL_OUTPUT_DIR") {
        settings.output_dir = v.into();
    }
    if let Some(v) = lookup("PATCHCTL_PATCHER") {
        settings.patcher_program = v.into();
    }
    if let Some(v) = lookup("PATCHCTL_PATCHER_ARGS") {
        settings.patcher_args = v.split_whitespace().map(str::to_string).collect();
    }
    if let Some(v) = lookup("PATCHCTL_ADB") {
        settings.adb_program = v.into();
    }
    if let Some(v) = lookup("ANDROID_SERIAL") {
        settings.device_serial = Some(v);
    }
    if let Some(v) = lookup("PATCHCTL_SERIAL") {
        settings.device_serial = Some(v);
    }
    if let Some(v) = lookup("PATCHCTL_VERBOSE") {
        settings.verbose = matches!(v.trim(), "1" | "true" | "yes");
    }

    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.scratch_dir {
        settings.scratch_dir = v;
    }
    if let Some(v) = file_cfg.output_dir {
        settings.output_dir = v;
    }
    if let Some(v) = file_cfg.patcher_program {
        settings.patcher_program = v;
    }
    if let Some(v) = file_cfg.patcher_args {
        settings.patcher_args = v;
    }
    if let Some(v) = file_cfg.adb_program {
        settings.adb_program = v;
    }
    if file_cfg.device_serial.is_some() {
        settings.device_serial = file_cfg.device_serial;
    }
    if let Some(v) = file_cfg.verbose {
        settings.verbose = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
