//! `adb`-backed install service and app inventory.

use std::{
    collections::HashSet,
    ffi::OsString,
    path::PathBuf,
    process::Output,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use patch_session::{AppInventory, InstallService};
use shared::{
    domain::PackageName,
    session::{
        InstallResult, STATUS_FAILURE, STATUS_FAILURE_ABORTED, STATUS_FAILURE_BLOCKED,
        STATUS_FAILURE_CONFLICT, STATUS_FAILURE_INCOMPATIBLE, STATUS_FAILURE_INVALID,
        STATUS_FAILURE_STORAGE,
    },
};
use tokio::{process::Command, sync::RwLock};
use tracing::{debug, info, warn};

/// Text that marks an installed package as already patched in
/// `dumpsys package` output.
pub const DEFAULT_PATCH_MARKER: &str = "org.lsposed.lspatch";

pub struct AdbDevice {
    program: PathBuf,
    serial: Option<String>,
    patch_marker: String,
    connected: AtomicBool,
    installed: RwLock<Option<HashSet<PackageName>>>,
}

impl AdbDevice {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            serial: None,
            patch_marker: DEFAULT_PATCH_MARKER.to_string(),
            connected: AtomicBool::new(false),
            installed: RwLock::new(None),
        }
    }

    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_patch_marker(mut self, marker: impl Into<String>) -> Self {
        self.patch_marker = marker.into();
        self
    }

    async fn run<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let mut command = Command::new(&self.program);
        if let Some(serial) = &self.serial {
            command.arg("-s").arg(serial);
        }
        debug!(program = %self.program.display(), ?args, "adb: running");
        command
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to run '{}'", self.program.display()))
    }

    /// Verifies a device is attached and marks the install service available.
    pub async fn connect(&self) -> Result<()> {
        let output = self.run(["get-state"]).await?;
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || state != "device" {
            self.connected.store(false, Ordering::Release);
            bail!(
                "no device available: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        self.connected.store(true, Ordering::Release);
        info!(serial = ?self.serial, "adb: device connected");
        Ok(())
    }

    pub async fn list_packages(&self) -> Result<Vec<PackageName>> {
        let output = self.run(["shell", "pm", "list", "packages"]).await?;
        if !output.status.success() {
            bail!(
                "pm list packages failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_package_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn is_installed(&self, package: &PackageName) -> bool {
        if let Some(installed) = self.installed.read().await.as_ref() {
            return installed.contains(package);
        }
        if let Err(err) = self.fetch_app_list().await {
            warn!(%package, error = %err, "adb: package list unavailable");
            return false;
        }
        self.installed
            .read()
            .await
            .as_ref()
            .map(|installed| installed.contains(package))
            .unwrap_or(false)
    }

    async fn run_package_command<I, S>(&self, args: I) -> InstallResult
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        match self.run(args).await {
            Ok(output) => parse_package_command_output(
                output.status.success(),
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
            Err(err) => InstallResult::failure(STATUS_FAILURE, format!("{err:#}")),
        }
    }
}

#[async_trait]
impl InstallService for AdbDevice {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn install(&self, apks: &[PathBuf]) -> InstallResult {
        let mut args: Vec<OsString> = match apks {
            [_] => vec!["install".into(), "-r".into()],
            _ => vec!["install-multiple".into(), "-r".into()],
        };
        args.extend(apks.iter().map(|apk| apk.as_os_str().to_os_string()));
        self.run_package_command(args).await
    }

    async fn uninstall(&self, package: &PackageName) -> InstallResult {
        self.run_package_command(["uninstall", package.as_str()]).await
    }
}

#[async_trait]
impl AppInventory for AdbDevice {
    async fn fetch_app_list(&self) -> Result<()> {
        let packages = self.list_packages().await?;
        debug!(count = packages.len(), "adb: refreshed package list");
        *self.installed.write().await = Some(packages.into_iter().collect());
        Ok(())
    }

    async fn is_package_installed_without_patch(&self, package: &PackageName) -> bool {
        if !self.is_installed(package).await {
            return false;
        }
        match self
            .run(["shell", "dumpsys", "package", package.as_str()])
            .await
        {
            Ok(output) => !String::from_utf8_lossy(&output.stdout).contains(&self.patch_marker),
            Err(err) => {
                warn!(%package, error = %err, "adb: dumpsys failed; assuming unpatched copy");
                true
            }
        }
    }
}

pub fn parse_package_list(text: &str) -> Vec<PackageName> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(PackageName::new)
        .collect()
}

/// Maps `adb install`/`adb uninstall` output to an [`InstallResult`].
pub fn parse_package_command_output(exited_ok: bool, stdout: &str, stderr: &str) -> InstallResult {
    let combined = format!("{stdout}\n{stderr}");
    if combined.lines().any(|line| line.trim() == "Success") {
        return InstallResult::success(Some("Success".to_string()));
    }

    if let Some(reason) = failure_reason(&combined) {
        return InstallResult::failure(failure_code(reason), reason);
    }

    let detail = combined.trim();
    if exited_ok && detail.is_empty() {
        return InstallResult::success(None);
    }
    InstallResult::failure(
        STATUS_FAILURE,
        if detail.is_empty() {
            "adb exited with an error".to_string()
        } else {
            detail.to_string()
        },
    )
}

fn failure_reason(output: &str) -> Option<&str> {
    let start = output.find("Failure [")? + "Failure [".len();
    let rest = &output[start..];
    let end = rest.find(']').unwrap_or(rest.len());
    Some(rest[..end].trim())
}

pub fn failure_code(reason: &str) -> i32 {
    const CONFLICT: &[&str] = &[
        "ALREADY_EXISTS",
        "DUPLICATE_PACKAGE",
        "UPDATE_INCOMPATIBLE",
        "SHARED_USER_INCOMPATIBLE",
        "REPLACE_COULDNT_DELETE",
        "CONFLICTING_PROVIDER",
        "VERSION_DOWNGRADE",
    ];
    const INCOMPATIBLE: &[&str] = &[
        "OLDER_SDK",
        "NEWER_SDK",
        "CPU_ABI_INCOMPATIBLE",
        "NO_MATCHING_ABIS",
        "MISSING_FEATURE",
        "MISSING_SHARED_LIBRARY",
    ];
    const STORAGE: &[&str] = &["INSUFFICIENT_STORAGE", "MEDIA_UNAVAILABLE"];
    const BLOCKED: &[&str] = &["USER_RESTRICTED", "VERIFICATION_TIMEOUT"];
    const ABORTED: &[&str] = &["ABORTED", "VERIFICATION_FAILURE"];

    let matches_any = |keys: &[&str]| keys.iter().any(|key| reason.contains(key));
    if matches_any(CONFLICT) {
        STATUS_FAILURE_CONFLICT
    } else if matches_any(INCOMPATIBLE) {
        STATUS_FAILURE_INCOMPATIBLE
    } else if reason.starts_with("INSTALL_PARSE_FAILED")
        || reason.contains("INVALID_APK")
        || reason.contains("INVALID_URI")
    {
        STATUS_FAILURE_INVALID
    } else if matches_any(STORAGE) {
        STATUS_FAILURE_STORAGE
    } else if matches_any(BLOCKED) {
        STATUS_FAILURE_BLOCKED
    } else if matches_any(ABORTED) {
        STATUS_FAILURE_ABORTED
    } else {
        STATUS_FAILURE
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
