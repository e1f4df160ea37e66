//! Uninstall-then-install sequencing for a patched package.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::PackageName,
    error::InstallError,
    session::{InstallResult, InstallStage, STATUS_FAILURE},
};
use tokio::sync::watch;
use tracing::{info, warn};

/// Privileged package installer (for example a shell-level service).
#[async_trait]
pub trait InstallService: Send + Sync {
    fn is_available(&self) -> bool;
    async fn install(&self, apks: &[PathBuf]) -> InstallResult;
    async fn uninstall(&self, package: &PackageName) -> InstallResult;
}

#[async_trait]
pub trait AppInventory: Send + Sync {
    async fn fetch_app_list(&self) -> Result<()>;
    /// True when the package is installed with its original signature, so
    /// a patched build cannot be installed over it.
    async fn is_package_installed_without_patch(&self, package: &PackageName) -> bool;
}

#[async_trait]
pub trait UninstallConfirmation: Send + Sync {
    async fn confirm_uninstall(&self, package: &PackageName) -> bool;
}

pub struct MissingInstallService;

#[async_trait]
impl InstallService for MissingInstallService {
    fn is_available(&self) -> bool {
        false
    }

    async fn install(&self, _apks: &[PathBuf]) -> InstallResult {
        InstallResult::failure(STATUS_FAILURE, "install service is unavailable")
    }

    async fn uninstall(&self, package: &PackageName) -> InstallResult {
        InstallResult::failure(
            STATUS_FAILURE,
            format!("install service is unavailable; cannot uninstall {package}"),
        )
    }
}

pub struct MissingAppInventory;

#[async_trait]
impl AppInventory for MissingAppInventory {
    async fn fetch_app_list(&self) -> Result<()> {
        Ok(())
    }

    async fn is_package_installed_without_patch(&self, _package: &PackageName) -> bool {
        false
    }
}

/// Answers every confirmation the same way (`--yes`, scripted callers).
pub struct FixedConfirmation(pub bool);

#[async_trait]
impl UninstallConfirmation for FixedConfirmation {
    async fn confirm_uninstall(&self, _package: &PackageName) -> bool {
        self.0
    }
}

struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct InstallCoordinator {
    service: Arc<dyn InstallService>,
    inventory: Arc<dyn AppInventory>,
    stage: watch::Sender<InstallStage>,
    busy: AtomicBool,
}

impl InstallCoordinator {
    pub fn new(service: Arc<dyn InstallService>, inventory: Arc<dyn AppInventory>) -> Self {
        let (stage, _) = watch::channel(InstallStage::Idle);
        Self {
            service,
            inventory,
            stage,
            busy: AtomicBool::new(false),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(Arc::new(MissingInstallService), Arc::new(MissingAppInventory))
    }

    pub fn is_available(&self) -> bool {
        self.service.is_available()
    }

    pub fn inventory(&self) -> &Arc<dyn AppInventory> {
        &self.inventory
    }

    pub fn stage(&self) -> InstallStage {
        *self.stage.borrow()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<InstallStage> {
        self.stage.subscribe()
    }

    /// Installs `apks` for `package`, uninstalling an unpatched copy first
    /// when the user confirms. The inventory is refreshed whatever the
    /// outcome.
    pub async fn run(
        &self,
        package: &PackageName,
        apks: &[PathBuf],
        confirmation: &dyn UninstallConfirmation,
    ) -> std::result::Result<InstallResult, InstallError> {
        if !self.service.is_available() {
            return Err(InstallError::ServiceUnavailable);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(InstallError::AlreadyRunning);
        }
        let _busy = BusyFlag(&self.busy);

        self.stage.send_replace(InstallStage::Idle);
        let result = self.sequence(package, apks, confirmation).await;
        self.stage.send_replace(InstallStage::Done);

        if let Err(err) = self.inventory.fetch_app_list().await {
            warn!(%package, error = %err, "install: failed to refresh app list");
        }

        info!(
            %package,
            status = ?result.status,
            message = result.message.as_deref().unwrap_or_default(),
            "install: finished"
        );
        Ok(result)
    }

    async fn sequence(
        &self,
        package: &PackageName,
        apks: &[PathBuf],
        confirmation: &dyn UninstallConfirmation,
    ) -> InstallResult {
        if self.inventory.is_package_installed_without_patch(package).await {
            if !confirmation.confirm_uninstall(package).await {
                info!(%package, "install: user cancelled uninstall");
                return InstallResult::user_cancelled();
            }

            self.stage.send_replace(InstallStage::Uninstalling);
            info!(%package, "install: uninstalling unpatched app");
            let uninstalled = self.service.uninstall(package).await;
            if !uninstalled.is_success() {
                warn!(%package, status = ?uninstalled.status, "install: uninstall failed");
                return uninstalled;
            }
        }

        self.stage.send_replace(InstallStage::Installing);
        info!(%package, apks = apks.len(), "install: installing patched app");
        self.service.install(apks).await
    }
}

#[cfg(test)]
#[path = "tests/installer_tests.rs"]
mod tests;
