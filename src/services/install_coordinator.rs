use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::queries::StatusQueries;
use crate::errors::{Result, UpdaterError};
use crate::models::{PersistentStatus, UpdateStatus};
use crate::services::payload_locator::{self, PAYLOAD_BIN_PATH};
use crate::services::registry::Shared;
use crate::utils::file::{copy_with_progress, set_world_readable};

const COPY_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Phases reported by the streaming applier while a payload is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplierStatus {
    Idle,
    Downloading,
    Finalizing,
    UpdatedNeedReboot,
}

/// Callbacks from the streaming applier. Mirrors the capability contract:
/// phase/percent updates plus a separate completion error code, where zero
/// means success.
pub trait ApplierObserver: Send + Sync + 'static {
    fn on_status_update(&self, status: ApplierStatus, percent: f32);
    fn on_payload_application_complete(&self, error_code: i32);
}

/// Injected privileged capability that applies a raw payload read directly
/// at an offset inside the package.
pub trait PayloadApplier: Send + Sync {
    fn apply_payload(
        &self,
        file_uri: &str,
        offset: u64,
        header_lines: &[String],
        observer: Arc<dyn ApplierObserver>,
    ) -> Result<()>;
    /// Re-attach to an in-flight operation after a process restart. The
    /// applier replays its current status to the observer once attached.
    fn reconnect(&self, observer: Arc<dyn ApplierObserver>) -> Result<()>;
    fn cancel(&self) -> Result<()>;
    fn suspend(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
}

/// Injected one-shot installer for the legacy path. Completion is implicit:
/// the device reboots into recovery.
pub trait RecoveryInstaller: Send + Sync {
    fn install_package(&self, path: &Path) -> Result<()>;
}

/// Drives one install at a time, either streaming the payload through the
/// applier or staging the package for the recovery installer.
pub struct InstallCoordinator {
    shared: Arc<Shared>,
    applier: Arc<dyn PayloadApplier>,
    recovery: Arc<dyn RecoveryInstaller>,
    cancelling: Arc<AtomicBool>,
    copy_interrupt: Arc<AtomicBool>,
    copy_active: Arc<AtomicBool>,
}

impl InstallCoordinator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        applier: Arc<dyn PayloadApplier>,
        recovery: Arc<dyn RecoveryInstaller>,
    ) -> Self {
        Self {
            shared,
            applier,
            recovery,
            cancelling: Arc::new(AtomicBool::new(false)),
            copy_interrupt: Arc::new(AtomicBool::new(false)),
            copy_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock_registry().active_install.is_some()
    }

    pub fn install(&self, download_id: &str) -> Result<()> {
        {
            let mut registry = self.shared.lock_registry();
            if registry.active_install.is_some() {
                tracing::debug!("already installing an update");
                return Ok(());
            }
            registry.active_install = Some(download_id.to_string());
        }

        let file = {
            let registry = self.shared.lock_registry();
            registry
                .records
                .get(download_id)
                .and_then(|record| record.local_file_path.clone())
        };
        let Some(file) = file.filter(|file| file.exists()) else {
            tracing::error!("the update package does not exist");
            self.fail_install(download_id);
            return Ok(());
        };

        let shared = self.shared.clone();
        let applier = self.applier.clone();
        let recovery = self.recovery.clone();
        let cancelling = self.cancelling.clone();
        let copy_interrupt = self.copy_interrupt.clone();
        let copy_active = self.copy_active.clone();
        let download_id = download_id.to_string();
        tokio::task::spawn_blocking(move || {
            match payload_locator::is_streaming_update(&file) {
                Ok(true) => streaming_install(shared, applier, cancelling, &download_id, &file),
                Ok(false) => legacy_install(
                    shared,
                    recovery,
                    copy_interrupt,
                    copy_active,
                    &download_id,
                    &file,
                ),
                Err(err) => {
                    tracing::error!("could not probe {}: {err}", file.display());
                    fail(&shared, &download_id);
                }
            }
        });
        Ok(())
    }

    /// Cancel whichever install stage is in flight. During the legacy copy
    /// this interrupts the copy thread; during a streaming apply it tells
    /// the applier to abort and marks the record cancelled before the
    /// applier's error callback can arrive.
    pub fn cancel(&self) -> Result<()> {
        if self.copy_active.load(Ordering::SeqCst) {
            self.copy_interrupt.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let Some(download_id) = self.shared.lock_registry().active_install.clone() else {
            tracing::debug!("nothing to cancel");
            return Ok(());
        };
        self.cancelling.store(true, Ordering::SeqCst);
        self.applier.cancel()?;
        self.shared.db.clear_installing_ab_id()?;
        {
            let mut registry = self.shared.lock_registry();
            if let Some(record) = registry.record_mut(&download_id) {
                record.install_progress_percent = 0;
                record.is_finalizing = false;
            }
            registry.active_install = None;
        }
        // The artifact itself is still verified; a later retry is allowed.
        self.shared.set_status(
            &download_id,
            UpdateStatus::InstallationCancelled,
            Some(PersistentStatus::Verified),
        );
        Ok(())
    }

    pub fn suspend(&self) -> Result<()> {
        let Some(download_id) = self.shared.lock_registry().active_install.clone() else {
            return Err(UpdaterError::InvalidState("no install to suspend".to_string()));
        };
        self.applier.suspend()?;
        self.shared.db.set_suspended_ab_id(&download_id)?;
        // Progress stays frozen at its last reported values.
        self.shared.set_status(
            &download_id,
            UpdateStatus::InstallationSuspended,
            Some(PersistentStatus::InstallingUpdate),
        );
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let suspended = self.shared.db.suspended_ab_id()?;
        let Some(download_id) = suspended.or_else(|| self.shared.lock_registry().active_install.clone())
        else {
            return Err(UpdaterError::InvalidState("no install to resume".to_string()));
        };
        self.applier.resume()?;
        self.shared.db.clear_suspended_ab_id()?;
        self.shared.set_status(
            &download_id,
            UpdateStatus::Installing,
            Some(PersistentStatus::InstallingUpdate),
        );
        Ok(())
    }

    /// Re-attach to an apply operation left running by a previous process
    /// instance, identified by the durable installing marker.
    pub fn reconnect(&self) -> Result<()> {
        let Some(download_id) = self.shared.db.installing_ab_id()? else {
            return Ok(());
        };
        {
            let mut registry = self.shared.lock_registry();
            registry.active_install = Some(download_id.clone());
        }
        let observer: Arc<dyn ApplierObserver> = Arc::new(ApplierEvents {
            shared: self.shared.clone(),
            download_id,
            cancelling: self.cancelling.clone(),
        });
        self.applier.reconnect(observer)
    }

    fn fail_install(&self, download_id: &str) {
        fail(&self.shared, download_id);
    }
}

fn fail(shared: &Shared, download_id: &str) {
    {
        let mut registry = shared.lock_registry();
        if let Some(record) = registry.record_mut(download_id) {
            record.install_progress_percent = 0;
            record.is_finalizing = false;
        }
        registry.active_install = None;
    }
    shared.set_status(download_id, UpdateStatus::InstallationFailed, None);
}

fn streaming_install(
    shared: Arc<Shared>,
    applier: Arc<dyn PayloadApplier>,
    cancelling: Arc<AtomicBool>,
    download_id: &str,
    file: &Path,
) {
    // A cancel flag left over from an earlier install (whose applier never
    // delivered a completion error) must not swallow this one's failures.
    cancelling.store(false, Ordering::SeqCst);

    let prepared = payload_locator::locate(file, PAYLOAD_BIN_PATH)
        .and_then(|offset| Ok((offset, payload_locator::read_payload_properties(file)?)));
    let (offset, header_lines) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            tracing::error!("could not prepare {}: {err}", file.display());
            fail(&shared, download_id);
            return;
        }
    };

    // The durable marker goes in before the applier is invoked so that a
    // restarted process can reconnect instead of losing the operation.
    if let Err(err) = shared.db.set_installing_ab_id(download_id) {
        tracing::error!("could not persist installing marker: {err}");
        fail(&shared, download_id);
        return;
    }
    shared.set_status(
        download_id,
        UpdateStatus::Installing,
        Some(PersistentStatus::InstallingUpdate),
    );

    let observer: Arc<dyn ApplierObserver> = Arc::new(ApplierEvents {
        shared: shared.clone(),
        download_id: download_id.to_string(),
        cancelling,
    });
    let uri = format!("file://{}", file.display());
    if let Err(err) = applier.apply_payload(&uri, offset, &header_lines, observer) {
        tracing::error!("failed to apply payload: {err}");
        let _ = shared.db.clear_installing_ab_id();
        let _ = shared.reset_persistent_status();
        fail(&shared, download_id);
    }
}

fn legacy_install(
    shared: Arc<Shared>,
    recovery: Arc<dyn RecoveryInstaller>,
    copy_interrupt: Arc<AtomicBool>,
    copy_active: Arc<AtomicBool>,
    download_id: &str,
    file: &Path,
) {
    shared.set_status(download_id, UpdateStatus::Installing, None);

    let needs_staging = shared.config.recovery_update && shared.config.storage_encrypted;
    let target: PathBuf = if needs_staging {
        // The privileged installer that runs after reboot cannot read the
        // encrypted filesystem, so stage a plaintext copy next to the file.
        let staging = PathBuf::from(format!(
            "{}{}",
            file.display(),
            shared.config.uncrypt_file_ext
        ));
        copy_interrupt.store(false, Ordering::SeqCst);
        copy_active.store(true, Ordering::SeqCst);
        let mut last_report: Option<Instant> = None;
        let result = copy_with_progress(file, &staging, &copy_interrupt, |percent| {
            let due = last_report
                .map(|at| at.elapsed() >= COPY_REPORT_INTERVAL)
                .unwrap_or(true);
            if !due {
                return;
            }
            last_report = Some(Instant::now());
            {
                let mut registry = shared.lock_registry();
                if let Some(record) = registry.record_mut(download_id) {
                    record.install_progress_percent = percent;
                }
            }
            shared.notifier.notify_install_progress(download_id);
        });
        copy_active.store(false, Ordering::SeqCst);

        match result {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!("staging copy interrupted");
                let _ = std::fs::remove_file(&staging);
                fail(&shared, download_id);
                return;
            }
            Err(err) => {
                tracing::error!("could not stage update: {err}");
                let _ = std::fs::remove_file(&staging);
                fail(&shared, download_id);
                return;
            }
        }
        if let Err(err) = set_world_readable(&staging) {
            tracing::error!("could not adjust staging permissions: {err}");
            let _ = std::fs::remove_file(&staging);
            fail(&shared, download_id);
            return;
        }
        staging
    } else {
        file.to_path_buf()
    };

    // No progress reporting past this point; control leaves the process and
    // the install completes on the next boot.
    if let Err(err) = recovery.install_package(&target) {
        tracing::error!("could not install update: {err}");
        if needs_staging {
            let _ = std::fs::remove_file(&target);
        }
        fail(&shared, download_id);
    }
}

struct ApplierEvents {
    shared: Arc<Shared>,
    download_id: String,
    cancelling: Arc<AtomicBool>,
}

impl ApplierObserver for ApplierEvents {
    fn on_status_update(&self, status: ApplierStatus, percent: f32) {
        match status {
            ApplierStatus::Downloading | ApplierStatus::Finalizing => {
                let was_installing = {
                    let mut registry = self.shared.lock_registry();
                    let Some(record) = registry.record_mut(&self.download_id) else {
                        return;
                    };
                    let was_installing = record.status == UpdateStatus::Installing;
                    record.status = UpdateStatus::Installing;
                    record.install_progress_percent =
                        (percent * 100.0).round().clamp(0.0, 100.0) as i32;
                    record.is_finalizing = status == ApplierStatus::Finalizing;
                    was_installing
                };
                if !was_installing {
                    self.shared.set_status(
                        &self.download_id,
                        UpdateStatus::Installing,
                        Some(PersistentStatus::InstallingUpdate),
                    );
                }
                self.shared.notifier.notify_install_progress(&self.download_id);
            }
            ApplierStatus::UpdatedNeedReboot => {
                // Success terminal: swap the durable installing marker for
                // the durable needs-reboot marker before anyone is told.
                let _ = self.shared.db.clear_installing_ab_id();
                let _ = self.shared.db.clear_suspended_ab_id();
                if let Err(err) = self.shared.db.set_needs_reboot_id(&self.download_id) {
                    tracing::error!("could not persist reboot marker: {err}");
                }
                {
                    let mut registry = self.shared.lock_registry();
                    if let Some(record) = registry.record_mut(&self.download_id) {
                        record.install_progress_percent = 0;
                        record.is_finalizing = false;
                    }
                    registry.active_install = None;
                }
                self.shared.set_status(
                    &self.download_id,
                    UpdateStatus::Installed,
                    Some(PersistentStatus::Unknown),
                );
            }
            ApplierStatus::Idle => {
                // The applier restarted without a real install in flight;
                // clear everything and fall back to the verified artifact.
                tracing::debug!("applier idle, reverting to clean state");
                let _ = self.shared.db.clear_installing_ab_id();
                let _ = self.shared.db.clear_suspended_ab_id();
                {
                    let mut registry = self.shared.lock_registry();
                    if let Some(record) = registry.record_mut(&self.download_id) {
                        record.install_progress_percent = 0;
                        record.is_finalizing = false;
                    }
                    registry.active_install = None;
                }
                self.shared.set_status(
                    &self.download_id,
                    UpdateStatus::Verified,
                    Some(PersistentStatus::Verified),
                );
            }
        }
    }

    fn on_payload_application_complete(&self, error_code: i32) {
        if error_code == 0 {
            return;
        }
        if self.cancelling.swap(false, Ordering::SeqCst) {
            // The failure was caused by our own cancel; the cancelled state
            // is already set.
            tracing::debug!("suppressing applier error {error_code} after cancel");
            return;
        }
        tracing::error!("payload application failed with code {error_code}");
        let _ = self.shared.db.clear_installing_ab_id();
        let _ = self.shared.reset_persistent_status();
        fail(&self.shared, &self.download_id);
    }
}
