use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::config::UpdaterConfig;
use crate::db::queries::StatusQueries;
use crate::db::Database;
use crate::errors::{Result, UpdaterError};
use crate::events::{ChangeNotifier, UpdateEvent};
use crate::models::{
    fix_status, PersistentStatus, StatusFix, UpdateDescriptor, UpdateRecord, UpdateStatus,
};
use crate::services::download_coordinator::DownloadCoordinator;
use crate::services::install_coordinator::{
    InstallCoordinator, PayloadApplier, RecoveryInstaller,
};
use crate::services::registry::{Registry, Shared, WakeLock};
use crate::services::transport::DownloadTransport;

/// The facade the host talks to. Owns the shared registry plus the two
/// coordinators and reconciles durable state with reality when updates are
/// (re)offered after a restart.
pub struct UpdateOrchestrator {
    shared: Arc<Shared>,
    downloads: DownloadCoordinator,
    installs: InstallCoordinator,
}

impl UpdateOrchestrator {
    /// Build the orchestrator. Must be called inside a tokio runtime: the
    /// notifier captures the runtime handle here, and downloads,
    /// verification and installs run as tasks on it. Notifications and the
    /// synchronous operations may afterwards be triggered from any thread.
    pub fn new(
        config: UpdaterConfig,
        transport: Arc<dyn DownloadTransport>,
        applier: Arc<dyn PayloadApplier>,
        recovery: Arc<dyn RecoveryInstaller>,
        wakelock: Arc<dyn WakeLock>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.download_dir)?;
        let db = Database::open(&config.db_path)?;
        let notifier = ChangeNotifier::new(config.notify_delay());
        let shared = Arc::new(Shared {
            config,
            db,
            notifier,
            registry: Mutex::new(Registry::default()),
            wakelock,
            verifying: AtomicBool::new(false),
        });
        Ok(Self {
            downloads: DownloadCoordinator::new(shared.clone(), transport),
            installs: InstallCoordinator::new(
                shared.clone(),
                applier,
                recovery,
            ),
            shared,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.shared.notifier.subscribe()
    }

    /// Track an update offered by the feed (or re-offered after a restart).
    /// Returns false when the update was already tracked, in which case only
    /// the volatile descriptor fields are refreshed.
    pub fn add_update(&self, descriptor: &UpdateDescriptor, available_online: bool) -> Result<bool> {
        {
            let mut registry = self.shared.lock_registry();
            if let Some(record) = registry.record_mut(&descriptor.id) {
                tracing::debug!("update {} already tracked, merging", descriptor.id);
                record.merge_descriptor(descriptor, available_online);
                return Ok(false);
            }
        }

        let mut record = UpdateRecord::from_descriptor(descriptor, available_online);
        let mut reconnect_install = false;

        // The durable keys describe at most one in-flight update. Once a
        // tracked record carries them, a later descriptor must not be
        // reconciled against them, let alone reset them.
        let durable_claimed = {
            let registry = self.shared.lock_registry();
            registry
                .records
                .values()
                .any(|tracked| tracked.persistent_status != PersistentStatus::Unknown)
        };

        // Reconcile the new record against what the durable keys claim was
        // in flight before the last shutdown.
        if self.shared.db.needs_reboot_id()?.as_deref() == Some(record.download_id.as_str()) {
            record.status = UpdateStatus::Installed;
        } else if durable_claimed {
            record.status = UpdateStatus::Unknown;
        } else {
            let persistent = self.shared.db.persistent_status()?;
            match persistent {
                PersistentStatus::Verified | PersistentStatus::Incomplete => {
                    let path = self.shared.config.download_dir.join(&record.name);
                    record.local_file_path = Some(path.clone());
                    record.persistent_status = persistent;
                    let file_len = std::fs::metadata(&path).map(|m| m.len()).ok();
                    match fix_status(&mut record, file_len) {
                        StatusFix::Invalid => {
                            tracing::debug!(
                                "durable status {persistent:?} had no backing file, resetting"
                            );
                            self.shared.reset_persistent_status()?;
                        }
                        StatusFix::Valid => {
                            let installing = self.shared.db.installing_ab_id()?;
                            if persistent == PersistentStatus::Verified
                                && installing.as_deref() == Some(record.download_id.as_str())
                                && self.shared.config.ab_device
                            {
                                // The applier kept running across our restart.
                                record.status = UpdateStatus::Installing;
                                reconnect_install = true;
                            } else {
                                record.status = UpdateStatus::Paused;
                            }
                        }
                    }
                }
                PersistentStatus::InstallingUpdate => {
                    let suspended = self.shared.db.suspended_ab_id()?;
                    let installing = self.shared.db.installing_ab_id()?;
                    let path = self.shared.config.download_dir.join(&record.name);
                    if path.exists() {
                        record.local_file_path = Some(path);
                    }
                    if suspended.as_deref() == Some(record.download_id.as_str()) {
                        record.status = UpdateStatus::InstallationSuspended;
                        record.persistent_status = persistent;
                    } else if installing.as_deref() == Some(record.download_id.as_str()) {
                        record.status = UpdateStatus::Installing;
                        record.persistent_status = persistent;
                        reconnect_install = true;
                    } else {
                        tracing::debug!("stale installing status for another update, resetting");
                        record.status = UpdateStatus::Unknown;
                        self.shared.reset_persistent_status()?;
                    }
                }
                PersistentStatus::Unknown => {
                    record.status = UpdateStatus::Unknown;
                }
            }
        }

        let download_id = record.download_id.clone();
        let status = record.status;
        {
            let mut registry = self.shared.lock_registry();
            registry.records.insert(download_id.clone(), record);
        }
        if status == UpdateStatus::Unknown {
            self.shared.cleanup_download_dir();
        }
        if reconnect_install {
            self.installs.reconnect()?;
        }
        self.shared.notifier.notify_status(&download_id, status);
        Ok(true)
    }

    pub fn start_download(&self, download_id: &str) -> Result<()> {
        self.downloads.start(download_id)
    }

    pub fn resume_download(&self, download_id: &str) -> Result<()> {
        self.downloads.resume(download_id)
    }

    /// Returns false when no matching transfer was active, including when
    /// the transfer completed just before the pause arrived.
    pub fn pause_download(&self, download_id: &str) -> bool {
        self.downloads.pause(download_id)
    }

    /// Stop tracking an update and delete its local artifact. Refused while
    /// that update is being installed.
    pub fn delete_update(&self, download_id: &str) -> Result<()> {
        {
            let registry = self.shared.lock_registry();
            if registry.active_install.as_deref() == Some(download_id) {
                return Err(UpdaterError::InvalidState(
                    "cannot delete an update while it is installing".to_string(),
                ));
            }
        }
        self.downloads.pause(download_id);

        let (path, available_online) = {
            let registry = self.shared.lock_registry();
            match registry.records.get(download_id) {
                Some(record) => (record.local_file_path.clone(), record.available_online),
                None => return Ok(()),
            }
        };
        if let Some(path) = path {
            let _ = std::fs::remove_file(path);
        }
        self.shared.reset_persistent_status()?;

        if available_online {
            // Still offered by the feed: keep the entry, reset its runtime
            // state so it reads as a fresh candidate.
            {
                let mut registry = self.shared.lock_registry();
                if let Some(record) = registry.record_mut(download_id) {
                    record.reset_runtime();
                }
            }
            self.shared
                .notifier
                .notify_status(download_id, UpdateStatus::Unknown);
        } else {
            {
                let mut registry = self.shared.lock_registry();
                registry.records.remove(download_id);
            }
            self.shared.notifier.notify_removed(download_id);
        }
        Ok(())
    }

    /// Install the verified update. The durable status is the gate: anything
    /// other than `Verified` means there is no artifact known to be intact.
    pub fn install_current(&self) -> Result<()> {
        if self.shared.db.persistent_status()? != PersistentStatus::Verified {
            return Err(UpdaterError::InvalidState(
                "no verified update to install".to_string(),
            ));
        }
        let candidate = {
            let registry = self.shared.lock_registry();
            registry
                .records
                .values()
                .find(|record| {
                    // A cancelled install left the artifact verified on
                    // disk; it stays retryable.
                    matches!(
                        record.status,
                        UpdateStatus::Verified
                            | UpdateStatus::Paused
                            | UpdateStatus::InstallationCancelled
                    ) && record
                            .local_file_path
                            .as_ref()
                            .map(|path| path.exists())
                            .unwrap_or(false)
                })
                .map(|record| record.download_id.clone())
        };
        let Some(download_id) = candidate else {
            return Err(UpdaterError::InvalidState(
                "no verified update to install".to_string(),
            ));
        };
        self.installs.install(&download_id)
    }

    pub fn cancel_install(&self) -> Result<()> {
        self.installs.cancel()
    }

    pub fn suspend_install(&self) -> Result<()> {
        self.installs.suspend()
    }

    pub fn resume_install(&self) -> Result<()> {
        self.installs.resume()
    }

    /// Re-attach to an apply operation that survived a process restart.
    pub fn reconnect_install(&self) -> Result<()> {
        self.installs.reconnect()
    }

    pub fn is_downloading(&self) -> bool {
        self.downloads.is_active()
    }

    pub fn is_verifying(&self) -> bool {
        self.shared.verifying.load(Ordering::SeqCst)
    }

    /// True while an install is in flight, including the window after a
    /// successful apply when the device still has to reboot into the new
    /// slot.
    pub fn is_installing(&self) -> bool {
        if self.installs.is_active() {
            return true;
        }
        matches!(self.shared.db.installing_ab_id(), Ok(Some(_)))
            || matches!(self.shared.db.needs_reboot_id(), Ok(Some(_)))
    }

    pub fn has_active_work(&self) -> bool {
        self.is_downloading() || self.is_verifying() || self.is_installing()
    }

    pub fn needs_reboot(&self) -> Result<Option<String>> {
        self.shared.db.needs_reboot_id()
    }

    pub fn notify_network_unavailable(&self) {
        self.shared.notifier.notify_network_unavailable();
    }

    pub fn get(&self, download_id: &str) -> Option<UpdateRecord> {
        self.shared.lock_registry().records.get(download_id).cloned()
    }

    /// Tracked updates, optionally filtered to those compatible with the
    /// running build.
    pub fn list(&self, compatible_only: bool) -> Vec<UpdateRecord> {
        let registry = self.shared.lock_registry();
        let mut records: Vec<UpdateRecord> = registry
            .records
            .values()
            .filter(|record| {
                !compatible_only
                    || record.is_compatible(
                        &self.shared.config.build_version,
                        self.shared.config.build_timestamp,
                    )
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| std::cmp::Reverse(record.timestamp));
        records
    }
}
