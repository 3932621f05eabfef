use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::UpdaterConfig;
use crate::db::queries::StatusQueries;
use crate::db::Database;
use crate::errors::Result;
use crate::events::ChangeNotifier;
use crate::models::{PersistentStatus, UpdateRecord, UpdateStatus};
use crate::services::transport::TransferHandle;

/// Keep-awake capability held while any transfer is active.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

pub(crate) struct ActiveTransfer {
    pub download_id: String,
    pub handle: TransferHandle,
}

/// All tracked updates plus the two single-flight slots. Mutated only under
/// the registry lock, which totally orders status transitions per update.
#[derive(Default)]
pub(crate) struct Registry {
    pub records: HashMap<String, UpdateRecord>,
    pub active_transfer: Option<ActiveTransfer>,
    pub active_install: Option<String>,
    pub wakelock_held: bool,
}

impl Registry {
    pub fn record_mut(&mut self, download_id: &str) -> Option<&mut UpdateRecord> {
        self.records.get_mut(download_id)
    }
}

/// State shared by the orchestrator and its coordinators.
pub(crate) struct Shared {
    pub config: UpdaterConfig,
    pub db: Database,
    pub notifier: ChangeNotifier,
    pub registry: Mutex<Registry>,
    pub wakelock: Arc<dyn WakeLock>,
    pub verifying: AtomicBool,
}

impl Shared {
    pub fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        // A poisoned registry lock means a panicked mutation; the state is
        // a plain map, so continuing with it is still sound.
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply a status transition: the durable coarse status is committed
    /// first, then the in-memory record, then the (delayed) notification.
    pub fn set_status(
        &self,
        download_id: &str,
        status: UpdateStatus,
        persist: Option<PersistentStatus>,
    ) {
        if let Some(persistent) = persist {
            if let Err(err) = self.db.set_persistent_status(persistent) {
                tracing::error!("could not persist status {persistent:?}: {err}");
            }
        }
        {
            let mut registry = self.lock_registry();
            if let Some(record) = registry.record_mut(download_id) {
                record.status = status;
                if let Some(persistent) = persist {
                    record.persistent_status = persistent;
                }
            }
        }
        self.notifier.notify_status(download_id, status);
    }

    pub fn try_release_wakelock(&self) {
        let mut registry = self.lock_registry();
        if registry.wakelock_held && registry.active_transfer.is_none() {
            registry.wakelock_held = false;
            self.wakelock.release();
        }
    }

    /// Clear the active transfer slot if it belongs to `download_id`.
    /// Returns whether a transfer was actually cleared; completion paths use
    /// this so that a cancel racing a finished transfer becomes a no-op.
    pub fn clear_active_transfer(&self, download_id: &str) -> bool {
        let mut registry = self.lock_registry();
        let matches = registry
            .active_transfer
            .as_ref()
            .map(|active| active.download_id == download_id)
            .unwrap_or(false);
        if matches {
            registry.active_transfer = None;
        }
        matches
    }

    pub fn known_files(&self) -> Vec<std::path::PathBuf> {
        let registry = self.lock_registry();
        registry
            .records
            .values()
            .filter_map(|record| record.local_file_path.clone())
            .collect()
    }

    pub fn cleanup_download_dir(&self) {
        crate::utils::file::cleanup_download_dir(
            &self.config.download_dir,
            &self.config.uncrypt_file_ext,
            &self.known_files(),
        );
    }

    pub fn reset_persistent_status(&self) -> Result<()> {
        self.db.set_persistent_status(PersistentStatus::Unknown)
    }
}
