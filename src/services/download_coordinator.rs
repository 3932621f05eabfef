use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{Result, UpdaterError};
use crate::models::{PersistentStatus, UpdateStatus};
use crate::services::hash_verifier;
use crate::services::registry::{ActiveTransfer, Shared};
use crate::services::transport::{
    DownloadTransport, TransferObserver, TransferRequest,
};
use crate::utils::file::unique_destination;

const MAX_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the single active transfer. Starting a second transfer while one is
/// running is a no-op, which absorbs duplicate start requests from the
/// caller instead of double-downloading.
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
    transport: Arc<dyn DownloadTransport>,
}

impl DownloadCoordinator {
    pub(crate) fn new(shared: Arc<Shared>, transport: Arc<dyn DownloadTransport>) -> Self {
        Self { shared, transport }
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock_registry().active_transfer.is_some()
    }

    pub fn start(&self, download_id: &str) -> Result<()> {
        if self.is_active() {
            tracing::debug!("download already started");
            return Ok(());
        }
        self.shared.cleanup_download_dir();
        self.begin_transfer(download_id, false)
    }

    pub fn resume(&self, download_id: &str) -> Result<()> {
        if self.is_active() {
            tracing::debug!("already downloading");
            return Ok(());
        }

        let (path, expected) = {
            let registry = self.shared.lock_registry();
            let record = registry
                .records
                .get(download_id)
                .ok_or_else(|| UpdaterError::InvalidState(format!("unknown update {download_id}")))?;
            (record.local_file_path.clone(), record.bytes_expected)
        };

        let Some(path) = path.filter(|path| path.exists()) else {
            tracing::error!("destination file is gone, cannot resume {download_id}");
            self.fail_download(download_id, None);
            return Ok(());
        };

        let file_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if expected > 0 && file_len >= expected {
            tracing::debug!("file already fully downloaded, verifying {download_id}");
            self.begin_verification(download_id, &path);
            return Ok(());
        }
        self.begin_transfer(download_id, true)
    }

    /// Cancel the in-flight transfer. Returns false when nothing was
    /// active, including when the transfer won a race by completing first.
    pub fn pause(&self, download_id: &str) -> bool {
        let handle = {
            let mut registry = self.shared.lock_registry();
            let matches = registry
                .active_transfer
                .as_ref()
                .map(|active| active.download_id == download_id)
                .unwrap_or(false);
            if !matches {
                return false;
            }
            let active = registry.active_transfer.take();
            if let Some(record) = registry.record_mut(download_id) {
                record.eta_seconds = 0;
                record.speed_bytes_per_sec = 0;
            }
            active
        };
        if let Some(active) = handle {
            active.handle.cancel();
        }
        self.shared
            .set_status(download_id, UpdateStatus::Paused, Some(PersistentStatus::Incomplete));
        self.shared.try_release_wakelock();
        true
    }

    fn begin_transfer(&self, download_id: &str, resume: bool) -> Result<()> {
        std::fs::create_dir_all(&self.shared.config.download_dir)?;

        // The registry stays locked from the single-flight check until the
        // handle is registered, so no transfer callback can observe a
        // half-registered transfer.
        let mut registry = self.shared.lock_registry();
        if registry.active_transfer.is_some() {
            return Ok(());
        }
        let download_dir = self.shared.config.download_dir.clone();
        let record = registry
            .record_mut(download_id)
            .ok_or_else(|| UpdaterError::InvalidState(format!("unknown update {download_id}")))?;
        let destination = if resume {
            record
                .local_file_path
                .clone()
                .ok_or_else(|| UpdaterError::InvalidState("no file to resume".to_string()))?
        } else {
            unique_destination(download_dir.join(&record.name))
        };
        record.local_file_path = Some(destination.clone());
        let request = TransferRequest {
            url: record.download_url.clone(),
            destination,
            resume,
        };

        let observer: Arc<dyn TransferObserver> = Arc::new(TransferEvents {
            shared: self.shared.clone(),
            download_id: download_id.to_string(),
            throttle: Mutex::new(ProgressThrottle::default()),
        });
        let handle = self.transport.start(request, observer);
        registry.active_transfer = Some(ActiveTransfer {
            download_id: download_id.to_string(),
            handle,
        });
        if !registry.wakelock_held {
            registry.wakelock_held = true;
            self.shared.wakelock.acquire();
        }
        drop(registry);
        self.shared.set_status(
            download_id,
            UpdateStatus::Starting,
            Some(PersistentStatus::Incomplete),
        );
        Ok(())
    }

    fn fail_download(&self, download_id: &str, partial: Option<&Path>) {
        if let Some(path) = partial {
            let _ = std::fs::remove_file(path);
        }
        self.shared.set_status(
            download_id,
            UpdateStatus::DownloadError,
            Some(PersistentStatus::Unknown),
        );
    }

    fn begin_verification(&self, download_id: &str, path: &Path) {
        self.shared
            .set_status(download_id, UpdateStatus::Verifying, None);
        spawn_verification(self.shared.clone(), download_id.to_string(), path.to_path_buf());
    }
}

/// Run the hash check on a blocking worker and apply the resulting
/// transition.
pub(crate) fn spawn_verification(shared: Arc<Shared>, download_id: String, path: PathBuf) {
    let expected = {
        let registry = shared.lock_registry();
        registry
            .records
            .get(&download_id)
            .map(|record| record.expected_hash.clone())
    };
    let Some(expected) = expected else { return };

    shared.verifying.store(true, Ordering::SeqCst);
    tokio::spawn(async move {
        let check = path.clone();
        let ok = tokio::task::spawn_blocking(move || hash_verifier::verify(&check, &expected))
            .await
            .unwrap_or(false);
        shared.verifying.store(false, Ordering::SeqCst);
        if ok {
            let _ = crate::utils::file::set_world_readable(&path);
            shared.set_status(
                &download_id,
                UpdateStatus::Verified,
                Some(PersistentStatus::Verified),
            );
        } else {
            {
                let mut registry = shared.lock_registry();
                if let Some(record) = registry.record_mut(&download_id) {
                    record.set_progress(0);
                }
            }
            shared.set_status(
                &download_id,
                UpdateStatus::VerificationFailed,
                Some(PersistentStatus::Unknown),
            );
        }
    });
}

#[derive(Default)]
struct ProgressThrottle {
    last_emit: Option<Instant>,
    last_percent: i32,
}

struct TransferEvents {
    shared: Arc<Shared>,
    download_id: String,
    throttle: Mutex<ProgressThrottle>,
}

impl TransferObserver for TransferEvents {
    fn on_response(&self, content_length: Option<u64>) {
        {
            let mut registry = self.shared.lock_registry();
            if let Some(record) = registry.record_mut(&self.download_id) {
                if let Some(length) = content_length {
                    tracing::debug!(
                        "transfer of {} opened, {}",
                        self.download_id,
                        crate::utils::file::readable_file_size(length)
                    );
                    // Trust a transport-reported length only when it grows
                    // the feed's declared size.
                    if length > record.bytes_expected {
                        record.bytes_expected = length;
                    }
                }
            }
        }
        self.shared.set_status(
            &self.download_id,
            UpdateStatus::Downloading,
            Some(PersistentStatus::Incomplete),
        );
    }

    fn on_progress(&self, bytes_read: u64, content_length: u64, speed: u64, eta_seconds: u64) {
        let mut registry = self.shared.lock_registry();
        let Some(record) = registry.record_mut(&self.download_id) else {
            return;
        };
        let total = if content_length > 0 {
            content_length
        } else {
            record.bytes_expected
        };
        if total == 0 {
            return;
        }
        let percent = (bytes_read.saturating_mul(100) / total).min(100) as i32;

        let mut throttle = match self.throttle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = throttle
            .last_emit
            .map(|at| at.elapsed() >= MAX_REPORT_INTERVAL)
            .unwrap_or(true);
        if percent == throttle.last_percent && !due {
            return;
        }
        throttle.last_percent = percent;
        throttle.last_emit = Some(Instant::now());
        drop(throttle);

        record.set_progress(percent);
        record.eta_seconds = eta_seconds;
        record.speed_bytes_per_sec = speed;
        drop(registry);
        self.shared.notifier.notify_download_progress(&self.download_id);
    }

    fn on_success(&self, destination: &Path) {
        tracing::debug!("download complete: {}", destination.display());
        // Clearing the handle before any transition is what resolves a
        // cancel racing this completion in favor of the success.
        self.shared.clear_active_transfer(&self.download_id);
        self.shared
            .set_status(&self.download_id, UpdateStatus::Verifying, None);
        spawn_verification(
            self.shared.clone(),
            self.download_id.clone(),
            destination.to_path_buf(),
        );
        self.shared.try_release_wakelock();
    }

    fn on_failure(&self, cancelled: bool) {
        if cancelled {
            // The pause or delete call site already set the intended state.
            tracing::debug!("download cancelled");
            self.shared.try_release_wakelock();
            return;
        }
        tracing::error!("download failed");
        self.shared.clear_active_transfer(&self.download_id);
        let partial = {
            let registry = self.shared.lock_registry();
            registry
                .records
                .get(&self.download_id)
                .and_then(|record| record.local_file_path.clone())
        };
        if let Some(path) = partial {
            let _ = std::fs::remove_file(path);
        }
        self.shared.set_status(
            &self.download_id,
            UpdateStatus::DownloadError,
            Some(PersistentStatus::Unknown),
        );
        self.shared.try_release_wakelock();
    }
}
