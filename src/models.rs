use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Rich in-memory status of a tracked update.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Unknown,
    Starting,
    Downloading,
    Paused,
    DownloadError,
    Verifying,
    VerificationFailed,
    Verified,
    Installing,
    Installed,
    InstallationFailed,
    InstallationCancelled,
    InstallationSuspended,
}

/// Coarse durable status. This is the single source of truth consulted on
/// cold start; it carries only what is needed to resume correctly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStatus {
    Unknown,
    Incomplete,
    Verified,
    InstallingUpdate,
}

impl PersistentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistentStatus::Unknown => "unknown",
            PersistentStatus::Incomplete => "incomplete",
            PersistentStatus::Verified => "verified",
            PersistentStatus::InstallingUpdate => "installing_update",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "incomplete" => PersistentStatus::Incomplete,
            "verified" => PersistentStatus::Verified,
            "installing_update" => PersistentStatus::InstallingUpdate,
            _ => PersistentStatus::Unknown,
        }
    }
}

impl UpdateStatus {
    /// Coarse durable status this rich status maps to.
    pub fn persistent(self) -> PersistentStatus {
        match self {
            UpdateStatus::Starting | UpdateStatus::Downloading | UpdateStatus::Paused => {
                PersistentStatus::Incomplete
            }
            UpdateStatus::Verified => PersistentStatus::Verified,
            UpdateStatus::Installing | UpdateStatus::InstallationSuspended => {
                PersistentStatus::InstallingUpdate
            }
            _ => PersistentStatus::Unknown,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Maintainer {
    pub name: String,
    #[serde(default)]
    pub username: String,
}

/// One entry of the update feed, as served.
#[derive(Deserialize, Clone, Debug)]
pub struct UpdateDescriptor {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub datetime: i64,
    pub version: String,
    pub filehash: String,
    pub url: String,
    #[serde(default)]
    pub donate_url: String,
    #[serde(default)]
    pub forum_url: String,
    #[serde(default)]
    pub website_url: String,
    #[serde(default)]
    pub news_url: String,
    #[serde(default)]
    pub maintainers: Vec<Maintainer>,
}

/// A tracked update: immutable descriptor fields plus the runtime state the
/// orchestrator mutates as the update moves through its lifecycle.
#[derive(Serialize, Clone, Debug)]
pub struct UpdateRecord {
    pub download_id: String,
    pub name: String,
    pub version: String,
    pub timestamp: i64,
    pub download_url: String,
    pub expected_hash: String,
    pub declared_size: u64,
    pub donate_url: String,
    pub forum_url: String,
    pub website_url: String,
    pub news_url: String,
    pub maintainers: Vec<Maintainer>,

    pub status: UpdateStatus,
    #[serde(skip)]
    pub persistent_status: PersistentStatus,
    pub local_file_path: Option<PathBuf>,
    pub bytes_expected: u64,
    pub progress_percent: i32,
    pub eta_seconds: u64,
    pub speed_bytes_per_sec: u64,
    pub install_progress_percent: i32,
    pub is_finalizing: bool,
    pub available_online: bool,
}

impl UpdateRecord {
    pub fn from_descriptor(descriptor: &UpdateDescriptor, available_online: bool) -> Self {
        Self {
            download_id: descriptor.id.clone(),
            name: descriptor.filename.clone(),
            version: descriptor.version.clone(),
            timestamp: descriptor.datetime,
            download_url: descriptor.url.clone(),
            expected_hash: descriptor.filehash.clone(),
            declared_size: descriptor.size,
            donate_url: descriptor.donate_url.clone(),
            forum_url: descriptor.forum_url.clone(),
            website_url: descriptor.website_url.clone(),
            news_url: descriptor.news_url.clone(),
            maintainers: descriptor.maintainers.clone(),
            status: UpdateStatus::Unknown,
            persistent_status: PersistentStatus::Unknown,
            local_file_path: None,
            bytes_expected: descriptor.size,
            progress_percent: 0,
            eta_seconds: 0,
            speed_bytes_per_sec: 0,
            install_progress_percent: 0,
            is_finalizing: false,
            available_online,
        }
    }

    /// Merge the descriptor-level fields that may legitimately change while
    /// a transfer is in flight. Runtime state is left untouched.
    pub fn merge_descriptor(&mut self, descriptor: &UpdateDescriptor, available_online: bool) {
        self.download_url = descriptor.url.clone();
        self.available_online = available_online;
    }

    pub fn set_progress(&mut self, percent: i32) {
        self.progress_percent = percent.clamp(0, 100);
    }

    /// Reset every runtime field back to a fresh, untracked state. The
    /// descriptor fields survive so the record can reappear if re-offered.
    pub fn reset_runtime(&mut self) {
        self.status = UpdateStatus::Unknown;
        self.persistent_status = PersistentStatus::Unknown;
        self.local_file_path = None;
        self.bytes_expected = self.declared_size;
        self.progress_percent = 0;
        self.eta_seconds = 0;
        self.speed_bytes_per_sec = 0;
        self.install_progress_percent = 0;
        self.is_finalizing = false;
    }

    /// A candidate is compatible when it is not older than the running build.
    pub fn is_compatible(&self, build_version: &str, build_timestamp: i64) -> bool {
        self.version.as_str() >= build_version && self.timestamp > build_timestamp
    }

    /// Installable means compatible and built for the running version line.
    pub fn can_install(&self, build_version: &str, build_timestamp: i64) -> bool {
        self.timestamp > build_timestamp && self.version.eq_ignore_ascii_case(build_version)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusFix {
    Valid,
    Invalid,
}

/// Restore the status invariants of a (re)loaded record. If the durable
/// status claims a backing file that no longer exists, the record is forced
/// back to `Unknown`. Otherwise the progress is recomputed from the actual
/// file length so a resumed listener reflects reality immediately.
pub fn fix_status(record: &mut UpdateRecord, file_len: Option<u64>) -> StatusFix {
    match record.persistent_status {
        PersistentStatus::Verified | PersistentStatus::Incomplete if file_len.is_none() => {
            record.status = UpdateStatus::Unknown;
            record.persistent_status = PersistentStatus::Unknown;
            record.progress_percent = 0;
            record.local_file_path = None;
            StatusFix::Invalid
        }
        _ => {
            if record.declared_size > 0 {
                if let Some(len) = file_len {
                    let percent = len.saturating_mul(100) / record.declared_size;
                    record.set_progress(percent.min(100) as i32);
                }
            }
            StatusFix::Valid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> UpdateDescriptor {
        serde_json::from_str(
            r#"{
                "id": "u1",
                "filename": "ota-2024.zip",
                "size": 1000,
                "datetime": 170000000,
                "version": "12",
                "filehash": "abc",
                "url": "https://example.com/ota-2024.zip"
            }"#,
        )
        .expect("parse descriptor")
    }

    #[test]
    fn descriptor_optionals_default_to_empty() {
        let parsed = descriptor();
        assert_eq!(parsed.donate_url, "");
        assert_eq!(parsed.news_url, "");
        assert!(parsed.maintainers.is_empty());
    }

    #[test]
    fn status_maps_to_coarse_persistent_status() {
        assert_eq!(
            UpdateStatus::Downloading.persistent(),
            PersistentStatus::Incomplete
        );
        assert_eq!(UpdateStatus::Paused.persistent(), PersistentStatus::Incomplete);
        assert_eq!(UpdateStatus::Verified.persistent(), PersistentStatus::Verified);
        assert_eq!(
            UpdateStatus::InstallationSuspended.persistent(),
            PersistentStatus::InstallingUpdate
        );
        assert_eq!(UpdateStatus::Installed.persistent(), PersistentStatus::Unknown);
    }

    #[test]
    fn persistent_status_round_trips_through_storage_form() {
        for status in [
            PersistentStatus::Unknown,
            PersistentStatus::Incomplete,
            PersistentStatus::Verified,
            PersistentStatus::InstallingUpdate,
        ] {
            assert_eq!(PersistentStatus::parse(status.as_str()), status);
        }
        assert_eq!(PersistentStatus::parse("garbage"), PersistentStatus::Unknown);
    }

    #[test]
    fn fix_status_invalidates_stale_persisted_state() {
        let mut record = UpdateRecord::from_descriptor(&descriptor(), true);
        record.persistent_status = PersistentStatus::Verified;
        record.status = UpdateStatus::Verified;
        record.local_file_path = Some("/nonexistent/ota-2024.zip".into());

        assert_eq!(fix_status(&mut record, None), StatusFix::Invalid);
        assert_eq!(record.status, UpdateStatus::Unknown);
        assert_eq!(record.persistent_status, PersistentStatus::Unknown);
    }

    #[test]
    fn fix_status_recomputes_progress_from_file_length() {
        let mut record = UpdateRecord::from_descriptor(&descriptor(), true);
        record.persistent_status = PersistentStatus::Incomplete;

        assert_eq!(fix_status(&mut record, Some(250)), StatusFix::Valid);
        assert_eq!(record.progress_percent, 25);

        assert_eq!(fix_status(&mut record, Some(5000)), StatusFix::Valid);
        assert_eq!(record.progress_percent, 100);
    }

    #[test]
    fn compatibility_requires_newer_timestamp() {
        let mut record = UpdateRecord::from_descriptor(&descriptor(), true);
        assert!(record.is_compatible("12", 160000000));
        assert!(!record.is_compatible("12", 170000000));
        assert!(!record.is_compatible("13", 160000000));
        record.version = "13".to_string();
        assert!(record.is_compatible("12", 160000000));
        assert!(!record.can_install("12", 160000000));
        assert!(record.can_install("13", 160000000));
    }
}
