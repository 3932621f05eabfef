use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration for the orchestrator. Everything here is a plain
/// value so a host can deserialize it from JSON or build it by hand.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Directory where update packages are downloaded and staged.
    pub download_dir: PathBuf,
    /// Path of the sqlite database holding the durable status keys.
    pub db_path: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Version string of the currently installed build, used for the
    /// compatibility filter.
    pub build_version: String,
    /// UTC timestamp of the currently installed build.
    pub build_timestamp: i64,
    /// Whether the device supports seamless (streaming) installs.
    pub ab_device: bool,
    /// Whether legacy installs go through the recovery environment.
    pub recovery_update: bool,
    /// Whether the storage holding downloads is encrypted. When true the
    /// legacy path must stage a plaintext copy before handing off.
    pub storage_encrypted: bool,
    /// Delay before a status change notification is broadcast. A tunable,
    /// not a contract; it only exists so a freshly binding listener has
    /// time to subscribe.
    pub notify_delay_ms: u64,
    /// Extension appended to the staging copy used by the legacy path.
    pub uncrypt_file_ext: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ota-updater");
        Self {
            download_dir: data_dir.join("downloads"),
            db_path: data_dir.join("updater.db"),
            log_dir: data_dir.join("logs"),
            build_version: String::new(),
            build_timestamp: 0,
            ab_device: true,
            recovery_update: false,
            storage_encrypted: false,
            notify_delay_ms: 500,
            uncrypt_file_ext: ".uncrypt".to_string(),
        }
    }
}

impl UpdaterConfig {
    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }
}
