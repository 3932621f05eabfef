pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::UpdaterConfig;
pub use errors::{Result, UpdaterError};
pub use events::{ChangeNotifier, UpdateEvent};
pub use models::{
    Maintainer, PersistentStatus, UpdateDescriptor, UpdateRecord, UpdateStatus,
};
pub use services::{
    ApplierObserver, ApplierStatus, DownloadTransport, HttpTransport, NoopWakeLock,
    PayloadApplier, RecoveryInstaller, UpdateOrchestrator, WakeLock,
};
