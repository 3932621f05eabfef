pub mod download_coordinator;
pub mod hash_verifier;
pub mod install_coordinator;
pub mod orchestrator;
pub mod payload_locator;
pub(crate) mod registry;
pub mod transport;

pub use download_coordinator::DownloadCoordinator;
pub use install_coordinator::{
    ApplierObserver, ApplierStatus, InstallCoordinator, PayloadApplier, RecoveryInstaller,
};
pub use orchestrator::UpdateOrchestrator;
pub use registry::{NoopWakeLock, WakeLock};
pub use transport::{
    DownloadTransport, HttpTransport, TransferHandle, TransferObserver, TransferRequest,
};
