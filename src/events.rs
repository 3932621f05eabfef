use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::UpdateStatus;

/// Change events the orchestrator publishes to its listeners.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    StatusChanged {
        download_id: String,
        status: UpdateStatus,
    },
    DownloadProgress {
        download_id: String,
    },
    InstallProgress {
        download_id: String,
    },
    Removed {
        download_id: String,
    },
    NetworkUnavailable,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Status(String),
    Network,
}

/// Broadcasts change events. Status changes are emitted after a short delay
/// so a listener that is still binding has time to subscribe; a newer status
/// for the same update supersedes a pending emit. Progress and removal
/// events are emitted immediately.
#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<UpdateEvent>,
    delay: Duration,
    runtime: Handle,
    pending: Arc<Mutex<HashMap<PendingKey, JoinHandle<()>>>>,
}

impl ChangeNotifier {
    /// Must be constructed inside a tokio runtime; the captured handle lets
    /// the notify methods be called from any thread afterwards.
    pub fn new(delay: Duration) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            delay,
            runtime: Handle::current(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    pub fn notify_status(&self, download_id: &str, status: UpdateStatus) {
        self.deferred(
            PendingKey::Status(download_id.to_string()),
            UpdateEvent::StatusChanged {
                download_id: download_id.to_string(),
                status,
            },
        );
    }

    pub fn notify_network_unavailable(&self) {
        self.deferred(PendingKey::Network, UpdateEvent::NetworkUnavailable);
    }

    pub fn notify_download_progress(&self, download_id: &str) {
        let _ = self.sender.send(UpdateEvent::DownloadProgress {
            download_id: download_id.to_string(),
        });
    }

    pub fn notify_install_progress(&self, download_id: &str) {
        let _ = self.sender.send(UpdateEvent::InstallProgress {
            download_id: download_id.to_string(),
        });
    }

    pub fn notify_removed(&self, download_id: &str) {
        let _ = self.sender.send(UpdateEvent::Removed {
            download_id: download_id.to_string(),
        });
    }

    fn deferred(&self, key: PendingKey, event: UpdateEvent) {
        let sender = self.sender.clone();
        let delay = self.delay;
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(event);
        });
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.insert(key, handle) {
                previous.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn status_event_is_delayed_not_lost() {
        let notifier = ChangeNotifier::new(Duration::from_millis(50));
        notifier.notify_status("u1", UpdateStatus::Starting);

        // Subscribing after the trigger still receives the event: that is
        // the point of the delay.
        let mut receiver = notifier.subscribe();
        let event = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        match event {
            UpdateEvent::StatusChanged {
                download_id,
                status,
            } => {
                assert_eq!(download_id, "u1");
                assert_eq!(status, UpdateStatus::Starting);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn newer_status_supersedes_pending_emit() {
        let notifier = ChangeNotifier::new(Duration::from_millis(50));
        let mut receiver = notifier.subscribe();

        notifier.notify_status("u1", UpdateStatus::Starting);
        notifier.notify_status("u1", UpdateStatus::Downloading);

        let event = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        match event {
            UpdateEvent::StatusChanged { status, .. } => {
                assert_eq!(status, UpdateStatus::Downloading);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Nothing further: the superseded emit was cancelled.
        assert!(
            timeout(Duration::from_millis(150), receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn notifications_work_from_plain_threads() {
        let notifier = ChangeNotifier::new(Duration::from_millis(10));
        let mut receiver = notifier.subscribe();

        // Callers like a pause from a host-owned thread have no runtime
        // context of their own; the captured handle covers them.
        let off_runtime = notifier.clone();
        std::thread::spawn(move || {
            off_runtime.notify_status("u1", UpdateStatus::Paused);
        })
        .join()
        .expect("notify thread");

        let event = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        assert!(matches!(
            event,
            UpdateEvent::StatusChanged {
                status: UpdateStatus::Paused,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn progress_events_emit_immediately() {
        let notifier = ChangeNotifier::new(Duration::from_secs(5));
        let mut receiver = notifier.subscribe();
        notifier.notify_download_progress("u1");
        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("no delay for progress")
            .expect("channel open");
        assert!(matches!(event, UpdateEvent::DownloadProgress { .. }));
    }
}
