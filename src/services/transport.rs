use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::errors::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferControl {
    Running,
    Cancelled,
}

/// Cancellation handle for one transfer. Cancelling after the transfer has
/// already completed is a no-op.
#[derive(Clone)]
pub struct TransferHandle {
    control: watch::Sender<TransferControl>,
}

impl TransferHandle {
    pub fn channel() -> (Self, watch::Receiver<TransferControl>) {
        let (control, receiver) = watch::channel(TransferControl::Running);
        (Self { control }, receiver)
    }

    pub fn cancel(&self) {
        let _ = self.control.send(TransferControl::Cancelled);
    }
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Reissue as a range request continuing an existing partial file.
    pub resume: bool,
}

/// Callbacks a transport delivers for one transfer. All methods are invoked
/// from the transfer task, never from the caller of `start`.
pub trait TransferObserver: Send + Sync + 'static {
    fn on_response(&self, content_length: Option<u64>);
    fn on_progress(&self, bytes_read: u64, content_length: u64, speed: u64, eta_seconds: u64);
    fn on_success(&self, destination: &Path);
    fn on_failure(&self, cancelled: bool);
}

/// Injected download capability. `start` must return immediately; the
/// transfer itself runs in the background.
pub trait DownloadTransport: Send + Sync {
    fn start(&self, request: TransferRequest, observer: Arc<dyn TransferObserver>)
        -> TransferHandle;
}

/// Production transport over reqwest with range-based resume.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownloadTransport for HttpTransport {
    fn start(
        &self,
        request: TransferRequest,
        observer: Arc<dyn TransferObserver>,
    ) -> TransferHandle {
        let (handle, control) = TransferHandle::channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            match run_transfer(client, &request, observer.clone(), control).await {
                Ok(TransferOutcome::Done) => observer.on_success(&request.destination),
                Ok(TransferOutcome::Cancelled) => observer.on_failure(true),
                Err(err) => {
                    tracing::error!("transfer of {} failed: {err}", request.url);
                    observer.on_failure(false);
                }
            }
        });
        handle
    }
}

enum TransferOutcome {
    Done,
    Cancelled,
}

async fn run_transfer(
    client: reqwest::Client,
    request: &TransferRequest,
    observer: Arc<dyn TransferObserver>,
    mut control: watch::Receiver<TransferControl>,
) -> Result<TransferOutcome> {
    let mut existing: u64 = 0;
    if request.resume {
        existing = tokio::fs::metadata(&request.destination)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);
    }

    let mut builder = client.get(&request.url);
    if existing > 0 {
        builder = builder.header(reqwest::header::RANGE, format!("bytes={existing}-"));
    }
    let response = builder.send().await?.error_for_status()?;

    // A server that ignores the range request replies 200 with the whole
    // body; restart the file in that case.
    if existing > 0 && response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        existing = 0;
    }
    let content_length = response.content_length().map(|length| length + existing);
    observer.on_response(content_length);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(existing > 0)
        .truncate(existing == 0)
        .open(&request.destination)
        .await?;

    let total = content_length.unwrap_or(0);
    let mut bytes_read = existing;
    let started = Instant::now();
    let mut stream = response.bytes_stream();

    loop {
        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == TransferControl::Cancelled {
                    return Ok(TransferOutcome::Cancelled);
                }
            }
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                bytes_read += chunk.len() as u64;

                let elapsed = started.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    ((bytes_read - existing) as f64 / elapsed) as u64
                } else {
                    0
                };
                let eta = if speed > 0 && total > bytes_read {
                    (total - bytes_read) / speed
                } else {
                    0
                };
                observer.on_progress(bytes_read, total, speed, eta);
            }
        }
    }

    file.flush().await?;
    Ok(TransferOutcome::Done)
}
