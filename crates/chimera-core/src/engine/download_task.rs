//! Transfer task - streams one HTTP response to disk
//!
//! Pause and abort requests are only looked at when a progress checkpoint
//! is due, so both take effect up to one progress interval after they were
//! requested.

use crate::engine::EventSink;
use crate::error::ChimeraError;
use chimera_types::{EngineEvent, TransferProgress};
use futures::StreamExt;
use reqwest::Response;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

/// Pause/abort flags shared between the engine and a running task
#[derive(Debug, Default)]
pub struct TransferControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl TransferControl {
    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn request_abort(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Speed, ETA and percentage for the current session.
///
/// Speed only counts bytes fetched since this session started so a resumed
/// transfer does not report the bytes of earlier sessions as instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferMeter {
    session_start_offset: u64,
    content_length: Option<u64>,
}

impl TransferMeter {
    pub fn new(session_start_offset: u64, content_length: Option<u64>) -> Self {
        Self {
            session_start_offset,
            content_length,
        }
    }

    pub fn snapshot(&self, downloaded_bytes: u64, elapsed: Duration) -> TransferProgress {
        let session_bytes = downloaded_bytes.saturating_sub(self.session_start_offset);
        let secs = elapsed.as_secs_f64();
        let download_speed = if secs > 0.0 {
            (session_bytes as f64 / secs) as u64
        } else {
            0
        };

        let (progress_percentage, eta) = match self.content_length {
            Some(total) if total > 0 => {
                let remaining = total.saturating_sub(downloaded_bytes);
                let eta = if download_speed > 0 {
                    remaining / download_speed
                } else {
                    0
                };
                let percentage = (downloaded_bytes as f64 / total as f64 * 100.0).min(100.0);
                (percentage, eta)
            }
            _ => (0.0, 0),
        };

        TransferProgress {
            progress_percentage,
            downloaded_bytes,
            download_speed,
            eta,
        }
    }
}

/// How a transfer ended: the terminal event still to be reported and the
/// failure behind it, if any
#[derive(Debug)]
pub struct TransferEnd {
    pub event: EngineEvent,
    pub error: Option<ChimeraError>,
}

impl TransferEnd {
    fn ok(event: EngineEvent) -> Self {
        Self { event, error: None }
    }
}

enum Outcome {
    Finished,
    Paused,
    Aborted,
    Failed(ChimeraError),
}

/// One running transfer; owns the response stream and the file handle
pub struct TransferTask {
    url: String,
    destination: PathBuf,
    response: Response,
    file: File,
    offset: u64,
    content_length: Option<u64>,
    progress_interval: Duration,
    control: std::sync::Arc<TransferControl>,
    events: EventSink,
}

impl TransferTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        destination: PathBuf,
        response: Response,
        file: File,
        offset: u64,
        content_length: Option<u64>,
        progress_interval: Duration,
        control: std::sync::Arc<TransferControl>,
        events: EventSink,
    ) -> Self {
        Self {
            url,
            destination,
            response,
            file,
            offset,
            content_length,
            progress_interval,
            control,
            events,
        }
    }

    /// Stream the body to disk, emitting `started` and `progress` events.
    ///
    /// The terminal event (`completed`, `paused` or `aborted`) is returned
    /// instead of sent, for the owner to report once it has let go of the
    /// transfer.
    pub async fn run(self) -> TransferEnd {
        let TransferTask {
            url,
            destination,
            response,
            file,
            offset,
            content_length,
            progress_interval,
            control,
            events,
        } = self;
        let emit = |event: EngineEvent| {
            // The coordinator may be gone during shutdown
            let _ = events.send(event);
        };

        emit(EngineEvent::Started {
            url: url.clone(),
            path: destination.clone(),
            content_length,
        });
        info!(
            "Transfer started: {} -> {} (offset {}, length {:?})",
            url,
            destination.display(),
            offset,
            content_length
        );

        let meter = TransferMeter::new(offset, content_length);
        let started_at = Instant::now();
        let mut last_checkpoint = Instant::now();
        let mut downloaded_bytes = offset;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();

        let outcome = loop {
            let chunk = match stream.next().await {
                None => break Outcome::Finished,
                Some(Err(e)) => break Outcome::Failed(e.into()),
                Some(Ok(chunk)) => chunk,
            };

            if let Err(e) = writer.write_all(&chunk).await {
                break Outcome::Failed(e.into());
            }
            downloaded_bytes += chunk.len() as u64;

            if last_checkpoint.elapsed() < progress_interval {
                continue;
            }

            if control.is_cancelled() {
                break Outcome::Aborted;
            }

            let progress = meter.snapshot(downloaded_bytes, started_at.elapsed());
            emit(EngineEvent::Progress {
                url: url.clone(),
                progress_percentage: progress.progress_percentage,
                downloaded_bytes: progress.downloaded_bytes,
                download_speed: progress.download_speed,
                eta: progress.eta,
            });
            last_checkpoint = Instant::now();

            if control.is_paused() {
                break Outcome::Paused;
            }
        };

        // A body that ended while an abort was pending is still aborted
        let outcome = match outcome {
            Outcome::Finished if control.is_cancelled() => Outcome::Aborted,
            other => other,
        };

        match outcome {
            Outcome::Finished => {
                if let Err(e) = writer.shutdown().await {
                    return fail(&url, &destination, e.into()).await;
                }
                info!("Transfer completed: {} ({} bytes)", url, downloaded_bytes);
                TransferEnd::ok(EngineEvent::Completed { url })
            }
            Outcome::Paused => {
                if let Err(e) = writer.shutdown().await {
                    return fail(&url, &destination, e.into()).await;
                }
                info!("Transfer paused: {} at {} bytes", url, downloaded_bytes);
                TransferEnd::ok(EngineEvent::Paused { url })
            }
            Outcome::Aborted => {
                let _ = writer.shutdown().await;
                drop(writer);
                remove_partial(&destination).await;
                info!("Transfer aborted: {}", url);
                TransferEnd::ok(EngineEvent::Aborted { url })
            }
            Outcome::Failed(e) => {
                let _ = writer.shutdown().await;
                drop(writer);
                fail(&url, &destination, e).await
            }
        }
    }
}

/// Mid-stream failures end the transfer as aborted
async fn fail(url: &str, destination: &std::path::Path, error: ChimeraError) -> TransferEnd {
    error!("Transfer failed: {} - {}", url, error);
    remove_partial(destination).await;
    TransferEnd {
        event: EngineEvent::Aborted {
            url: url.to_string(),
        },
        error: Some(error),
    }
}

async fn remove_partial(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}
