//! Fakes for the core's collaborators

use crate::engine::{TransferEngine, TransferRequest};
use crate::error::ChimeraError;
use crate::files::FileProbe;
use crate::persistence::DownloadStore;
use crate::resolver::{LinkResolver, ResolvedLink};
use async_trait::async_trait;
use chimera_types::{Download, DownloadState, Downloader, TransferProgress};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as Gate, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// In-progress record at `/d/<url>` of a 1000 byte file
pub fn progress_record(url: &str, downloaded_bytes: u64) -> Download {
    Download {
        url: url.to_string(),
        original_url: url.to_string(),
        path: Some(PathBuf::from(format!("/d/{}", url))),
        title: format!("Title {}", url),
        remote_id: "1".to_string(),
        downloader: Downloader::Unknown,
        content_length: Some(1000),
        state: DownloadState::Progress(TransferProgress {
            progress_percentage: downloaded_bytes as f64 / 10.0,
            downloaded_bytes,
            download_speed: 100,
            eta: 5,
        }),
    }
}

/// Serve one canned HTTP response on a local port. Returns the base url
/// and a handle yielding the raw request.
pub async fn serve_once(response: Vec<u8>) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request_complete(&request) {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket.write_all(&response).await.unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).to_string()
    });
    (format!("http://{}", addr), handle)
}

/// Headers and the whole `Content-Length` body have arrived
fn request_complete(request: &[u8]) -> bool {
    let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
    let body_len = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|len| len.trim().parse::<usize>().ok())
        .unwrap_or(0);
    request.len() >= end + 4 + body_len
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Start(TransferRequest),
    Pause(String),
    Abort(String),
}

/// Records every command; never emits events by itself
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    fail_start: AtomicBool,
    start_gate: Arc<Gate<()>>,
}

impl FakeEngine {
    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Park every `start` until the guard is dropped
    pub async fn hold_starts(&self) -> OwnedMutexGuard<()> {
        self.start_gate.clone().lock_owned().await
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn starts(&self) -> Vec<TransferRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Start(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn pauses(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Pause(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Abort(url) => Some(url),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TransferEngine for FakeEngine {
    async fn start(&self, request: TransferRequest) -> Result<(), ChimeraError> {
        let _open = self.start_gate.lock().await;
        self.calls.lock().push(EngineCall::Start(request));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ChimeraError::StatusCode(503));
        }
        Ok(())
    }

    async fn pause(&self, url: &str) -> Result<(), ChimeraError> {
        self.calls.lock().push(EngineCall::Pause(url.to_string()));
        Ok(())
    }

    async fn abort(&self, url: &str) -> Result<(), ChimeraError> {
        self.calls.lock().push(EngineCall::Abort(url.to_string()));
        Ok(())
    }
}

/// Hands out `<url>?token=<n>` (`&token=<n>` when the url has a query),
/// a fresh token per call
#[derive(Default)]
pub struct FakeResolver {
    resolved: Mutex<Vec<String>>,
    failing: AtomicBool,
    gate: Arc<Gate<()>>,
}

impl FakeResolver {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolved.lock().len()
    }

    /// Every url asked for, in order
    pub fn resolved_urls(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }

    /// Park every `resolve` until the guard is dropped
    pub async fn hold(&self) -> OwnedMutexGuard<()> {
        self.gate.clone().lock_owned().await
    }
}

#[async_trait]
impl LinkResolver for FakeResolver {
    async fn resolve(
        &self,
        url: &str,
        _downloader: Downloader,
    ) -> Result<ResolvedLink, ChimeraError> {
        let _open = self.gate.lock().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChimeraError::resolution(url, "host unavailable"));
        }
        let n = {
            let mut resolved = self.resolved.lock();
            resolved.push(url.to_string());
            resolved.len()
        };
        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(ResolvedLink {
            fetch_url: format!("{}{}token={}", url, separator, n),
            headers: vec![("Cookie".to_string(), format!("token={}", n))],
            file_name: None,
        })
    }
}

/// Filesystem holding only the paths it was given
#[derive(Default)]
pub struct FakeFiles {
    existing: Mutex<HashSet<PathBuf>>,
    deleted: Mutex<Vec<PathBuf>>,
    broken: AtomicBool,
}

impl FakeFiles {
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let files = Self::default();
        files
            .existing
            .lock()
            .extend(paths.into_iter().map(Into::into));
        files
    }

    /// Make every probe fail
    pub fn break_probe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<PathBuf> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl FileProbe for FakeFiles {
    async fn exists(&self, path: &Path) -> Result<bool, ChimeraError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ChimeraError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "probe failed",
            )));
        }
        Ok(self.existing.lock().contains(path))
    }

    async fn delete(&self, path: &Path) -> Result<(), ChimeraError> {
        if !self.existing.lock().remove(path) {
            return Err(ChimeraError::Io(std::io::ErrorKind::NotFound.into()));
        }
        self.deleted.lock().push(path.to_path_buf());
        Ok(())
    }
}

/// Process-local store. Writes can be held back with [`MemoryStore::hold`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    downloads: Arc<Mutex<Option<Vec<Download>>>>,
    gate: Arc<Gate<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `downloads`
    pub fn with_downloads(downloads: Vec<Download>) -> Self {
        Self {
            downloads: Arc::new(Mutex::new(Some(downloads))),
            ..Self::default()
        }
    }

    /// What the last `set` wrote
    pub fn snapshot(&self) -> Option<Vec<Download>> {
        self.downloads.lock().clone()
    }

    /// Block every `set` until the guard is dropped
    pub async fn hold(&self) -> OwnedMutexGuard<()> {
        self.gate.clone().lock_owned().await
    }
}

#[async_trait]
impl DownloadStore for MemoryStore {
    async fn get(&self) -> Result<Option<Vec<Download>>, ChimeraError> {
        Ok(self.downloads.lock().clone())
    }

    async fn set(&self, downloads: &[Download]) -> Result<(), ChimeraError> {
        let _open = self.gate.lock().await;
        *self.downloads.lock() = Some(downloads.to_vec());
        Ok(())
    }
}
