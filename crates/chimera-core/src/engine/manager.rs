//! HTTP transfer engine - owns all running transfers
//!
//! Starts transfers (optionally resuming with a byte range), keeps one
//! control handle per fetch url and forwards pause/abort requests to it.

use crate::engine::{EventSink, TransferControl, TransferEngine, TransferRequest, TransferTask};
use crate::error::ChimeraError;
use async_trait::async_trait;
use chimera_types::{EngineEvent, Settings};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// reqwest-backed [`TransferEngine`]
pub struct HttpTransferEngine {
    /// Running transfers keyed by fetch url
    active: Arc<RwLock<HashMap<String, Arc<TransferControl>>>>,
    client: Client,
    progress_interval: Duration,
    events: EventSink,
}

impl HttpTransferEngine {
    /// Create an engine configured from settings
    pub fn new(settings: &Settings, events: EventSink) -> Result<Self, ChimeraError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .redirect(Policy::limited(settings.max_redirects))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self::with_client(
            client,
            Duration::from_millis(settings.progress_interval_ms),
            events,
        ))
    }

    pub fn with_client(client: Client, progress_interval: Duration, events: EventSink) -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            client,
            progress_interval,
            events,
        }
    }

    #[cfg(test)]
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_active(&self, url: &str) -> bool {
        self.active.read().await.contains_key(url)
    }

    async fn open_transfer(
        &self,
        request: &TransferRequest,
        control: Arc<TransferControl>,
    ) -> Result<TransferTask, ChimeraError> {
        let headers = build_headers(request.headers.as_deref())?;
        let requested_offset = resume_offset(request.headers.as_deref());

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self
            .client
            .get(&request.url)
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        // Hosts like Gofile throttle guests
        if status == StatusCode::TOO_MANY_REQUESTS {
            let _ = self.events.send(EngineEvent::RateLimitExceeded {
                url: request.url.clone(),
            });
            return Err(ChimeraError::StatusCode(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ChimeraError::StatusCode(status.as_u16()));
        }

        // A resume never restarts from byte 0; the partial file is kept
        let resumed = requested_offset > 0;
        if resumed && status != StatusCode::PARTIAL_CONTENT {
            warn!(
                "Server ignored range request for {} (status {})",
                request.url,
                status.as_u16()
            );
            return Err(ChimeraError::RequestFailed(format!(
                "{} does not support resuming at byte {}",
                request.url, requested_offset
            )));
        }
        let offset = requested_offset;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(&request.destination)
            .await?;

        let content_length = response.content_length().map(|len| offset + len);

        Ok(TransferTask::new(
            request.url.clone(),
            request.destination.clone(),
            response,
            file,
            offset,
            content_length,
            self.progress_interval,
            control,
            self.events.clone(),
        ))
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn start(&self, request: TransferRequest) -> Result<(), ChimeraError> {
        let url = request.url.clone();
        let control = Arc::new(TransferControl::default());

        // Reserve the url before any I/O so a second start cannot race us
        {
            let mut active = self.active.write().await;
            if active.contains_key(&url) {
                warn!("Transfer {} is already running", url);
                return Err(ChimeraError::Other(format!(
                    "transfer {} is already running",
                    url
                )));
            }
            active.insert(url.clone(), control.clone());
        }

        info!(
            "Starting transfer {} -> {}",
            url,
            request.destination.display()
        );

        let task = match self.open_transfer(&request, control).await {
            Ok(task) => task,
            Err(e) => {
                self.active.write().await.remove(&url);
                return Err(e);
            }
        };

        let active = self.active.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let end = task.run().await;
            // The url is free before anyone hears the transfer ended
            active.write().await.remove(&url);
            if let Some(e) = &end.error {
                debug!("Transfer task {} ended with error: {}", url, e);
            }
            let _ = events.send(end.event);
        });

        Ok(())
    }

    async fn pause(&self, url: &str) -> Result<(), ChimeraError> {
        match self.active.read().await.get(url) {
            Some(control) => {
                control.request_pause();
                info!("Signaled pause for transfer {}", url);
            }
            None => debug!("Pause requested for idle transfer {}", url),
        }
        Ok(())
    }

    async fn abort(&self, url: &str) -> Result<(), ChimeraError> {
        match self.active.read().await.get(url) {
            Some(control) => {
                control.request_abort();
                info!("Signaled abort for transfer {}", url);
            }
            None => debug!("Abort requested for idle transfer {}", url),
        }
        Ok(())
    }
}

fn build_headers(custom: Option<&[(String, String)]>) -> Result<HeaderMap, ChimeraError> {
    let mut headers = HeaderMap::new();

    for (name, value) in custom.unwrap_or_default() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ChimeraError::ParsingFailed(format!("header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ChimeraError::ParsingFailed(format!("header value for {}: {}", name, e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Byte offset requested by a `Range: bytes=<n>-` header, 0 when absent
fn resume_offset(custom: Option<&[(String, String)]>) -> u64 {
    custom
        .unwrap_or_default()
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| value.trim().strip_prefix("bytes="))
        .and_then(|range| range.split('-').next())
        .and_then(|start| start.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    /// Serve one canned response at `/file.bin`
    async fn serve_once(response: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let (base, server) = crate::testing::serve_once(response).await;
        (format!("{}/file.bin", base), server)
    }

    fn engine(events: EventSink) -> HttpTransferEngine {
        let client = Client::builder().no_proxy().build().unwrap();
        HttpTransferEngine::with_client(client, Duration::ZERO, events)
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("chimera-engine-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_resume_offset() {
        assert_eq!(resume_offset(None), 0);
        assert_eq!(resume_offset(Some(&headers(&[("Range", "bytes=4096-")]))), 4096);
        assert_eq!(
            resume_offset(Some(&headers(&[("Cookie", "a=b"), ("range", "bytes=12-")]))),
            12
        );
        assert_eq!(resume_offset(Some(&headers(&[("Range", "garbage")]))), 0);
    }

    #[test]
    fn test_build_headers_rejects_invalid() {
        let ok = build_headers(Some(&headers(&[("Cookie", "accountToken=t")]))).unwrap();
        assert_eq!(ok.get("cookie").unwrap(), "accountToken=t");

        let err = build_headers(Some(&headers(&[("bad header", "x")]))).unwrap_err();
        assert!(matches!(err, ChimeraError::ParsingFailed(_)));
    }

    #[tokio::test]
    async fn test_idle_pause_and_abort_are_noops() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        assert!(engine.pause("https://nowhere/a").await.is_ok());
        assert!(engine.abort("https://nowhere/a").await.is_ok());
        assert!(!engine.is_active("https://nowhere/a").await);
        assert_eq!(engine.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_transfer_emits_started_progress_completed() {
        let body = b"0123456789";
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(body);
        let (url, server) = serve_once(response).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        let destination = temp_path("full.bin");

        engine
            .start(TransferRequest {
                url: url.clone(),
                destination: destination.clone(),
                headers: None,
            })
            .await
            .unwrap();
        server.await.unwrap();

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
            match event {
                EngineEvent::Started { content_length, .. } => assert_eq!(content_length, Some(10)),
                EngineEvent::Completed { url: done } => {
                    assert_eq!(done, url);
                    // Free for a new start the moment the end is reported
                    assert!(!engine.is_active(&url).await);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(kinds.first(), Some(&"started"));
        assert_eq!(kinds.last(), Some(&"completed"));
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
        let _ = tokio::fs::remove_file(&destination).await;
    }

    #[tokio::test]
    async fn test_resume_sends_range_and_appends() {
        let destination = temp_path("resume.bin");
        tokio::fs::create_dir_all(destination.parent().unwrap()).await.unwrap();
        tokio::fs::write(&destination, b"0123").await.unwrap();

        let mut response =
            b"HTTP/1.1 206 Partial Content\r\nContent-Length: 6\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(b"456789");
        let (url, server) = serve_once(response).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        engine
            .start(TransferRequest {
                url,
                destination: destination.clone(),
                headers: Some(headers(&[("Range", "bytes=4-")])),
            })
            .await
            .unwrap();

        let request = server.await.unwrap().to_lowercase();
        assert!(request.contains("range: bytes=4-"));

        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Started { content_length, .. } => assert_eq!(content_length, Some(10)),
                EngineEvent::Completed { .. } => break,
                _ => {}
            }
        }
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"0123456789");
        let _ = tokio::fs::remove_file(&destination).await;
    }

    #[tokio::test]
    async fn test_resume_answered_with_full_body_fails() {
        let destination = temp_path("no-range.bin");
        tokio::fs::create_dir_all(destination.parent().unwrap()).await.unwrap();
        tokio::fs::write(&destination, b"0123").await.unwrap();

        let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(b"0123456789");
        let (url, server) = serve_once(response).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        let err = engine
            .start(TransferRequest {
                url,
                destination: destination.clone(),
                headers: Some(headers(&[("Range", "bytes=4-")])),
            })
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, ChimeraError::RequestFailed(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.active_count().await, 0);
        // Nothing already downloaded is lost
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"0123");
        let _ = tokio::fs::remove_file(&destination).await;
    }

    #[tokio::test]
    async fn test_second_start_of_running_transfer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/slow.bin", listener.local_addr().unwrap());
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n01234")
                .await
                .unwrap();
            let _ = released.await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        let request = TransferRequest {
            url: url.clone(),
            destination: temp_path("slow.bin"),
            headers: None,
        };
        engine.start(request.clone()).await.unwrap();
        assert!(engine.is_active(&url).await);

        let err = engine.start(request).await.unwrap_err();
        assert!(matches!(err, ChimeraError::Other(_)));

        engine.abort(&url).await.unwrap();
        release.send(()).unwrap();
        server.await.unwrap();
        while let Some(event) = rx.recv().await {
            if let EngineEvent::Aborted { .. } = event {
                break;
            }
        }
        assert!(!engine.is_active(&url).await);
    }

    #[tokio::test]
    async fn test_rate_limited_start_fails_and_notifies() {
        let (url, server) = serve_once(
            b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        let err = engine
            .start(TransferRequest {
                url: url.clone(),
                destination: temp_path("limited.bin"),
                headers: None,
            })
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(err.is_rate_limited());
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::RateLimitExceeded { url });
        assert_eq!(engine.active_count().await, 0);
    }
}
