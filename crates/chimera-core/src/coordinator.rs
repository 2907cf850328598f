//! Lifecycle coordinator
//!
//! Turns user actions into engine commands and engine events into registry
//! changes. Engine events carry the url a transfer was *fetched* from, which
//! differs from the canonical url a download is tracked under and changes
//! on every resume, so in-flight transfers are kept in a route table.
//!
//! All event handling goes through [`LifecycleCoordinator::handle_event`],
//! fed by a single event loop, so events for one transfer are applied in
//! the order the engine sent them.

use crate::engine::{TransferEngine, TransferRequest};
use crate::error::ChimeraError;
use crate::files::FileProbe;
use crate::lifecycle::{apply, range_header, StartIntent, Transition};
use crate::persistence::DownloadStore;
use crate::registry::DownloadRegistry;
use crate::resolver::{canonical_url, file_name_from_title, LinkResolver};
use chimera_types::{CoreEvent, Download, DownloadState, Downloader, EngineEvent};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A user request to start downloading
#[derive(Debug, Clone)]
pub struct AddDownload {
    pub url: String,
    pub remote_id: String,
    pub title: String,
    /// Directory the file is written to
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Start command issued; the record appears once the engine confirms
    Started { fetch_url: String },
    /// The url is already tracked or being started
    AlreadyTracked,
    /// Aborted before the engine confirmed the start
    Aborted,
}

#[derive(Debug, Default)]
struct LifecycleState {
    /// Adds awaiting `started`, by fetch url
    intents: HashMap<String, StartIntent>,
    /// Fetch url -> canonical url of every in-flight transfer
    routes: HashMap<String, String>,
    /// Canonical urls with a start or resume in progress, by attempt id
    starting: HashMap<String, u64>,
    /// Attempts aborted before the engine reported `started`
    cancelled: HashSet<u64>,
    next_attempt: u64,
    /// Canonical urls with a pause issued but not yet acknowledged
    pause_requests: HashSet<String>,
}

impl LifecycleState {
    fn fetch_url_for(&self, url: &str) -> Option<String> {
        self.routes
            .iter()
            .find(|(_, canonical)| canonical.as_str() == url)
            .map(|(fetch, _)| fetch.clone())
    }

    fn canonical_for(&self, fetch_url: &str) -> String {
        self.routes
            .get(fetch_url)
            .cloned()
            .unwrap_or_else(|| fetch_url.to_string())
    }

    fn is_in_flight(&self, url: &str) -> bool {
        self.routes.values().any(|canonical| canonical == url)
    }

    /// Reserve `url` for a start or resume. `None` when one is underway.
    fn begin_start(&mut self, url: &str) -> Option<u64> {
        if self.starting.contains_key(url) {
            return None;
        }
        self.next_attempt += 1;
        self.starting.insert(url.to_string(), self.next_attempt);
        Some(self.next_attempt)
    }

    /// Whether `attempt` was aborted; clears the mark
    fn take_cancelled(&mut self, attempt: u64) -> bool {
        self.cancelled.remove(&attempt)
    }

    /// Undo a failed attempt unless an abort already cleared it
    fn abandon(&mut self, url: &str, attempt: u64) {
        self.cancelled.remove(&attempt);
        if self.starting.get(url) == Some(&attempt) {
            self.forget(url);
        }
    }

    /// Drop everything held for `url`
    fn forget(&mut self, url: &str) {
        self.routes.retain(|_, canonical| canonical != url);
        self.intents.retain(|_, intent| intent.url != url);
        self.starting.remove(url);
        self.pause_requests.remove(url);
    }
}

#[derive(Clone)]
pub struct LifecycleCoordinator {
    registry: DownloadRegistry,
    state: Arc<Mutex<LifecycleState>>,
    engine: Arc<dyn TransferEngine>,
    resolver: Arc<dyn LinkResolver>,
    store: Arc<dyn DownloadStore>,
    files: Arc<dyn FileProbe>,
    /// Serialises store writes so a stale snapshot never lands last
    persist_lock: Arc<tokio::sync::Mutex<()>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl LifecycleCoordinator {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        resolver: Arc<dyn LinkResolver>,
        store: Arc<dyn DownloadStore>,
        files: Arc<dyn FileProbe>,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            registry: DownloadRegistry::new(event_tx.clone()),
            state: Arc::new(Mutex::new(LifecycleState::default())),
            engine,
            resolver,
            store,
            files,
            persist_lock: Arc::new(tokio::sync::Mutex::new(())),
            event_tx,
        }
    }

    /// Read access for front ends
    pub fn registry(&self) -> &DownloadRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a start or resume for `url` awaits the engine's `started`
    pub fn is_starting(&self, url: &str) -> bool {
        self.state.lock().starting.contains_key(&canonical_url(url))
    }

    /// Whether a pause was issued for `url` and not yet acknowledged
    pub fn is_awaiting_pause(&self, url: &str) -> bool {
        self.state.lock().pause_requests.contains(&canonical_url(url))
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.state.lock().is_in_flight(&canonical_url(url))
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Resolve and start a new download.
    ///
    /// Every other active transfer is asked to pause first. Nothing is added
    /// to the registry until the engine reports `started`; on failure the
    /// registry is left untouched and the error returned. An abort that
    /// lands before `started` cancels the start.
    pub async fn add(&self, request: AddDownload) -> Result<AddOutcome, ChimeraError> {
        let original_url = request.url.trim().to_string();
        let downloader = Downloader::from_url(&original_url);
        let url = canonical_url(&original_url);

        let attempt = {
            let mut state = self.state.lock();
            let reserved = if self.registry.contains(&url) {
                None
            } else {
                state.begin_start(&url)
            };
            match reserved {
                Some(attempt) => attempt,
                None => {
                    debug!("Ignoring add for already tracked {}", url);
                    return Ok(AddOutcome::AlreadyTracked);
                }
            }
        };

        let intent = StartIntent {
            url: url.clone(),
            original_url,
            fetch_url: String::new(),
            title: request.title,
            remote_id: request.remote_id,
            downloader,
        };
        match self.start_new(attempt, intent, &request.directory).await {
            Ok(Some(fetch_url)) => Ok(AddOutcome::Started { fetch_url }),
            Ok(None) => Ok(AddOutcome::Aborted),
            Err(e) => {
                error!("Failed to start {}: {}", url, e);
                self.state.lock().abandon(&url, attempt);
                Err(e)
            }
        }
    }

    /// Returns the fetch url, or `None` when the add was aborted meanwhile
    async fn start_new(
        &self,
        attempt: u64,
        mut intent: StartIntent,
        directory: &Path,
    ) -> Result<Option<String>, ChimeraError> {
        // The source url, query included; the canonical url is only a key
        let link = self
            .resolver
            .resolve(&intent.original_url, intent.downloader)
            .await?;
        let file_name = link
            .file_name
            .clone()
            .unwrap_or_else(|| file_name_from_title(&intent.title));
        let destination = directory.join(file_name);

        let url = intent.url.clone();
        intent.fetch_url = link.fetch_url.clone();
        {
            let mut state = self.state.lock();
            if state.take_cancelled(attempt) {
                info!("Add of {} aborted while resolving", url);
                return Ok(None);
            }
            state.intents.insert(link.fetch_url.clone(), intent);
            state.routes.insert(link.fetch_url.clone(), url.clone());
        }

        self.pause_others(&url).await;

        info!("Starting {} -> {}", url, destination.display());
        self.engine
            .start(TransferRequest {
                url: link.fetch_url.clone(),
                destination,
                headers: (!link.headers.is_empty()).then_some(link.headers),
            })
            .await?;

        if self.cancel_if_aborted(attempt, &url, &link.fetch_url).await {
            return Ok(None);
        }
        Ok(Some(link.fetch_url))
    }

    /// An abort that raced `engine.start` may have reached the engine before
    /// the transfer existed; abort again now that it does
    async fn cancel_if_aborted(&self, attempt: u64, url: &str, fetch_url: &str) -> bool {
        if !self.state.lock().take_cancelled(attempt) {
            return false;
        }

        info!("{} was aborted while starting", url);
        if let Err(e) = self.engine.abort(fetch_url).await {
            warn!("Engine failed to abort {}: {}", url, e);
        }
        true
    }

    /// Ask the engine to pause `url`.
    ///
    /// Takes effect at the engine's next checkpoint; the record only turns
    /// paused when the `paused` event arrives.
    pub async fn pause(&self, url: &str) -> Result<(), ChimeraError> {
        let url = canonical_url(url);
        let fetch_url = {
            let mut state = self.state.lock();
            let Some(fetch_url) = state.fetch_url_for(&url) else {
                debug!("Nothing to pause for {}", url);
                return Ok(());
            };
            state.pause_requests.insert(url.clone());
            fetch_url
        };

        info!("Pausing {}", url);
        if let Err(e) = self.engine.pause(&fetch_url).await {
            self.state.lock().pause_requests.remove(&url);
            return Err(e);
        }
        Ok(())
    }

    /// Continue a paused download from its downloaded byte offset.
    ///
    /// The link is always resolved again. A record still marked in progress
    /// with no transfer behind it (left over from a previous run) resumes
    /// the same way. Returns false when there is nothing to resume.
    pub async fn resume(&self, url: &str) -> Result<bool, ChimeraError> {
        let url = canonical_url(url);
        let Some(download) = self.registry.find(&url) else {
            debug!("Ignoring resume for untracked {}", url);
            return Ok(false);
        };

        let (offset, attempt) = {
            let mut state = self.state.lock();
            let offset = match &download.state {
                DownloadState::Paused(p) => p.downloaded_bytes,
                DownloadState::Progress(p) if !state.is_in_flight(&url) => p.downloaded_bytes,
                _ => {
                    debug!("Not resuming {}: {}", url, download.status());
                    return Ok(false);
                }
            };
            let Some(attempt) = state.begin_start(&url) else {
                return Ok(false);
            };
            (offset, attempt)
        };

        match self.restart(attempt, &download, offset).await {
            Ok(resumed) => Ok(resumed),
            Err(e) => {
                error!("Failed to resume {}: {}", url, e);
                self.state.lock().abandon(&url, attempt);
                Err(e)
            }
        }
    }

    /// Returns false when the download was aborted meanwhile
    async fn restart(
        &self,
        attempt: u64,
        download: &Download,
        offset: u64,
    ) -> Result<bool, ChimeraError> {
        let destination = download.path.clone().ok_or_else(|| {
            ChimeraError::Other(format!("{} has no destination file", download.url))
        })?;
        let link = self
            .resolver
            .resolve(&download.original_url, download.downloader)
            .await?;

        let mut headers = vec![range_header(offset)];
        headers.extend(link.headers);
        {
            let mut state = self.state.lock();
            if state.take_cancelled(attempt) {
                info!("Resume of {} aborted while resolving", download.url);
                return Ok(false);
            }
            state
                .routes
                .insert(link.fetch_url.clone(), download.url.clone());
        }

        self.pause_others(&download.url).await;

        info!("Resuming {} at {} bytes", download.url, offset);
        self.engine
            .start(TransferRequest {
                url: link.fetch_url.clone(),
                destination,
                headers: Some(headers),
            })
            .await?;

        Ok(!self
            .cancel_if_aborted(attempt, &download.url, &link.fetch_url)
            .await)
    }

    /// Abort `url` and drop it from the registry without waiting for the
    /// engine to confirm. A download with no transfer running has its
    /// partial file deleted here.
    pub async fn abort(&self, url: &str) -> Result<(), ChimeraError> {
        let url = canonical_url(url);
        let fetch_url = {
            let mut state = self.state.lock();
            let fetch_url = state.fetch_url_for(&url);
            if let Some(attempt) = state.starting.get(&url).copied() {
                state.cancelled.insert(attempt);
            }
            state.forget(&url);
            fetch_url
        };

        info!("Aborting {}", url);
        let removed = self.registry.remove_unannounced(&url);
        match fetch_url {
            Some(fetch_url) => {
                if let Err(e) = self.engine.abort(&fetch_url).await {
                    warn!("Engine failed to abort {}: {}", url, e);
                }
            }
            None => {
                let partial = removed
                    .as_ref()
                    .filter(|d| d.state != DownloadState::Completed);
                if let Some(download) = partial {
                    self.delete_file(download).await;
                }
            }
        }

        match removed {
            Some(download) => self.persist_then_announce(removed_event(&download)).await,
            None => Ok(()),
        }
    }

    /// Remove `url` and delete its file. A running transfer is aborted.
    /// Returns false when the url is not tracked.
    pub async fn remove(&self, url: &str) -> Result<bool, ChimeraError> {
        let url = canonical_url(url);
        let active = {
            let state = self.state.lock();
            state.is_in_flight(&url) || state.starting.contains_key(&url)
        };
        if active {
            self.abort(&url).await?;
            return Ok(true);
        }

        let Some(download) = self.registry.find(&url) else {
            return Ok(false);
        };
        if let Some(path) = &download.path {
            if self.files.exists(path).await? {
                self.files.delete(path).await?;
                debug!("Deleted {}", path.display());
            }
        }

        self.state.lock().forget(&url);
        if self.registry.remove_unannounced(&url).is_none() {
            return Ok(true);
        }
        info!("Removed {}", url);
        self.persist_then_announce(removed_event(&download)).await?;
        Ok(true)
    }

    /// Request a pause of every active transfer except `url`.
    ///
    /// Best effort: the caller does not wait for the pauses to land.
    async fn pause_others(&self, url: &str) {
        let targets: Vec<(String, String)> = {
            let mut state = self.state.lock();
            let mut targets: Vec<(String, String)> = state
                .routes
                .iter()
                .filter(|(_, canonical)| canonical.as_str() != url)
                .map(|(fetch, canonical)| (canonical.clone(), fetch.clone()))
                .collect();

            // Progress records nothing is transferring for are paused by url
            for download in self.registry.list() {
                let in_progress = matches!(download.state, DownloadState::Progress(_));
                if in_progress
                    && download.url != url
                    && !targets.iter().any(|(canonical, _)| *canonical == download.url)
                {
                    targets.push((download.url.clone(), download.url));
                }
            }

            for (canonical, _) in &targets {
                state.pause_requests.insert(canonical.clone());
            }
            targets
        };

        if targets.is_empty() {
            return;
        }
        debug!("Pausing {} other transfer(s) before {}", targets.len(), url);

        let results = join_all(
            targets
                .iter()
                .map(|(_, fetch_url)| self.engine.pause(fetch_url)),
        )
        .await;
        for ((canonical, _), result) in targets.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to pause {}: {}", canonical, e);
            }
        }
    }

    // ========================================================================
    // Engine events
    // ========================================================================

    /// Apply one engine event
    pub async fn handle_event(&self, event: &EngineEvent) -> Result<(), ChimeraError> {
        let fetch_url = event.url();
        debug!("Engine event {} for {}", event.kind(), fetch_url);

        match event {
            EngineEvent::Started {
                path,
                content_length,
                ..
            } => {
                let (intent, url) = {
                    let mut state = self.state.lock();
                    // One-shot: a retried `started` finds no intent
                    let intent = state.intents.remove(fetch_url);
                    let url = match &intent {
                        Some(intent) => intent.url.clone(),
                        None => state.canonical_for(fetch_url),
                    };
                    state.starting.remove(&url);
                    (intent, url)
                };

                let added = intent.and_then(|intent| {
                    let download = intent.into_record(path.clone(), *content_length);
                    self.registry
                        .insert_unannounced(download.clone())
                        .then_some(CoreEvent::DownloadAdded { download })
                });
                let Some(announcement) = added.or_else(|| self.update_unannounced(&url, event))
                else {
                    return Ok(());
                };

                info!("Download started: {}", url);
                self.persist_then_announce(announcement).await
            }

            EngineEvent::Progress { .. } => {
                let url = self.state.lock().canonical_for(fetch_url);
                if self
                    .registry
                    .update(&url, |d| apply_logged(d, event))
                    .is_none()
                {
                    debug!("Ignoring progress for untracked {}", url);
                }
                Ok(())
            }

            EngineEvent::Paused { .. } | EngineEvent::Completed { .. } => {
                let url = self.settle(fetch_url);
                let Some(updated) = self.update_unannounced(&url, event) else {
                    return Ok(());
                };
                info!("Download {}: {}", event.kind(), url);
                self.persist_then_announce(updated).await
            }

            EngineEvent::Aborted { .. } => {
                let url = self.settle(fetch_url);
                self.state.lock().forget(&url);
                let Some(removed) = self.registry.remove_unannounced(&url) else {
                    return Ok(());
                };
                info!("Download aborted: {}", url);
                self.persist_then_announce(removed_event(&removed)).await
            }

            EngineEvent::RateLimitExceeded { .. } => {
                self.notify_rate_limited(fetch_url);
                Ok(())
            }
        }
    }

    /// Apply `event` to the record for `url` without telling subscribers.
    /// Returns the announcement to make once the change is saved.
    fn update_unannounced(&self, url: &str, event: &EngineEvent) -> Option<CoreEvent> {
        match self
            .registry
            .update_unannounced(url, |d| apply_logged(d, event))
        {
            Some(Some(download)) => Some(CoreEvent::DownloadUpdated { download }),
            Some(None) => None,
            None => {
                debug!("Ignoring {} for untracked {}", event.kind(), url);
                None
            }
        }
    }

    /// The transfer behind `fetch_url` has ended; returns its canonical url
    fn settle(&self, fetch_url: &str) -> String {
        let mut state = self.state.lock();
        let url = state.canonical_for(fetch_url);
        state.routes.remove(fetch_url);
        state.pause_requests.remove(&url);
        url
    }

    fn notify_rate_limited(&self, fetch_url: &str) {
        let (url, intent_downloader) = {
            let state = self.state.lock();
            let url = state.canonical_for(fetch_url);
            (url, state.intents.get(fetch_url).map(|i| i.downloader))
        };
        let downloader = self
            .registry
            .find(&url)
            .map(|d| d.downloader)
            .or(intent_downloader)
            .unwrap_or_else(|| Downloader::from_url(&url));

        warn!("{} rate limit exceeded for {}", downloader, url);
        let _ = self
            .event_tx
            .send(CoreEvent::RateLimitExceeded { url, downloader });
    }

    /// Drain engine events in order until the engine side is dropped
    pub fn spawn_event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let url = coordinator.state.lock().canonical_for(event.url());
                if let Err(e) = coordinator.handle_event(&event).await {
                    error!("Failed to handle {} for {}: {}", event.kind(), url, e);
                    let _ = coordinator.event_tx.send(CoreEvent::Error {
                        message: e.to_string(),
                        context: Some(url),
                    });
                }
            }
            debug!("Engine event channel closed");
        })
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load the persisted list, dropping downloads whose file is gone.
    ///
    /// Downloads left in progress or paused are not resumed. Returns the
    /// number of downloads restored.
    pub async fn restore(&self) -> Result<usize, ChimeraError> {
        let Some(stored) = self.store.get().await? else {
            return Ok(0);
        };
        let total = stored.len();

        let mut kept = Vec::with_capacity(total);
        for download in stored {
            let Some(path) = download.path.clone() else {
                info!("Dropping {}: it never started", download.url);
                continue;
            };
            match self.files.exists(&path).await {
                Ok(true) => kept.push(download),
                Ok(false) => info!("Dropping {}: {} is gone", download.url, path.display()),
                Err(e) => {
                    warn!("Could not check {} for {}: {}", path.display(), download.url, e);
                    kept.push(download);
                }
            }
        }

        self.registry.replace_all(kept);
        let restored = self.registry.len();
        if restored != total {
            self.persist().await?;
        }

        info!("Restored {} of {} downloads", restored, total);
        Ok(restored)
    }

    async fn persist(&self) -> Result<(), ChimeraError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.registry.list();
        self.store.set(&snapshot).await
    }

    /// Save a durable transition, then tell subscribers about it. Front ends
    /// may exit as soon as they hear of it.
    async fn persist_then_announce(&self, announcement: CoreEvent) -> Result<(), ChimeraError> {
        let persisted = self.persist().await;
        self.registry.announce(announcement);
        persisted
    }

    async fn delete_file(&self, download: &Download) {
        let Some(path) = &download.path else {
            return;
        };
        match self.files.exists(path).await {
            Ok(true) => {
                if let Err(e) = self.files.delete(path).await {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check {}: {}", path.display(), e),
        }
    }
}

fn removed_event(download: &Download) -> CoreEvent {
    CoreEvent::DownloadRemoved {
        url: download.url.clone(),
    }
}

fn apply_logged(download: &mut Download, event: &EngineEvent) -> bool {
    match apply(download, event) {
        Transition::Applied => true,
        Transition::Unchanged(reason) => {
            debug!("Ignoring {} for {}: {}", event.kind(), download.url, reason);
            false
        }
    }
}
