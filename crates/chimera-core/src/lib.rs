//! Chimera Core - download lifecycle
//!
//! This crate tracks game archive downloads from several file hosts:
//! link resolution, the HTTP transfer engine, pause/resume with byte
//! ranges, abort, and a download list that survives restarts.

mod coordinator;
pub mod engine;
mod error;
mod files;
pub mod lifecycle;
mod persistence;
mod registry;
pub mod resolver;
mod storage;

#[cfg(test)]
mod testing;

pub use coordinator::*;
pub use engine::{EventSink, HttpTransferEngine, TransferEngine, TransferRequest};
pub use error::*;
pub use files::*;
pub use persistence::*;
pub use registry::*;
pub use resolver::{canonical_url, HostResolver, LinkResolver, ResolvedLink};
pub use storage::*;

use chimera_types::{CoreEvent, Download, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::info;

const DATABASE_FILE: &str = "downloads.db";

/// The main Chimera core instance
#[derive(Clone)]
pub struct ChimeraCore {
    coordinator: LifecycleCoordinator,
    /// Application settings
    settings: Arc<RwLock<Settings>>,
    settings_storage: SettingsStorage,
}

impl ChimeraCore {
    /// Open the core on `data_dir`: load settings, restore the download
    /// list and start consuming engine events.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(data_dir: PathBuf) -> Result<Self, ChimeraError> {
        let settings_storage = SettingsStorage::new(data_dir.clone()).await?;
        let settings = settings_storage.load().await;
        let store = SqliteStore::open(data_dir.join(DATABASE_FILE)).await?;

        Self::with_store(settings_storage, settings, Arc::new(store)).await
    }

    /// Same as [`ChimeraCore::new`] with a caller-provided download store
    pub async fn with_store(
        settings_storage: SettingsStorage,
        settings: Settings,
        store: Arc<dyn DownloadStore>,
    ) -> Result<Self, ChimeraError> {
        let (event_tx, _) = broadcast::channel(1000);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(HttpTransferEngine::new(&settings, engine_tx)?);
        let resolver = Arc::new(HostResolver::new(&settings)?);
        let coordinator =
            LifecycleCoordinator::new(engine, resolver, store, Arc::new(LocalFiles), event_tx);

        let restored = coordinator.restore().await?;
        coordinator.spawn_event_loop(engine_rx);
        info!(
            "Chimera core ready in {} ({} downloads)",
            settings_storage.data_dir().display(),
            restored
        );

        Ok(Self {
            coordinator,
            settings: Arc::new(RwLock::new(settings)),
            settings_storage,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    pub fn data_dir(&self) -> &Path {
        self.settings_storage.data_dir()
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Start downloading `url` into `directory`, or the configured downloads
    /// directory
    pub async fn add_download(
        &self,
        url: &str,
        remote_id: &str,
        title: &str,
        directory: Option<PathBuf>,
    ) -> Result<AddOutcome, ChimeraError> {
        let directory = match directory {
            Some(dir) => dir,
            None => self.settings.read().await.downloads_path.clone(),
        };

        self.coordinator
            .add(AddDownload {
                url: url.to_string(),
                remote_id: remote_id.to_string(),
                title: title.to_string(),
                directory,
            })
            .await
    }

    pub async fn pause_download(&self, url: &str) -> Result<(), ChimeraError> {
        self.coordinator.pause(url).await
    }

    pub async fn resume_download(&self, url: &str) -> Result<bool, ChimeraError> {
        self.coordinator.resume(url).await
    }

    pub async fn abort_download(&self, url: &str) -> Result<(), ChimeraError> {
        self.coordinator.abort(url).await
    }

    /// Remove a download and delete its file
    pub async fn remove_download(&self, url: &str) -> Result<bool, ChimeraError> {
        self.coordinator.remove(url).await
    }

    /// All tracked downloads in insertion order
    pub fn downloads(&self) -> Vec<Download> {
        self.coordinator.registry().list()
    }

    pub fn find_download(&self, url: &str) -> Option<Download> {
        self.coordinator.registry().find(&canonical_url(url))
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Get current settings
    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Save settings. Engine and resolver settings apply from the next
    /// start of the core.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), ChimeraError> {
        self.settings_storage.save(&settings).await?;
        *self.settings.write().await = settings;
        Ok(())
    }
}
