//! Shared types for Chimera
//!
//! This crate contains the data structures shared by the download core
//! and the CLI: tracked downloads, transfer engine events, core events
//! and settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Download Types
// ============================================================================

/// A tracked transfer, keyed by its canonical url
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    /// Canonical url, unique within the registry
    pub url: String,
    /// User-facing source url, re-resolved on every resume
    pub original_url: String,
    /// Destination file, known once the engine reports `started`
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub title: String,
    pub remote_id: String,
    pub downloader: Downloader,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(flatten)]
    pub state: DownloadState,
}

impl Download {
    pub fn status(&self) -> DownloadStatus {
        self.state.status()
    }

    /// Progress fields, present only while transferring or paused
    pub fn progress(&self) -> Option<&TransferProgress> {
        self.state.progress()
    }

    pub fn downloaded_bytes(&self) -> Option<u64> {
        self.progress().map(|p| p.downloaded_bytes)
    }

    /// Percentage for display; completed downloads report 100
    pub fn percentage(&self) -> f64 {
        match &self.state {
            DownloadState::Completed => 100.0,
            DownloadState::Progress(p) | DownloadState::Paused(p) => p.progress_percentage,
        }
    }
}

/// Lifecycle state of a tracked download.
///
/// Serialized inline with the record under a `status` tag. The completed
/// variant carries no progress fields at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadState {
    Progress(TransferProgress),
    Paused(TransferProgress),
    Completed,
}

impl DownloadState {
    /// Paused state; the ETA of a paused transfer is always zero
    pub fn paused(progress: TransferProgress) -> Self {
        DownloadState::Paused(TransferProgress { eta: 0, ..progress })
    }

    pub fn status(&self) -> DownloadStatus {
        match self {
            DownloadState::Progress(_) => DownloadStatus::Progress,
            DownloadState::Paused(_) => DownloadStatus::Paused,
            DownloadState::Completed => DownloadStatus::Completed,
        }
    }

    pub fn progress(&self) -> Option<&TransferProgress> {
        match self {
            DownloadState::Progress(p) | DownloadState::Paused(p) => Some(p),
            DownloadState::Completed => None,
        }
    }
}

/// Transient transfer figures reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// 0-100
    pub progress_percentage: f64,
    pub downloaded_bytes: u64,
    /// Bytes per second
    pub download_speed: u64,
    /// Seconds remaining
    pub eta: u64,
}

/// Flat status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Progress,
    Paused,
    Completed,
    Aborted,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Progress => "progress",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "progress" | "downloading" => Ok(DownloadStatus::Progress),
            "paused" => Ok(DownloadStatus::Paused),
            "completed" | "done" => Ok(DownloadStatus::Completed),
            "aborted" => Ok(DownloadStatus::Aborted),
            other => Err(format!("Invalid status: {}", other)),
        }
    }
}

// ============================================================================
// Host Types
// ============================================================================

/// File host a download is fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Downloader {
    Torrent,
    Gofile,
    PixelDrain,
    BuzzHeavier,
    RealDebrid,
    Unknown,
}

impl Downloader {
    /// Detect the host of a source url
    pub fn from_url(url: &str) -> Self {
        let parsed = match url::Url::parse(url.trim()) {
            Ok(u) => u,
            Err(_) => return Downloader::Unknown,
        };

        if parsed.scheme() == "magnet" || parsed.path().ends_with(".torrent") {
            return Downloader::Torrent;
        }

        let host = match parsed.host_str() {
            Some(h) => h.to_lowercase(),
            None => return Downloader::Unknown,
        };
        let is = |domain: &str| host == domain || host.ends_with(&format!(".{}", domain));

        if is("gofile.io") {
            Downloader::Gofile
        } else if is("pixeldrain.com") || is("pixeldrain.net") {
            Downloader::PixelDrain
        } else if is("buzzheavier.com") {
            Downloader::BuzzHeavier
        } else if is("real-debrid.com") {
            Downloader::RealDebrid
        } else {
            Downloader::Unknown
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Downloader::Torrent => "Torrent",
            Downloader::Gofile => "Gofile",
            Downloader::PixelDrain => "PixelDrain",
            Downloader::BuzzHeavier => "BuzzHeavier",
            Downloader::RealDebrid => "Real-Debrid",
            Downloader::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the transfer engine. `url` is the fetch url the
/// transfer was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum EngineEvent {
    Started {
        url: String,
        path: PathBuf,
        content_length: Option<u64>,
    },
    Progress {
        url: String,
        progress_percentage: f64,
        downloaded_bytes: u64,
        download_speed: u64,
        eta: u64,
    },
    Paused {
        url: String,
    },
    Completed {
        url: String,
    },
    Aborted {
        url: String,
    },
    RateLimitExceeded {
        url: String,
    },
}

impl EngineEvent {
    pub fn url(&self) -> &str {
        match self {
            EngineEvent::Started { url, .. }
            | EngineEvent::Progress { url, .. }
            | EngineEvent::Paused { url }
            | EngineEvent::Completed { url }
            | EngineEvent::Aborted { url }
            | EngineEvent::RateLimitExceeded { url } => url,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Started { .. } => "started",
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::Paused { .. } => "paused",
            EngineEvent::Completed { .. } => "completed",
            EngineEvent::Aborted { .. } => "aborted",
            EngineEvent::RateLimitExceeded { .. } => "rate_limit_exceeded",
        }
    }
}

/// Events emitted by the core to front ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadAdded {
        download: Download,
    },
    DownloadUpdated {
        download: Download,
    },
    DownloadRemoved {
        url: String,
    },
    /// Transient, non-fatal notice; the download keeps its status
    RateLimitExceeded {
        url: String,
        downloader: Downloader,
    },
    Error {
        message: String,
        context: Option<String>,
    },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory new downloads are written to
    pub downloads_path: PathBuf,
    pub user_agent: String,
    /// Redirects followed by the transfer engine
    pub max_redirects: usize,
    /// How often progress is reported and pause/abort requests are checked
    pub progress_interval_ms: u64,
    /// Website token expected by the Gofile contents API
    pub gofile_website_token: String,
    /// Mirror serving PixelDrain files
    pub pixeldrain_mirror: String,
    /// API token for Real-Debrid link unrestriction
    pub real_debrid_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downloads_path: dirs::download_dir()
                .map(|p| p.join("Chimera"))
                .unwrap_or_else(|| PathBuf::from(".")),
            user_agent: "chimera".to_string(),
            max_redirects: 3,
            progress_interval_ms: 2000,
            gofile_website_token: "4fd6sg89d7s6".to_string(),
            pixeldrain_mirror: "https://cdn.pd5-gamedriveorg.workers.dev".to_string(),
            real_debrid_token: None,
        }
    }
}
