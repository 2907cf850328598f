//! Download lifecycle transitions
//!
//! ```text
//!  add ──► Starting ──started──► Progress ──paused──► Paused
//!                                   │  ▲                │
//!                                   │  └──resume/progress┘
//!                          completed│                   │completed
//!                                   ▼                   ▼
//!                                Completed          (aborted: record removed)
//! ```
//!
//! `Starting` is held by the coordinator as a [`StartIntent`]; everything
//! else is a [`DownloadState`] on the registry record. The functions here
//! are pure: they decide what an engine event does to one record and leave
//! locking and persistence to the coordinator.

use chimera_types::{Download, DownloadState, Downloader, EngineEvent, TransferProgress};
use std::path::PathBuf;

/// A user add that has been resolved and handed to the engine but not yet
/// confirmed by a `started` event
#[derive(Debug, Clone, PartialEq)]
pub struct StartIntent {
    /// Canonical url the record will be keyed by
    pub url: String,
    pub original_url: String,
    /// Url the engine was started with
    pub fetch_url: String,
    pub title: String,
    pub remote_id: String,
    pub downloader: Downloader,
}

impl StartIntent {
    /// The record inserted when the engine confirms the transfer
    pub fn into_record(self, path: PathBuf, content_length: Option<u64>) -> Download {
        Download {
            url: self.url,
            original_url: self.original_url,
            path: Some(path),
            title: self.title,
            remote_id: self.remote_id,
            downloader: self.downloader,
            content_length,
            state: DownloadState::Progress(TransferProgress::default()),
        }
    }
}

/// Outcome of applying an engine event to an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Nothing changed; the reason is for logs
    Unchanged(&'static str),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Apply `event` to `download`.
///
/// Only `started`, `progress`, `paused` and `completed` act on a record;
/// `aborted` removes the record and `rate_limit_exceeded` never touches it,
/// both handled by the caller.
pub fn apply(download: &mut Download, event: &EngineEvent) -> Transition {
    match event {
        EngineEvent::Started {
            path,
            content_length,
            ..
        } => {
            // A transfer restarting for a record we already hold: a resume,
            // or the engine retrying a start we already confirmed
            let progress = match &download.state {
                DownloadState::Progress(p) | DownloadState::Paused(p) => *p,
                DownloadState::Completed => return Transition::Unchanged("already completed"),
            };
            download.state = DownloadState::Progress(progress);
            if download.path.is_none() {
                download.path = Some(path.clone());
            }
            if content_length.is_some() {
                download.content_length = *content_length;
            }
            Transition::Applied
        }

        EngineEvent::Progress {
            progress_percentage,
            downloaded_bytes,
            download_speed,
            eta,
            ..
        } => {
            if download.state == DownloadState::Completed {
                return Transition::Unchanged("progress after completion");
            }
            download.state = DownloadState::Progress(TransferProgress {
                progress_percentage: *progress_percentage,
                downloaded_bytes: *downloaded_bytes,
                download_speed: *download_speed,
                eta: *eta,
            });
            Transition::Applied
        }

        EngineEvent::Paused { .. } => match &download.state {
            DownloadState::Progress(p) => {
                download.state = DownloadState::paused(*p);
                Transition::Applied
            }
            DownloadState::Paused(_) => Transition::Unchanged("already paused"),
            DownloadState::Completed => Transition::Unchanged("already completed"),
        },

        EngineEvent::Completed { .. } => match &download.state {
            DownloadState::Progress(_) | DownloadState::Paused(_) => {
                download.state = DownloadState::Completed;
                Transition::Applied
            }
            DownloadState::Completed => Transition::Unchanged("already completed"),
        },

        EngineEvent::Aborted { .. } | EngineEvent::RateLimitExceeded { .. } => {
            Transition::Unchanged("not a record transition")
        }
    }
}

/// `Range` header continuing a transfer at `offset`
pub fn range_header(offset: u64) -> (String, String) {
    ("Range".to_string(), format!("bytes={}-", offset))
}
