//! Transfer engine - byte-level HTTP transfers
//!
//! The coordinator only talks to the [`TransferEngine`] trait: it issues
//! start/pause/abort commands and consumes the [`EngineEvent`] stream the
//! engine writes to its [`EventSink`]. [`HttpTransferEngine`] is the
//! production implementation.

mod download_task;
mod manager;

pub use download_task::*;
pub use manager::*;

use crate::error::ChimeraError;
use async_trait::async_trait;
use chimera_types::EngineEvent;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Channel the engine reports lifecycle events on
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// A transfer to start
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    /// Fetchable url; also the url every event for this transfer carries
    pub url: String,
    pub destination: PathBuf,
    /// Extra request headers, in order. A `Range: bytes=<n>-` entry resumes
    /// the transfer at byte `n`.
    pub headers: Option<Vec<(String, String)>>,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Begin a transfer. Returns once the request has been accepted; the
    /// outcome of the transfer itself arrives as events.
    async fn start(&self, request: TransferRequest) -> Result<(), ChimeraError>;

    /// Request a pause. Takes effect at the engine's next checkpoint and is
    /// confirmed by a `paused` event.
    async fn pause(&self, url: &str) -> Result<(), ChimeraError>;

    /// Request an abort. The partial file is deleted and an `aborted` event
    /// follows.
    async fn abort(&self, url: &str) -> Result<(), ChimeraError>;
}
