//! Following a running download in the terminal

use crate::output::{format_eta, format_speed};
use anyhow::Result;
use chimera_core::ChimeraCore;
use chimera_types::{CoreEvent, Download, DownloadState};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// How following a download ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Completed,
    Paused,
    Aborted,
    /// The core stopped sending events
    Closed,
}

/// Progress bar for one download
pub struct DownloadProgress {
    bar: ProgressBar,
}

impl DownloadProgress {
    pub fn new(title: &str) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        bar.set_prefix(title.to_string());
        bar.set_message("resolving link");
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }

    pub fn update(&self, download: &Download) {
        if let Some(total) = download.content_length {
            self.bar.set_length(total);
        }
        match &download.state {
            DownloadState::Progress(p) => {
                self.bar.set_position(p.downloaded_bytes);
                self.bar.set_message(format!(
                    "{} ETA {}",
                    format_speed(p.download_speed),
                    format_eta(p.eta)
                ));
            }
            DownloadState::Paused(p) => {
                self.bar.set_position(p.downloaded_bytes);
                self.bar.set_message(format!("{} Paused", style("⏸").yellow()));
            }
            DownloadState::Completed => {
                if let Some(total) = download.content_length {
                    self.bar.set_position(total);
                }
            }
        }
    }

    pub fn println(&self, line: String) {
        self.bar.println(line);
    }

    pub fn finish(&self, outcome: FollowOutcome) {
        match outcome {
            FollowOutcome::Completed => self.bar.finish_with_message(format!(
                "{} Download complete",
                style("✓").green().bold()
            )),
            FollowOutcome::Paused => self.bar.abandon_with_message(format!(
                "{} Paused - continue with `chimera resume`",
                style("⏸").yellow()
            )),
            FollowOutcome::Aborted => self
                .bar
                .abandon_with_message(format!("{} Aborted", style("✗").red().bold())),
            FollowOutcome::Closed => self.bar.abandon(),
        }
    }
}

/// Render events for `url` until its transfer ends. The first Ctrl-C asks
/// the core to pause the download and keeps waiting for the pause to land.
pub async fn follow(
    core: &ChimeraCore,
    mut events: broadcast::Receiver<CoreEvent>,
    url: &str,
    progress: &DownloadProgress,
) -> Result<FollowOutcome> {
    let mut pausing = false;

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !pausing => {
                signal?;
                pausing = true;
                progress.println(format!("{} Pausing at the next checkpoint...", style("⏸").yellow()));
                core.pause_download(url).await?;
            }

            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break FollowOutcome::Closed,
                };

                match event {
                    CoreEvent::DownloadAdded { download } | CoreEvent::DownloadUpdated { download }
                        if download.url == url =>
                    {
                        progress.update(&download);
                        match download.state {
                            DownloadState::Completed => break FollowOutcome::Completed,
                            DownloadState::Paused(_) => break FollowOutcome::Paused,
                            DownloadState::Progress(_) => {}
                        }
                    }
                    CoreEvent::DownloadRemoved { url: removed } if removed == url => {
                        break FollowOutcome::Aborted;
                    }
                    CoreEvent::RateLimitExceeded { url: limited, downloader } if limited == url => {
                        progress.println(format!(
                            "{} {} rate limit exceeded, try again later",
                            style("!").yellow().bold(),
                            downloader
                        ));
                    }
                    CoreEvent::Error { message, context } if context.as_deref() == Some(url) => {
                        progress.println(format!("{} {}", style("✗").red(), message));
                    }
                    _ => {}
                }
            }
        }
    };

    progress.finish(outcome);
    Ok(outcome)
}
