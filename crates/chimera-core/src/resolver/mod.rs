//! Link resolution - turning a host page url into something fetchable
//!
//! Each supported host gets its own module. Resolution is never cached:
//! tokens handed out by host APIs expire, so a resume resolves again.

mod buzzheavier;
mod gofile;
mod pixeldrain;
mod real_debrid;

use crate::error::ChimeraError;
use async_trait::async_trait;
use chimera_types::{Downloader, Settings};
use reqwest::{redirect::Policy, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub use buzzheavier::BuzzHeavier;
pub use gofile::Gofile;
pub use pixeldrain::PixelDrain;
pub use real_debrid::RealDebrid;

/// A url the transfer engine can fetch, plus what the host wants with it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedLink {
    pub fetch_url: String,
    /// Extra request headers (auth cookies, tokens)
    pub headers: Vec<(String, String)>,
    /// File name suggested by the host, if it exposes one
    pub file_name: Option<String>,
}

impl ResolvedLink {
    pub fn direct(fetch_url: impl Into<String>) -> Self {
        Self {
            fetch_url: fetch_url.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn resolve(&self, url: &str, downloader: Downloader)
        -> Result<ResolvedLink, ChimeraError>;
}

/// Resolver for every host Chimera knows about
pub struct HostResolver {
    client: Client,
    gofile: Gofile,
    pixeldrain: PixelDrain,
    real_debrid: RealDebrid,
}

impl HostResolver {
    pub fn new(settings: &Settings) -> Result<Self, ChimeraError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .redirect(Policy::limited(settings.max_redirects))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Client, settings: &Settings) -> Self {
        Self {
            client,
            gofile: Gofile::new(settings.gofile_website_token.clone()),
            pixeldrain: PixelDrain::new(settings.pixeldrain_mirror.clone()),
            real_debrid: RealDebrid::new(settings.real_debrid_token.clone()),
        }
    }
}

#[async_trait]
impl LinkResolver for HostResolver {
    async fn resolve(
        &self,
        url: &str,
        downloader: Downloader,
    ) -> Result<ResolvedLink, ChimeraError> {
        debug!("Resolving {} via {}", url, downloader);

        match downloader {
            Downloader::Gofile => self.gofile.resolve(&self.client, url).await,
            Downloader::PixelDrain => self.pixeldrain.resolve(url),
            Downloader::BuzzHeavier => BuzzHeavier.resolve(url),
            Downloader::RealDebrid => self.real_debrid.resolve(&self.client, url).await,
            Downloader::Torrent => Err(ChimeraError::resolution(
                url,
                "torrent downloads are not supported",
            )),
            Downloader::Unknown => resolve_direct(url),
        }
    }
}

/// Plain http(s) links are fetched as they are
fn resolve_direct(url: &str) -> Result<ResolvedLink, ChimeraError> {
    let parsed = url::Url::parse(url).map_err(|e| ChimeraError::resolution(url, e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(ResolvedLink::direct(parsed.as_str())),
        scheme => Err(ChimeraError::resolution(
            url,
            format!("unsupported scheme '{}'", scheme),
        )),
    }
}

/// Send a host API request and decode the JSON reply. Any failure on the
/// way fails the resolution of `url`.
async fn fetch_json<T: DeserializeOwned>(
    request: RequestBuilder,
    url: &str,
) -> Result<T, ChimeraError> {
    let failed = |e: reqwest::Error| ChimeraError::resolution(url, e.to_string());
    request
        .send()
        .await
        .map_err(failed)?
        .error_for_status()
        .map_err(failed)?
        .json()
        .await
        .map_err(failed)
}

/// Key a download is tracked under.
///
/// Drops query, fragment and any trailing slash; host page urls are
/// rewritten to one form per file. Applying it twice changes nothing.
pub fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    let mut parsed = match url::Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return trimmed.to_string(),
    };

    match Downloader::from_url(trimmed) {
        // Magnet links carry everything in the query
        Downloader::Torrent => return trimmed.to_string(),
        Downloader::PixelDrain => {
            if let Some(id) = pixeldrain::file_id(&parsed) {
                return format!("https://pixeldrain.com/u/{}", id);
            }
        }
        Downloader::Gofile => {
            if let Some(id) = gofile::content_id(&parsed) {
                return format!("https://gofile.io/d/{}", id);
            }
        }
        _ => {}
    }

    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.as_str().trim_end_matches('/').to_string()
}

/// File name derived from a title, whitespace replaced by `-`
pub fn file_name_from_title(title: &str) -> String {
    title
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}

/// Last non-empty path segment of a url
fn last_segment(url: &url::Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}
