//! Real-Debrid link unrestriction

use super::{fetch_json, ResolvedLink};
use crate::error::ChimeraError;
use reqwest::Client;
use serde::Deserialize;

const UNRESTRICT_URL: &str = "https://api.real-debrid.com/rest/1.0/unrestrict/link";

#[derive(Debug, Deserialize)]
struct Unrestricted {
    download: String,
    #[serde(default)]
    filename: Option<String>,
}

pub struct RealDebrid {
    unrestrict_url: String,
    token: Option<String>,
}

impl RealDebrid {
    pub fn new(token: Option<String>) -> Self {
        Self::with_unrestrict_url(UNRESTRICT_URL, token)
    }

    pub fn with_unrestrict_url(unrestrict_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            unrestrict_url: unrestrict_url.into(),
            token,
        }
    }

    pub async fn resolve(&self, client: &Client, url: &str) -> Result<ResolvedLink, ChimeraError> {
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChimeraError::resolution(url, "no Real-Debrid API token configured"))?;

        let request = client
            .post(&self.unrestrict_url)
            .bearer_auth(token)
            .form(&[("link", url)]);
        let unrestricted: Unrestricted = fetch_json(request, url).await?;

        Ok(ResolvedLink {
            fetch_url: unrestricted.download,
            headers: Vec::new(),
            file_name: unrestricted.filename,
        })
    }
}
