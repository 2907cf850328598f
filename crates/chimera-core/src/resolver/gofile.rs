//! Gofile. Downloads need a guest account token, sent as a cookie.

use super::{fetch_json, last_segment, ResolvedLink};
use crate::error::ChimeraError;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

const API_URL: &str = "https://api.gofile.io";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_data(self, url: &str) -> Result<T, ChimeraError> {
        match (self.status.as_str(), self.data) {
            ("ok", Some(data)) => Ok(data),
            (status, _) => Err(ChimeraError::resolution(
                url,
                format!("Gofile API answered '{}'", status),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Account {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    children: BTreeMap<String, Content>,
}

pub struct Gofile {
    api_url: String,
    website_token: String,
}

impl Gofile {
    pub fn new(website_token: impl Into<String>) -> Self {
        Self::with_api_url(API_URL, website_token)
    }

    pub fn with_api_url(api_url: impl Into<String>, website_token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            website_token: website_token.into(),
        }
    }

    pub async fn resolve(&self, client: &Client, url: &str) -> Result<ResolvedLink, ChimeraError> {
        let parsed = Url::parse(url).map_err(|e| ChimeraError::resolution(url, e.to_string()))?;
        let id = content_id(&parsed)
            .ok_or_else(|| ChimeraError::resolution(url, "no Gofile content id in url"))?;

        let token = self.authorize(client, url).await?;
        let request = client
            .get(format!("{}/contents/{}", self.api_url, id))
            .query(&[("wt", self.website_token.as_str())])
            .bearer_auth(&token);
        let content: ApiResponse<Content> = fetch_json(request, url).await?;

        let link = first_file_link(&content.into_data(url)?)
            .ok_or_else(|| ChimeraError::resolution(url, "Gofile folder has no files"))?;
        debug!("Gofile {} resolved to {}", id, link);

        Ok(link_with_token(link, &token))
    }

    /// Create a guest account, returning its token
    async fn authorize(&self, client: &Client, url: &str) -> Result<String, ChimeraError> {
        let request = client.post(format!("{}/accounts", self.api_url));
        let account: ApiResponse<Account> = fetch_json(request, url).await?;

        Ok(account.into_data(url)?.token)
    }
}

fn link_with_token(link: String, token: &str) -> ResolvedLink {
    let file_name = Url::parse(&link)
        .ok()
        .and_then(|u| last_segment(&u))
        .map(|name| {
            urlencoding::decode(&name)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(name)
        });

    ResolvedLink {
        fetch_url: link,
        headers: vec![("Cookie".to_string(), format!("accountToken={}", token))],
        file_name,
    }
}

fn first_file_link(content: &Content) -> Option<String> {
    if content.kind == "file" {
        return content.link.clone();
    }
    content.children.values().find_map(first_file_link)
}

/// Content id from `/d/<id>`
pub(super) fn content_id(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["d", id] => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serve_once;
    use serde_json::json;
    use tokio_test::assert_err;

    #[test]
    fn test_content_id() {
        let id = |s: &str| content_id(&Url::parse(s).unwrap());
        assert_eq!(id("https://gofile.io/d/XyZ9"), Some("XyZ9".into()));
        assert_eq!(id("https://gofile.io/d/XyZ9/"), Some("XyZ9".into()));
        assert_eq!(id("https://gofile.io/myprofile"), None);
    }

    #[test]
    fn test_first_file_link_in_folder() {
        let response: ApiResponse<Content> = serde_json::from_value(json!({
            "status": "ok",
            "data": {
                "type": "folder",
                "children": {
                    "a": { "type": "folder", "children": {} },
                    "b": { "type": "file", "link": "https://store1.gofile.io/download/web/b/Some%20Game.zip" }
                }
            }
        }))
        .unwrap();

        let content = response.into_data("https://gofile.io/d/x").unwrap();
        assert_eq!(
            first_file_link(&content).as_deref(),
            Some("https://store1.gofile.io/download/web/b/Some%20Game.zip")
        );
    }

    #[test]
    fn test_error_status_fails_resolution() {
        let response: ApiResponse<Account> =
            serde_json::from_value(json!({ "status": "error-rateLimit" })).unwrap();
        let err = response.into_data("https://gofile.io/d/x").unwrap_err();
        assert!(err.to_string().contains("error-rateLimit"));
    }

    #[tokio::test]
    async fn test_api_failure_fails_resolution() {
        let (api_url, server) = serve_once(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec(),
        )
        .await;

        let client = Client::builder().no_proxy().build().unwrap();
        let err = assert_err!(
            Gofile::with_api_url(api_url, "wt")
                .resolve(&client, "https://gofile.io/d/XyZ9")
                .await
        );
        let request = server.await.unwrap();

        assert!(request.starts_with("POST /accounts"));
        assert!(matches!(
            err,
            ChimeraError::ResolutionFailed { url, .. } if url == "https://gofile.io/d/XyZ9"
        ));
    }

    #[test]
    fn test_link_carries_cookie_and_decoded_name() {
        let link = link_with_token(
            "https://store1.gofile.io/download/web/b/Some%20Game.zip".to_string(),
            "tok",
        );
        assert_eq!(
            link.headers,
            vec![("Cookie".to_string(), "accountToken=tok".to_string())]
        );
        assert_eq!(link.file_name.as_deref(), Some("Some Game.zip"));
    }
}
