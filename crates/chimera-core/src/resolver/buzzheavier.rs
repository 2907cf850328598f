//! BuzzHeavier. `/download` redirects to the CDN; the engine follows it.

use super::ResolvedLink;
use crate::error::ChimeraError;
use url::Url;

pub struct BuzzHeavier;

impl BuzzHeavier {
    pub fn resolve(&self, url: &str) -> Result<ResolvedLink, ChimeraError> {
        let mut parsed =
            Url::parse(url).map_err(|e| ChimeraError::resolution(url, e.to_string()))?;
        let page = parsed.path().trim_end_matches('/').to_string();
        if page.ends_with("/download") {
            parsed.set_path(&page);
        } else {
            parsed.set_path(&format!("{}/download", page));
        }
        parsed.set_fragment(None);

        Ok(ResolvedLink::direct(parsed.as_str()))
    }
}
