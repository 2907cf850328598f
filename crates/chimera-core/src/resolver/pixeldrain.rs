//! PixelDrain, served through a mirror CDN

use super::{last_segment, ResolvedLink};
use crate::error::ChimeraError;
use url::Url;

pub struct PixelDrain {
    mirror: String,
}

impl PixelDrain {
    pub fn new(mirror: impl Into<String>) -> Self {
        Self {
            mirror: mirror.into(),
        }
    }

    pub fn resolve(&self, url: &str) -> Result<ResolvedLink, ChimeraError> {
        let parsed = Url::parse(url).map_err(|e| ChimeraError::resolution(url, e.to_string()))?;
        let id = file_id(&parsed)
            .ok_or_else(|| ChimeraError::resolution(url, "no PixelDrain file id in url"))?;

        Ok(ResolvedLink::direct(format!(
            "{}/api/file/{}",
            self.mirror.trim_end_matches('/'),
            id
        )))
    }
}

/// File id from `/u/<id>` or `/api/file/<id>`
pub(super) fn file_id(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["u", id] | ["api", "file", id] => Some(id.to_string()),
        _ => last_segment(url).filter(|_| segments.len() == 1),
    }
}
