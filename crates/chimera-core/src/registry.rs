//! In-memory table of tracked downloads
//!
//! The registry is the single source of truth for front ends. Every
//! mutation happens under one write lock and is announced on the core
//! event channel after the lock is released, so subscribers never observe
//! a half-applied change.

use chimera_types::{CoreEvent, Download};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Insertion-ordered downloads, unique by url
#[derive(Clone)]
pub struct DownloadRegistry {
    downloads: Arc<RwLock<Vec<Download>>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl DownloadRegistry {
    pub fn new(event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            downloads: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    /// Snapshot of all downloads in insertion order
    pub fn list(&self) -> Vec<Download> {
        self.downloads.read().clone()
    }

    pub fn find(&self, url: &str) -> Option<Download> {
        self.downloads.read().iter().find(|d| d.url == url).cloned()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.downloads.read().iter().any(|d| d.url == url)
    }

    pub fn len(&self) -> usize {
        self.downloads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.read().is_empty()
    }

    /// Insert a new download. Returns false (and changes nothing) when the
    /// url is already tracked.
    pub fn insert(&self, download: Download) -> bool {
        if !self.insert_unannounced(download.clone()) {
            return false;
        }
        self.emit(CoreEvent::DownloadAdded { download });
        true
    }

    /// [`insert`](Self::insert) leaving the announcement to the caller
    pub fn insert_unannounced(&self, download: Download) -> bool {
        let mut downloads = self.downloads.write();
        if downloads.iter().any(|d| d.url == download.url) {
            return false;
        }
        downloads.push(download);
        true
    }

    /// Insert or replace the record for `download.url`, keeping its position
    pub fn upsert(&self, download: Download) {
        let event = {
            let mut downloads = self.downloads.write();
            match downloads.iter_mut().find(|d| d.url == download.url) {
                Some(existing) => {
                    *existing = download.clone();
                    CoreEvent::DownloadUpdated { download }
                }
                None => {
                    downloads.push(download.clone());
                    CoreEvent::DownloadAdded { download }
                }
            }
        };

        self.emit(event);
    }

    /// Patch the record for `url` in place.
    ///
    /// The patch reports whether it changed anything; subscribers are only
    /// notified when it did. Returns `None` when the url is not tracked.
    pub fn update<F>(&self, url: &str, patch: F) -> Option<bool>
    where
        F: FnOnce(&mut Download) -> bool,
    {
        let updated = self.update_unannounced(url, patch)?;
        let changed = updated.is_some();
        if let Some(download) = updated {
            self.emit(CoreEvent::DownloadUpdated { download });
        }
        Some(changed)
    }

    /// [`update`](Self::update) leaving the announcement to the caller.
    /// Yields the patched record when the patch changed it.
    pub fn update_unannounced<F>(&self, url: &str, patch: F) -> Option<Option<Download>>
    where
        F: FnOnce(&mut Download) -> bool,
    {
        let mut downloads = self.downloads.write();
        let download = downloads.iter_mut().find(|d| d.url == url)?;
        Some(patch(download).then(|| download.clone()))
    }

    pub fn remove(&self, url: &str) -> Option<Download> {
        let removed = self.remove_unannounced(url)?;
        self.emit(CoreEvent::DownloadRemoved {
            url: removed.url.clone(),
        });
        Some(removed)
    }

    /// [`remove`](Self::remove) leaving the announcement to the caller
    pub fn remove_unannounced(&self, url: &str) -> Option<Download> {
        let mut downloads = self.downloads.write();
        let index = downloads.iter().position(|d| d.url == url)?;
        Some(downloads.remove(index))
    }

    /// Tell subscribers about a change made through an `_unannounced` call
    pub fn announce(&self, event: CoreEvent) {
        self.emit(event);
    }

    /// Replace the whole table, used when restoring persisted state.
    /// Later duplicates of a url are dropped.
    pub fn replace_all(&self, downloads: Vec<Download>) {
        let mut unique: Vec<Download> = Vec::with_capacity(downloads.len());
        for download in downloads {
            if !unique.iter().any(|d| d.url == download.url) {
                unique.push(download);
            }
        }

        let removed: Vec<String> = {
            let mut current = self.downloads.write();
            let old = std::mem::replace(&mut *current, unique.clone());
            old.into_iter()
                .filter(|d| !unique.iter().any(|u| u.url == d.url))
                .map(|d| d.url)
                .collect()
        };

        for url in removed {
            self.emit(CoreEvent::DownloadRemoved { url });
        }
        for download in unique {
            self.emit(CoreEvent::DownloadAdded { download });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::progress_record;
    use chimera_types::DownloadState;

    fn registry() -> DownloadRegistry {
        let (event_tx, _) = broadcast::channel(64);
        DownloadRegistry::new(event_tx)
    }

    #[test]
    fn test_insert_is_unique_by_url() {
        let registry = registry();
        assert!(registry.insert(progress_record("A", 0)));
        assert!(!registry.insert(progress_record("A", 100)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("A").unwrap().downloaded_bytes(), Some(0));
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let registry = registry();
        for url in ["C", "A", "B"] {
            registry.insert(progress_record(url, 0));
        }
        registry.upsert(progress_record("A", 10));

        let urls: Vec<_> = registry.list().into_iter().map(|d| d.url).collect();
        assert_eq!(urls, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_update_notifies_after_commit() {
        let registry = registry();
        registry.insert(progress_record("A", 0));
        let mut rx = registry.subscribe();

        let changed = registry.update("A", |d| {
            d.state = DownloadState::Completed;
            true
        });
        assert_eq!(changed, Some(true));

        match rx.try_recv().unwrap() {
            CoreEvent::DownloadUpdated { download } => {
                assert_eq!(download.state, DownloadState::Completed);
                // The broadcast copy matches what a reader sees now
                assert_eq!(registry.find("A").unwrap(), download);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_update_without_change_is_silent() {
        let registry = registry();
        registry.insert(progress_record("A", 0));
        let mut rx = registry.subscribe();

        assert_eq!(registry.update("A", |_| false), Some(false));
        assert_eq!(registry.update("missing", |_| true), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove() {
        let registry = registry();
        registry.insert(progress_record("A", 0));
        let mut rx = registry.subscribe();

        assert!(registry.remove("A").is_some());
        assert!(registry.remove("A").is_none());
        assert!(registry.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::DownloadRemoved { url } if url == "A"
        ));
    }

    #[test]
    fn test_unannounced_changes_wait_for_announce() {
        let registry = registry();
        let mut rx = registry.subscribe();

        assert!(registry.insert_unannounced(progress_record("A", 0)));
        let updated = registry.update_unannounced("A", |d| {
            d.state = DownloadState::Completed;
            true
        });
        assert_eq!(updated.flatten().unwrap().state, DownloadState::Completed);
        assert_eq!(registry.update_unannounced("A", |_| false), Some(None));
        assert!(rx.try_recv().is_err());

        registry.announce(CoreEvent::DownloadUpdated {
            download: registry.find("A").unwrap(),
        });
        assert!(matches!(rx.try_recv().unwrap(), CoreEvent::DownloadUpdated { .. }));

        assert!(registry.remove_unannounced("A").is_some());
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_replace_all_drops_duplicates() {
        let registry = registry();
        registry.insert(progress_record("old", 0));

        registry.replace_all(vec![
            progress_record("A", 1),
            progress_record("B", 2),
            progress_record("A", 3),
        ]);

        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].downloaded_bytes(), Some(1));
        assert!(!registry.contains("old"));
    }
}
