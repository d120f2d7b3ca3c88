//! Live texts, views and buffers, and their lifecycle.
//!
//! ```text
//!            fetch_view(user, file)
//!                    │
//!      ┌─────────────▼─────────────┐      ┌──────────────────────┐
//!      │ views: (user, file) → View│─────►│ texts: name → Text    │
//!      └─────────────┬─────────────┘ refs └──────────┬───────────┘
//!                    │                                │ save / evict
//!               idle timeout                   ┌──────▼──────┐
//!                    ▼                         │  Persister  │
//!                cleanup() ───────────────────►└─────────────┘
//! ```
//!
//! Each map has its own lock, held only to find, create or remove an
//! entry. Lock order: views map before texts map; a text's own lock may be
//! held while taking the texts map lock, never the other way round.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::buffer::BufferStore;
use crate::config::SyncConfig;
use crate::protocol::FragmentSink;
use crate::storage::Persister;
use crate::text::TextObject;
use crate::view::ViewObject;

type ViewKey = (String, String);

/// What one cleanup sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub views_expired: usize,
    pub texts_saved: usize,
    pub save_failures: usize,
    pub texts_evicted: usize,
    pub buffers_expired: usize,
}

/// Object counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub texts: usize,
    pub views: usize,
    pub buffers: usize,
}

/// Owner of all synchronization state.
pub struct SessionRegistry {
    config: SyncConfig,
    persister: Arc<dyn Persister>,
    texts: Mutex<HashMap<String, Arc<TextObject>>>,
    views: Mutex<HashMap<ViewKey, Arc<ViewObject>>>,
    buffers: BufferStore,
}

impl SessionRegistry {
    pub fn new(config: SyncConfig, persister: Arc<dyn Persister>) -> Self {
        Self {
            config,
            persister,
            texts: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            buffers: BufferStore::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn buffers(&self) -> &BufferStore {
        &self.buffers
    }

    /// Find or create the text `name` and attach one view to it.
    fn attach_text(&self, name: &str) -> Arc<TextObject> {
        let mut texts = self.texts.lock();
        let text = texts
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating text: {:?}", name);
                Arc::new(TextObject::new(
                    name,
                    self.config.max_chars,
                    self.persister.clone(),
                ))
            })
            .clone();
        text.attach();
        text
    }

    /// Find or create the view for (`username`, `filename`).
    ///
    /// Returns `None` when the view limit is reached.
    pub fn fetch_view(&self, username: &str, filename: &str, handle: Option<&str>) -> Option<Arc<ViewObject>> {
        let mut views = self.views.lock();
        let key = (username.to_string(), filename.to_string());
        if let Some(view) = views.get(&key) {
            debug!("Accepted view: {} {}", username, filename);
            view.touch(handle);
            return Some(view.clone());
        }

        if self.config.max_views != 0 && views.len() >= self.config.max_views {
            error!("Too many views connected at once ({})", views.len());
            return None;
        }

        debug!("Creating view: {} {}", username, filename);
        let text = self.attach_text(filename);
        let view = Arc::new(ViewObject::new(username, filename, text));
        view.touch(handle);
        views.insert(key, view.clone());
        Some(view)
    }

    /// Remove `view` right away and detach it from its text.
    pub fn expire_view(&self, view: &Arc<ViewObject>) {
        let key = (view.username().to_string(), view.filename().to_string());
        let removed = {
            let mut views = self.views.lock();
            match views.get(&key) {
                Some(current) if Arc::ptr_eq(current, view) => views.remove(&key),
                _ => None,
            }
        };
        if let Some(view) = removed {
            info!("Unloading view: {} {}", view.username(), view.filename());
            view.text().detach();
        }
    }

    pub fn view(&self, username: &str, filename: &str) -> Option<Arc<ViewObject>> {
        self.views
            .lock()
            .get(&(username.to_string(), filename.to_string()))
            .cloned()
    }

    pub fn text(&self, name: &str) -> Option<Arc<TextObject>> {
        self.texts.lock().get(name).cloned()
    }

    /// Handles of the views attached to `filename`.
    pub fn collaborators(&self, filename: &str) -> Vec<String> {
        self.views
            .lock()
            .values()
            .filter(|view| view.filename() == filename)
            .filter_map(|view| view.handle())
            .collect()
    }

    /// Expire idle views, save dirty texts, evict unreferenced texts and
    /// drop stale buffers.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let expired: Vec<Arc<ViewObject>> = {
            let mut views = self.views.lock();
            let keys: Vec<ViewKey> = views
                .iter()
                .filter(|(_, view)| view.is_expired(self.config.view_timeout))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| views.remove(key)).collect()
        };
        for view in &expired {
            info!("Idle out: {} {}", view.username(), view.filename());
            view.text().detach();
        }
        report.views_expired = expired.len();

        let texts: Vec<Arc<TextObject>> = self.texts.lock().values().cloned().collect();
        for text in texts {
            let mut guard = text.lock();
            if guard.is_dirty() {
                if guard.save() {
                    report.texts_saved += 1;
                } else {
                    report.save_failures += 1;
                }
            }
            if guard.is_dirty() || text.ref_count() > 0 {
                continue;
            }
            let mut map = self.texts.lock();
            // A view may have attached since the check above.
            let unused = text.ref_count() == 0
                && map.get(text.name()).is_some_and(|current| Arc::ptr_eq(current, &text));
            if unused {
                info!("Unloading text: {:?}", text.name());
                map.remove(text.name());
                report.texts_evicted += 1;
            }
        }

        report.buffers_expired = self.buffers.cleanup(self.config.buffer_timeout);
        debug!("Cleanup: {:?}", report);
        report
    }

    /// Save every dirty text. Returns the number of failed saves.
    pub fn flush(&self) -> usize {
        let texts: Vec<Arc<TextObject>> = self.texts.lock().values().cloned().collect();
        texts
            .iter()
            .filter(|text| !text.lock().save())
            .count()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            views: self.views.lock().len(),
            texts: self.texts.lock().len(),
            buffers: self.buffers.len(),
        }
    }
}

impl FragmentSink for SessionRegistry {
    fn feed_fragment(&self, name: &str, size: usize, index: usize, text: &str) -> Option<String> {
        self.buffers.feed(name, size, index, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn registry(config: SyncConfig) -> (Arc<MemoryStore>, SessionRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), SessionRegistry::new(config, store))
    }

    #[test]
    fn test_fetch_view_reuses_and_shares_text() {
        let (_store, registry) = registry(SyncConfig::default());
        let a = registry.fetch_view("alice", "doc", None).unwrap();
        let again = registry.fetch_view("alice", "doc", None).unwrap();
        let b = registry.fetch_view("bob", "doc", None).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(Arc::ptr_eq(a.text(), b.text()));
        assert_eq!(a.text().ref_count(), 2);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                texts: 1,
                views: 2,
                buffers: 0
            }
        );
    }

    #[test]
    fn test_view_limit() {
        let config = SyncConfig {
            max_views: 2,
            ..SyncConfig::default()
        };
        let (_store, registry) = registry(config);
        assert!(registry.fetch_view("a", "doc", None).is_some());
        assert!(registry.fetch_view("b", "doc", None).is_some());
        assert!(registry.fetch_view("c", "doc", None).is_none());
        // Existing views are still served.
        assert!(registry.fetch_view("a", "doc", None).is_some());
    }

    #[test]
    fn test_expire_view_detaches() {
        let (_store, registry) = registry(SyncConfig::default());
        let view = registry.fetch_view("alice", "doc", None).unwrap();
        registry.expire_view(&view);
        registry.expire_view(&view);
        assert!(registry.view("alice", "doc").is_none());
        assert_eq!(view.text().ref_count(), 0);
        let fresh = registry.fetch_view("alice", "doc", None).unwrap();
        assert!(!Arc::ptr_eq(&view, &fresh));
    }

    #[test]
    fn test_collaborators() {
        let (_store, registry) = registry(SyncConfig::default());
        registry.fetch_view("alice", "doc", Some("a1"));
        registry.fetch_view("bob", "doc", Some("b1"));
        registry.fetch_view("carol", "doc", None);
        registry.fetch_view("dave", "other", Some("d1"));
        let mut handles = registry.collaborators("doc");
        handles.sort();
        assert_eq!(handles, vec!["a1".to_string(), "b1".to_string()]);
    }

    #[test]
    fn test_cleanup_saves_and_evicts() {
        let (store, registry) = registry(SyncConfig::for_testing());
        let view = registry.fetch_view("alice", "doc", None).unwrap();
        view.text().lock().set_text(Some("draft".to_string()));
        drop(view);

        let report = registry.cleanup();
        assert_eq!(report.texts_saved, 1);
        assert_eq!(report.views_expired, 0);
        assert_eq!(report.texts_evicted, 0);
        assert_eq!(store.load("doc").unwrap().as_deref(), Some("draft"));

        std::thread::sleep(Duration::from_millis(80));
        let report = registry.cleanup();
        assert_eq!(report.views_expired, 1);
        assert_eq!(report.texts_evicted, 1);
        assert_eq!(registry.stats(), RegistryStats::default());

        // Reloaded from storage on next use.
        let view = registry.fetch_view("bob", "doc", None).unwrap();
        assert_eq!(view.text().lock().text(), Some("draft"));
    }

    #[test]
    fn test_flush_saves_dirty_texts() {
        let (store, registry) = registry(SyncConfig::default());
        let view = registry.fetch_view("alice", "doc", None).unwrap();
        view.text().lock().set_text(Some("unsaved".to_string()));
        assert_eq!(registry.flush(), 0);
        assert_eq!(store.load("doc").unwrap().as_deref(), Some("unsaved"));
    }

    #[test]
    fn test_fragments_go_to_buffers() {
        let (_store, registry) = registry(SyncConfig::default());
        assert_eq!(registry.feed_fragment("x", 2, 1, "a"), None);
        assert_eq!(registry.stats().buffers, 1);
        assert_eq!(registry.feed_fragment("x", 2, 2, "b"), Some("ab".to_string()));
        assert_eq!(registry.stats().buffers, 0);
    }
}
