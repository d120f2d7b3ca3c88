//! Request orchestration.
//!
//! One request block goes in, one reply block comes out. Consecutive
//! actions for the same (username, filename) form a run that is processed
//! under a single view lock.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::diff::DiffEngine;
use crate::engine::{RunOutcome, SyncEngine};
use crate::protocol::{self, Action, ReplyWriter, Request};
use crate::registry::SessionRegistry;

/// Turns request blocks into reply blocks against a shared registry.
pub struct SyncService {
    registry: Arc<SessionRegistry>,
    engine: SyncEngine,
}

impl SyncService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let engine = SyncEngine::new(DiffEngine::with_timeout(registry.config().diff_timeout));
        Self { registry, engine }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle a request read straight off the wire.
    pub fn handle_bytes(&self, data: &[u8]) -> String {
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_request(text),
            Err(e) => {
                warn!("Request is not valid UTF-8: {}", e);
                String::new()
            }
        }
    }

    pub fn handle_request(&self, data: &str) -> String {
        let request = protocol::parse_request(data, self.registry.as_ref());
        info!("Parsed {} actions", request.actions.len());
        self.execute(&request)
    }

    /// Run the actions of a parsed request and build the reply.
    ///
    /// Returns an empty reply when the view limit is reached.
    pub fn execute(&self, request: &Request) -> String {
        let mut reply = ReplyWriter::new(request.echo_username);
        let actions = &request.actions;

        let mut start = 0;
        while start < actions.len() {
            let first = &actions[start];
            let end = actions[start..]
                .iter()
                .position(|action| !action.same_view(first))
                .map_or(actions.len(), |n| start + n);

            if !self.execute_run(&actions[start..end], &mut reply) {
                return String::new();
            }
            start = end;
        }

        if request.echo_collaborators {
            if let Some(last) = actions.last() {
                reply.write_collaborators(&self.registry.collaborators(&last.filename));
            }
        }
        reply.finish()
    }

    /// Process one run, fetching a fresh view after every nullify.
    /// Returns false when no view could be obtained.
    fn execute_run(&self, mut run: &[Action], reply: &mut ReplyWriter) -> bool {
        while let Some(first) = run.first() {
            let Some(view) = self
                .registry
                .fetch_view(&first.username, &first.filename, first.handle.as_deref())
            else {
                error!("No view available for {} {}", first.username, first.filename);
                return false;
            };

            let outcome = {
                let mut state = view.lock();
                self.engine.process_run(&view, &mut state, run)
            };

            match outcome {
                RunOutcome::Reply { client_version, edits } => {
                    debug!(
                        "Replying with {} edits: {} {}",
                        edits.len(),
                        view.username(),
                        view.filename()
                    );
                    reply.write_run(view.username(), view.filename(), client_version, &edits);
                    return true;
                }
                RunOutcome::Nullified { consumed } => {
                    self.registry.expire_view(&view);
                    run = &run[consumed..];
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::storage::{MemoryStore, Persister};

    fn service(config: SyncConfig) -> (Arc<MemoryStore>, SyncService) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(config, store.clone()));
        (store, SyncService::new(registry))
    }

    #[test]
    fn test_raw_upload_round_trip() {
        let (_store, service) = service(SyncConfig::default());
        let reply = service.handle_request("u:alice\nf:0:doc\nR:0:Hello\n\n");
        assert_eq!(reply, "F:0:doc\nD:0:=5\n");
        let text = service.registry().text("doc").unwrap();
        assert_eq!(text.lock().text(), Some("Hello"));
    }

    #[test]
    fn test_overflowing_delta_gets_resync() {
        let (_store, service) = service(SyncConfig::default());
        service.handle_request("u:alice\nf:0:doc\nr:0:ab\n\n");
        let reply = service.handle_request("u:alice\nf:1:doc\nd:0:=1\t=18446744073709551615\n\n");
        assert_eq!(reply, "F:1:doc\nR:1:ab\n");
        let text = service.registry().text("doc").unwrap();
        assert_eq!(text.lock().text(), Some("ab"));
    }

    #[test]
    fn test_unterminated_request_is_ignored() {
        let (_store, service) = service(SyncConfig::default());
        assert_eq!(service.handle_request("u:alice\nf:0:doc\nr:0:Hello\n"), "");
        assert!(service.registry().text("doc").is_none());
    }

    #[test]
    fn test_echo_username_and_collaborators() {
        let (_store, service) = service(SyncConfig::default());
        service.handle_request("u:bob\nh:bob-1\nf:0:doc\nr:0:\n\n");
        let reply = service.handle_request("U:alice\nH:alice-1\nf:0:doc\nr:0:Hi\n\n");
        assert_eq!(reply, "u:alice\nF:0:doc\nd:0:=2\nC:alice-1,bob-1\n");
    }

    #[test]
    fn test_multiple_files_in_one_request() {
        let (_store, service) = service(SyncConfig::default());
        let reply = service.handle_request("u:alice\nf:0:one\nr:0:a\nf:0:two\nr:0:b\n\n");
        assert_eq!(reply, "F:0:one\nd:0:=1\nF:0:two\nd:0:=1\n");
    }

    #[test]
    fn test_capacity_yields_empty_reply() {
        let config = SyncConfig {
            max_views: 1,
            ..SyncConfig::default()
        };
        let (_store, service) = service(config);
        assert!(!service.handle_request("u:a\nf:0:doc\nr:0:x\n\n").is_empty());
        assert_eq!(service.handle_request("u:b\nf:0:doc\nr:0:x\n\n"), "");
    }

    #[test]
    fn test_nullify_removes_view_and_text() {
        let (store, service) = service(SyncConfig::default());
        service.handle_request("u:alice\nf:0:doc\nR:0:Hello\n\n");
        assert_eq!(service.registry().flush(), 0);
        assert_eq!(store.load("doc").unwrap().as_deref(), Some("Hello"));

        let reply = service.handle_request("u:alice\nn:doc\n\n");
        assert_eq!(reply, "");
        assert!(service.registry().view("alice", "doc").is_none());
        assert_eq!(service.registry().flush(), 0);
        assert_eq!(store.load("doc").unwrap(), None);
    }

    #[test]
    fn test_actions_after_nullify_use_fresh_view() {
        let (_store, service) = service(SyncConfig::default());
        service.handle_request("u:alice\nf:0:doc\nR:0:Hello\n\n");
        let reply = service.handle_request("u:alice\nn:doc\nf:0:doc\nr:0:Again\n\n");
        assert_eq!(reply, "F:0:doc\nd:0:=5\n");
        let view = service.registry().view("alice", "doc").unwrap();
        assert_eq!(view.lock().shadow, "Again");
    }

    #[test]
    fn test_buffered_request() {
        let (_store, service) = service(SyncConfig::default());
        // "u:alice\nf:0:doc\nr:0:Hi\n\n" split over two fragments.
        assert_eq!(service.handle_request("b:req 2 1 u%3Aalice%0Af%3A0%3Adoc%0A\n\n"), "");
        let reply = service.handle_request("b:req 2 2 r%3A0%3AHi%0A%0A\n\n");
        assert_eq!(reply, "F:0:doc\nd:0:=2\n");
    }

    #[test]
    fn test_invalid_utf8_is_dropped() {
        let (_store, service) = service(SyncConfig::default());
        assert_eq!(service.handle_bytes(b"u:alice\nf:0:\xff\n\n"), "");
    }
}
