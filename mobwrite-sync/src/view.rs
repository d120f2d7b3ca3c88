//! Per-client views of a text.
//!
//! A view is the server's model of one client editing one file: the shadow
//! it believes the client holds, a backup of that shadow for recovering
//! from a lost reply, the version counters of both sides and the edits
//! the client has not acknowledged yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Mutex, MutexGuard};

use crate::text::TextObject;

/// Shadow state of a view, guarded by the view lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    pub shadow: String,
    pub backup_shadow: String,
    pub shadow_client_version: u64,
    pub shadow_server_version: u64,
    pub backup_shadow_server_version: u64,
    /// Unacknowledged reply lines, oldest first, keyed by server version.
    pub edit_stack: Vec<(u64, String)>,
}

impl ViewState {
    /// Restore the backup shadow when the client evidently never received
    /// the previous reply. Returns true if a rollback happened.
    pub fn rollback_if_needed(&mut self, server_version: u64) -> bool {
        if server_version == self.shadow_server_version
            || server_version != self.backup_shadow_server_version
        {
            return false;
        }
        warn!(
            "Rollback from shadow {} to backup shadow {}",
            self.shadow_server_version, self.backup_shadow_server_version
        );
        self.shadow = self.backup_shadow.clone();
        self.shadow_server_version = self.backup_shadow_server_version;
        self.edit_stack.clear();
        true
    }

    /// Drop edits the client has acknowledged.
    pub fn prune_acked(&mut self, server_version: u64) {
        self.edit_stack.retain(|(version, _)| *version > server_version);
    }

    /// Copy the shadow into the backup.
    pub fn backup(&mut self) {
        self.backup_shadow = self.shadow.clone();
        self.backup_shadow_server_version = self.shadow_server_version;
    }
}

#[derive(Debug)]
struct ViewMeta {
    last_accessed: Instant,
    handle: Option<String>,
}

/// One (username, filename) pair.
pub struct ViewObject {
    username: String,
    filename: String,
    text: Arc<TextObject>,
    state: Mutex<ViewState>,
    meta: Mutex<ViewMeta>,
}

impl ViewObject {
    /// Create a view on `text`. The caller attaches the view to the text.
    pub fn new(username: impl Into<String>, filename: impl Into<String>, text: Arc<TextObject>) -> Self {
        Self {
            username: username.into(),
            filename: filename.into(),
            text,
            state: Mutex::new(ViewState::default()),
            meta: Mutex::new(ViewMeta {
                last_accessed: Instant::now(),
                handle: None,
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn text(&self) -> &Arc<TextObject> {
        &self.text
    }

    pub fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock()
    }

    /// Refresh the idle timer and remember the latest collaborator handle.
    pub fn touch(&self, handle: Option<&str>) {
        let mut meta = self.meta.lock();
        meta.last_accessed = Instant::now();
        if let Some(handle) = handle {
            meta.handle = Some(handle.to_string());
        }
    }

    pub fn handle(&self) -> Option<String> {
        self.meta.lock().handle.clone()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.meta.lock().last_accessed.elapsed() > timeout
    }
}

impl std::fmt::Debug for ViewObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewObject")
            .field("username", &self.username)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}
