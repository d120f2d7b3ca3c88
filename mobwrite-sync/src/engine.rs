//! Differential synchronization of one view against its master text.
//!
//! ```text
//!  client edits ──► delta ──► shadow ──patch──► master text
//!                               │                    │
//!                               └──── diff ◄─────────┘
//!                                      │
//!                               reply delta ──► client
//! ```
//!
//! Every run of actions for the same (user, file) ends with exactly one
//! reply: a delta from the shadow to the master text, or a raw overwrite
//! when the client's edits could not be trusted.

use log::{debug, info, warn};

use crate::diff::{self, DiffEngine};
use crate::escape;
use crate::protocol::{self, Action, Mode};
use crate::view::{ViewObject, ViewState};

/// Result of processing a run of actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reply for the run.
    Reply {
        /// Shadow client version to report in the `F:` line.
        client_version: u64,
        /// Every unacknowledged edit line, oldest first.
        edits: Vec<String>,
    },
    /// A null action deleted the document after `consumed` actions; the
    /// view must be expired and the rest of the run needs a fresh view.
    Nullified { consumed: usize },
}

/// Applies client actions to views and master texts.
#[derive(Debug, Clone, Default)]
pub struct SyncEngine {
    diff: DiffEngine,
}

impl SyncEngine {
    pub fn new(diff: DiffEngine) -> Self {
        Self { diff }
    }

    pub fn diff_engine(&self) -> &DiffEngine {
        &self.diff
    }

    /// Process consecutive actions addressed to `view`. The caller holds
    /// the view lock (`state`) for the whole run.
    pub fn process_run(&self, view: &ViewObject, state: &mut ViewState, actions: &[Action]) -> RunOutcome {
        let mut delta_ok = true;
        let mut force = false;

        for (i, action) in actions.iter().enumerate() {
            if action.mode == Mode::Null {
                debug!("Nullifying: {} {}", view.username(), view.filename());
                view.text().lock().set_text(None);
                return RunOutcome::Nullified { consumed: i + 1 };
            }

            state.rollback_if_needed(action.server_version);
            state.prune_acked(action.server_version);
            force = action.force;

            match action.mode {
                Mode::Raw => {
                    delta_ok = true;
                    self.apply_raw(view, state, action);
                }
                Mode::Delta => {
                    if !self.apply_delta(view, state, action, &mut force) {
                        delta_ok = false;
                    }
                }
                Mode::Null => {}
            }
        }

        let client_version = state.shadow_client_version;
        self.generate_reply(view, state, force, delta_ok);
        RunOutcome::Reply {
            client_version,
            edits: state.edit_stack.iter().map(|(_, line)| line.clone()).collect(),
        }
    }

    /// Take a raw dump as the new shadow, and as the master text when
    /// appropriate.
    fn apply_raw(&self, view: &ViewObject, state: &mut ViewState, action: &Action) {
        let data = escape::unescape(&action.data);
        info!(
            "Got {} bytes raw text: {} {}",
            data.len(),
            view.username(),
            view.filename()
        );
        state.shadow = data.clone();
        state.shadow_client_version = action.client_version;
        state.shadow_server_version = action.server_version;
        state.backup();
        state.edit_stack.clear();

        let mut text = view.text().lock();
        let overwrite = match text.text() {
            None => true,
            Some(master) if master == data => false,
            // Without force, only overwrite when nothing in the master
            // text would be lost.
            Some(master) => action.force || self.only_inserts(master, &data),
        };
        if overwrite {
            text.set_text(Some(data));
            debug!("Overwrote content: {} {}", view.username(), view.filename());
        }
    }

    fn only_inserts(&self, from: &str, to: &str) -> bool {
        self.diff
            .diff_main(from, to)
            .iter()
            .all(|d| d.op != diff::Operation::Delete)
    }

    /// Apply a delta. Returns false when the exchange is no longer valid
    /// and the client must be resynchronised with a raw overwrite.
    fn apply_delta(&self, view: &ViewObject, state: &mut ViewState, action: &Action, force: &mut bool) -> bool {
        info!(
            "Got {:?} delta: {} {}",
            action.data,
            view.username(),
            view.filename()
        );
        if action.server_version != state.shadow_server_version {
            warn!(
                "Shadow version mismatch: {} != {}",
                action.server_version, state.shadow_server_version
            );
            return false;
        }
        if action.client_version > state.shadow_client_version {
            warn!(
                "Future delta: {} > {}",
                action.client_version, state.shadow_client_version
            );
            return false;
        }
        if action.client_version < state.shadow_client_version {
            warn!(
                "Repeated delta: {} < {}",
                action.client_version, state.shadow_client_version
            );
            return true;
        }

        let diffs = diff::from_delta(&state.shadow, &action.data);
        state.shadow_client_version += 1;
        let diffs = match diffs {
            Ok(diffs) => diffs,
            Err(e) => {
                warn!(
                    "Delta failure ({}), expected {} length: {} {}",
                    e,
                    state.shadow.chars().count(),
                    view.username(),
                    view.filename()
                );
                return false;
            }
        };

        let patches = self.diff.patch_make(&state.shadow, &diffs);
        state.shadow = diff::text2(&diffs);
        state.backup();

        let mut text = view.text().lock();
        let master = match text.text() {
            None => {
                // First we hear of this text; the client's copy is it.
                *force = false;
                state.shadow.clone()
            }
            Some(master) if action.force => {
                if diff::is_noop(&diffs) {
                    master.to_string()
                } else {
                    debug!("Overwrote content: {} {}", view.username(), view.filename());
                    state.shadow.clone()
                }
            }
            Some(master) => {
                let (patched, results) = self.diff.patch_apply(&patches, master);
                debug!(
                    "Patched ({}): {} {}",
                    results
                        .iter()
                        .map(|ok| ok.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                    view.username(),
                    view.filename()
                );
                patched
            }
        };
        text.set_text(Some(master));
        true
    }

    /// Push the reply for this run onto the edit stack and move the
    /// shadow to the master text.
    fn generate_reply(&self, view: &ViewObject, state: &mut ViewState, force: bool, delta_ok: bool) {
        let master = {
            let mut text = view.text().lock();
            if text.text().is_none() && delta_ok {
                text.set_text(Some(state.shadow.clone()));
            }
            text.text().map(str::to_string)
        };

        let version = state.shadow_server_version;
        match master {
            Some(master) if delta_ok => {
                let mut diffs = self.diff.diff_main(&state.shadow, &master);
                self.diff.cleanup_efficiency(&mut diffs);
                let delta = diff::to_delta(&diffs);
                info!(
                    "Sent {:?} delta: {} {}",
                    delta,
                    view.username(),
                    view.filename()
                );
                state.edit_stack.push((version, protocol::delta_line(force, version, &delta)));
                state.shadow_server_version += 1;
                state.shadow = master;
            }
            master => {
                // The client's state is unknown; overwrite it.
                state.shadow_client_version += 1;
                state.edit_stack.retain(|(v, _)| *v < version);
                let line = protocol::raw_line(version, master.as_deref());
                info!(
                    "Sent {} bytes raw text: {} {}",
                    line.len(),
                    view.username(),
                    view.filename()
                );
                state.edit_stack.push((version, line));
                state.shadow = master.unwrap_or_default();
            }
        }
    }
}
