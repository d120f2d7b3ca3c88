//! Authoritative master texts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::storage::Persister;

/// Mutable part of a [`TextObject`], guarded by its lock.
#[derive(Debug)]
pub struct TextState {
    text: Option<String>,
    /// Changed since the last successful save.
    dirty: bool,
    loaded: bool,
    last_modified: Instant,
}

/// One shared document.
///
/// The stored copy is loaded the first time the text is locked, so the
/// registry never does storage I/O while holding its own map lock.
pub struct TextObject {
    name: String,
    max_chars: usize,
    persister: Arc<dyn Persister>,
    state: Mutex<TextState>,
    /// Number of views attached to this text.
    refs: AtomicUsize,
}

impl TextObject {
    pub fn new(name: impl Into<String>, max_chars: usize, persister: Arc<dyn Persister>) -> Self {
        Self {
            name: name.into(),
            max_chars,
            persister,
            state: Mutex::new(TextState {
                text: None,
                dirty: false,
                loaded: false,
                last_modified: Instant::now(),
            }),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the text, loading it from storage on first use.
    pub fn lock(&self) -> TextGuard<'_> {
        let mut state = self.state.lock();
        if !state.loaded {
            state.loaded = true;
            match self.persister.load(&self.name) {
                Ok(Some(stored)) => {
                    debug!("Loaded text: {:?}", self.name);
                    state.text = Some(scrub(stored, self.max_chars));
                }
                Ok(None) => debug!("No stored text for {:?}", self.name),
                Err(e) => error!("Failed to load {:?}: {}", self.name, e),
            }
        }
        TextGuard {
            object: self,
            state,
        }
    }

    pub fn attach(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn detach(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TextObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextObject")
            .field("name", &self.name)
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a text.
pub struct TextGuard<'a> {
    object: &'a TextObject,
    state: MutexGuard<'a, TextState>,
}

impl TextGuard<'_> {
    pub fn text(&self) -> Option<&str> {
        self.state.text.as_deref()
    }

    /// Replace the text (`None` nullifies it), applying the length cap and
    /// line-break normalisation.
    pub fn set_text(&mut self, text: Option<String>) {
        let text = text.map(|t| scrub(t, self.object.max_chars));
        if self.state.text != text {
            self.state.text = text;
            self.state.dirty = true;
            self.state.last_modified = Instant::now();
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    pub fn last_modified(&self) -> Instant {
        self.state.last_modified
    }

    /// Persist the text if it changed. Returns false if the save failed;
    /// the text stays dirty and is retried by the next sweep.
    pub fn save(&mut self) -> bool {
        if !self.state.dirty {
            return true;
        }
        match self
            .object
            .persister
            .save(&self.object.name, self.state.text.as_deref())
        {
            Ok(()) => {
                debug!("Saved text: {:?}", self.object.name);
                self.state.dirty = false;
                true
            }
            Err(e) => {
                error!("Failed to save {:?}: {}", self.object.name, e);
                false
            }
        }
    }
}

/// Keep the trailing `max_chars` characters and normalise line breaks.
fn scrub(text: String, max_chars: usize) -> String {
    let mut text = text;
    if max_chars != 0 {
        let len = text.chars().count();
        if len > max_chars {
            let cut = text
                .char_indices()
                .nth(len - max_chars)
                .map_or(text.len(), |(i, _)| i);
            text.drain(..cut);
            warn!("Truncated text to {} characters.", max_chars);
        }
    }
    if text.contains('\r') {
        text = text.replace("\r\n", "\n").replace('\r', "\n");
    }
    text
}
