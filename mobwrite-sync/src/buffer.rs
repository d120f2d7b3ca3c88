//! Reassembly of request blocks split into `b:` fragments.
//!
//! Clients that cannot send a long request in one piece (browsers using
//! GET transports, for instance) escape the block and spread it over
//! numbered slots of a named buffer. Once every slot has been written the
//! block is handed back to the parser.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::escape;
use crate::protocol::FragmentSink;

/// Upper bound on slots per buffer.
pub const MAX_SLOTS: usize = 65_536;

/// Slots of one partially received block.
#[derive(Debug)]
pub struct BufferObject {
    name: String,
    slots: Vec<Option<String>>,
    last_written: Instant,
}

impl BufferObject {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        debug!("Buffer initialized to {} slots: {}", size, name);
        Self {
            name,
            slots: vec![None; size],
            last_written: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `text` in slot `index` (1-based). Out of range writes are
    /// logged and dropped.
    pub fn set(&mut self, index: usize, text: &str) {
        self.last_written = Instant::now();
        match index.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            Some(slot) => {
                *slot = Some(text.to_string());
                debug!(
                    "Inserted into slot {} of a {} slot buffer: {}",
                    index,
                    self.slots.len(),
                    self.name
                );
            }
            None => warn!(
                "Unable to insert {:?} into slot {} of a {} slot buffer: {}",
                text,
                index,
                self.slots.len(),
                self.name
            ),
        }
    }

    /// Every slot holds a non-empty fragment. An empty write leaves the
    /// slot waiting.
    pub fn is_complete(&self) -> bool {
        !self.slots.is_empty()
            && self
                .slots
                .iter()
                .all(|slot| slot.as_deref().is_some_and(|text| !text.is_empty()))
    }

    /// Concatenated, still-escaped contents.
    pub fn joined(&self) -> String {
        self.slots.iter().flatten().map(String::as_str).collect()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_written.elapsed() > timeout
    }
}

/// Registry key of a buffer.
pub fn buffer_key(name: &str, size: usize) -> String {
    format!("{name}_{size}")
}

/// Open buffers, keyed by `name_size`.
#[derive(Debug, Default)]
pub struct BufferStore {
    buffers: Mutex<HashMap<String, Arc<Mutex<BufferObject>>>>,
}

impl BufferStore {
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// Write one fragment and return the unescaped block if it completed
    /// the buffer.
    pub fn feed(&self, name: &str, size: usize, index: usize, text: &str) -> Option<String> {
        if size == 0 || size > MAX_SLOTS {
            error!("Invalid buffer size {} for buffer {:?}", size, name);
            return None;
        }
        if size == 1 {
            // Nothing to wait for.
            if index != 1 {
                warn!("Unable to insert into slot {} of a 1 slot buffer: {}", index, name);
                return None;
            }
            return Some(escape::unescape(text));
        }

        let key = buffer_key(name, size);
        let buffer = {
            let mut buffers = self.buffers.lock();
            buffers
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!("Creating buffer: {}", key);
                    Arc::new(Mutex::new(BufferObject::new(key.clone(), size)))
                })
                .clone()
        };

        let joined = {
            let mut object = buffer.lock();
            object.set(index, text);
            if !object.is_complete() {
                return None;
            }
            object.joined()
        };

        let mut buffers = self.buffers.lock();
        if buffers.get(&key).is_some_and(|current| Arc::ptr_eq(current, &buffer)) {
            buffers.remove(&key);
        } else {
            // Another fragment completed it first.
            return None;
        }
        Some(escape::unescape(&joined))
    }

    /// Drop buffers idle longer than `timeout`; returns how many went.
    pub fn cleanup(&self, timeout: Duration) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|key, buffer| {
            let keep = !buffer.lock().is_expired(timeout);
            if !keep {
                log::info!("Expired buffer: {}", key);
            }
            keep
        });
        before - buffers.len()
    }
}

impl FragmentSink for BufferStore {
    fn feed_fragment(&self, name: &str, size: usize, index: usize, text: &str) -> Option<String> {
        self.feed(name, size, index, text)
    }
}
