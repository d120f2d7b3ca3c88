//! In-process storage; contents vanish with the process.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Persister, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    texts: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.texts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.lock().is_empty()
    }

    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let mut texts = self.texts.lock();
        let before = texts.len();
        texts.retain(|_, (_, saved)| saved.elapsed() <= max_age);
        before - texts.len()
    }
}

impl Persister for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.texts.lock().get(name).map(|(text, _)| text.clone()))
    }

    fn save(&self, name: &str, text: Option<&str>) -> Result<(), StoreError> {
        let mut texts = self.texts.lock();
        match text {
            Some(text) => {
                texts.insert(name.to_string(), (text.to_string(), Instant::now()));
            }
            None => {
                texts.remove(name);
            }
        }
        Ok(())
    }
}
