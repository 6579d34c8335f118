// Lowering cache
//
// Lowering is deterministic, so each distinct shader only needs to go through
// the converter once. Results are shared behind an Arc.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mesh::{self, LowerOptions, LoweredShader};

/// Lowered shaders keyed by name, then by their exact words.
type Entries = HashMap<String, HashMap<Vec<u32>, Arc<LoweredShader>>>;

pub struct LoweringCache {
    options: LowerOptions,
    entries: Mutex<Entries>,
}

impl LoweringCache {
    pub fn new(options: LowerOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &LowerOptions {
        &self.options
    }

    /// Lower `words` unless an identical shader was lowered before.
    pub fn get_or_lower(&self, name: &str, words: &[u32]) -> mesh::Result<Arc<LoweredShader>> {
        if let Some(hit) = self.entries.lock().get(name).and_then(|by_words| by_words.get(words)) {
            log::debug!("cache hit for `{name}`");
            return Ok(Arc::clone(hit));
        }

        // Lower outside the lock; a racing duplicate produces the same output.
        let lowered = Arc::new(mesh::lower(name, words, self.options)?);
        let mut entries = self.entries.lock();
        let by_words = entries.entry(name.to_owned()).or_default();
        Ok(Arc::clone(by_words.entry(words.to_vec()).or_insert(lowered)))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for LoweringCache {
    fn default() -> Self {
        Self::new(LowerOptions::default())
    }
}
