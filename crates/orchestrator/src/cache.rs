use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use sheetflow_core::{DataFile, OutputData};
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

/// Successful Act outputs keyed by a fingerprint of prompt and input data.
///
/// Backs the `fallback` repair strategy. Oldest entries are evicted first.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, OutputData>,
    order: VecDeque<String>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn fingerprint(prompt: &str, files: &[DataFile]) -> String {
        let mut hasher = DefaultHasher::new();
        prompt.trim().hash(&mut hasher);
        for file in files {
            file.file_name.hash(&mut hasher);
            for sheet in &file.sheets {
                sheet.name.hash(&mut hasher);
                serde_json::to_string(&sheet.rows)
                    .unwrap_or_default()
                    .hash(&mut hasher);
            }
        }
        format!("{:016x}", hasher.finish())
    }

    pub fn get(&self, key: &str) -> Option<OutputData> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).cloned()
    }

    pub fn insert(&self, key: String, output: OutputData) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.insert(key.clone(), output).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                debug!(key = %evicted, "Evicting cached result");
                inner.entries.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
