// src/core/cache.rs — Similarity cache for refinement requests
//
// Maps a normalized-instruction hash (plus a coarse content-length
// signature) to the transformation pattern a previous successful
// refinement produced. A hit lets the controller skip the reviewer loop
// and issue a single writer call. Memory-only, LRU-evicted.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};

use super::types::Feedback;

/// Instructions at or past this word count are never cached: long
/// instructions rarely repeat verbatim and their patterns do not transfer.
const SIMPLE_INSTRUCTION_WORDS: usize = 20;

/// Score a refinement must reach before its pattern is worth remembering.
pub const CACHEABLE_SCORE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct RefinementCacheEntry {
    /// Before/after excerpt of the transformation the instructions produced.
    pub pattern: String,
    pub feedback: Feedback,
    pub last_used: DateTime<Utc>,
}

pub struct RefinementCache {
    entries: Mutex<LruCache<String, RefinementCacheEntry>>,
}

impl RefinementCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, RefinementCacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `hex(sha256(normalized instructions)) + "_" + (content_len % 1000)`.
    /// Near-duplicate instructions normalize to the same hash; the length
    /// signature keeps patterns from leaking across very different inputs.
    pub fn key(instructions: &str, content_len: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize(instructions).as_bytes());
        format!("{}_{}", hex::encode(hasher.finalize()), content_len % 1000)
    }

    /// Instructions under twenty words qualify for cache lookups/stores.
    pub fn is_simple(instructions: &str) -> bool {
        instructions.split_whitespace().count() < SIMPLE_INSTRUCTION_WORDS
    }

    /// Lookup promotes the entry and refreshes its `last_used` stamp.
    pub fn get(&self, key: &str) -> Option<RefinementCacheEntry> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        entry.last_used = Utc::now();
        Some(entry.clone())
    }

    /// Insert a pattern, evicting the least-recently-used entry when full.
    pub fn insert(&self, key: String, pattern: String, feedback: Feedback) {
        self.lock().put(
            key,
            RefinementCacheEntry {
                pattern,
                feedback,
                last_used: Utc::now(),
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().peek(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn normalize(instructions: &str) -> String {
    instructions
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
