//! TTL-bounded LRU cache for computed proposal batches.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use lore_object::{ContentHash, IdHash};

use crate::engine::Proposal;

/// Default bounds: 50 batches, 60 second freshness.
pub const CACHE_CAPACITY: usize = 50;
pub const CACHE_TTL: Duration = Duration::from_secs(60);

/// Snapshot of the cache performance counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit rate as a percentage 0.0 – 100.0.
    pub hit_rate_pct: f32,
}

/// Cache key: the topic plus a digest of its sorted current subject ids,
/// so a changed subject set misses naturally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    topic_id: String,
    subjects_digest: ContentHash,
}

impl CacheKey {
    pub fn new(topic_id: &str, subject_ids: &[IdHash]) -> Self {
        let mut sorted: Vec<IdHash> = subject_ids.to_vec();
        sorted.sort();
        let mut bytes = Vec::with_capacity(sorted.len() * 32);
        for id in sorted {
            bytes.extend_from_slice(id.as_bytes());
        }
        Self {
            topic_id: topic_id.to_string(),
            subjects_digest: ContentHash::of(&bytes),
        }
    }
}

struct CachedBatch {
    proposals: Vec<Proposal>,
    inserted_at: Instant,
}

pub struct ProposalCache {
    entries: LruCache<CacheKey, CachedBatch>,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

impl ProposalCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero after max");
        Self {
            entries: LruCache::new(capacity),
            ttl,
            hits: 0,
            misses: 0,
        }
    }

    /// Fresh batch for the key, if any. Expired entries are evicted on
    /// access and count as misses.
    pub fn get(&mut self, key: &CacheKey) -> Option<Vec<Proposal>> {
        match self.entries.get(key) {
            Some(batch) if batch.inserted_at.elapsed() <= self.ttl => {
                self.hits += 1;
                Some(batch.proposals.clone())
            }
            Some(_) => {
                self.entries.pop(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: CacheKey, proposals: Vec<Proposal>) {
        self.entries.put(
            key,
            CachedBatch {
                proposals,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop everything; configuration changes call this.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            capacity: self.entries.cap().get(),
            len: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate_pct: if total == 0 {
                0.0
            } else {
                (self.hits as f32 / total as f32) * 100.0
            },
        }
    }
}

impl Default for ProposalCache {
    fn default() -> Self {
        Self::new(CACHE_CAPACITY, CACHE_TTL)
    }
}
