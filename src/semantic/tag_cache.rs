//! Short-lived tags for uploaded query images.
//!
//! An image query is embedded once; the vector is parked here under a tag so
//! that later pages of the same query can be fetched without re-uploading.
//! Entries are scoped to a session and bounded by both age and count.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TagCacheError {
    #[error("tag {0} not found or expired")]
    NotFound(String),
}

pub struct TagCache {
    ttl: Duration,
    /// `session_tag` -> (inserted, vector), least recently used evicted first.
    entries: Mutex<LruCache<String, (Instant, Vec<f32>)>>,
}

impl TagCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Tag derived from the vector's bytes. Different vectors may collide;
    /// the later one wins.
    pub fn tag_for(vector: &[f32]) -> String {
        let mut hasher = Sha256::new();
        for value in vector {
            hasher.update(value.to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }

    fn key(tag: &str, session_id: &str) -> String {
        format!("{session_id}_{tag}")
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, (Instant, Vec<f32>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, inserted: Instant, now: Instant) -> bool {
        now.duration_since(inserted) >= self.ttl
    }

    /// Drop every expired entry, wherever it sits in recency order.
    fn purge_expired(&self, entries: &mut LruCache<String, (Instant, Vec<f32>)>, now: Instant) {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, (inserted, _))| self.is_expired(*inserted, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }

    /// Store `vector` for `session_id` and return its tag.
    pub fn add(&self, vector: Vec<f32>, session_id: &str) -> String {
        let tag = Self::tag_for(&vector);
        let now = Instant::now();

        let mut entries = self.lock();
        if entries.len() == entries.cap().get() {
            self.purge_expired(&mut entries, now);
        }

        if let Some((evicted, _)) = entries.push(Self::key(&tag, session_id), (now, vector)) {
            log::debug!("tag cache entry {evicted} replaced or evicted");
        }
        tag
    }

    pub fn get(&self, tag: &str, session_id: &str) -> Result<Vec<f32>, TagCacheError> {
        let key = Self::key(tag, session_id);
        let now = Instant::now();
        let mut entries = self.lock();

        let hit = entries
            .get(&key)
            .map(|(inserted, vector)| (self.is_expired(*inserted, now), vector.clone()));
        match hit {
            Some((false, vector)) => Ok(vector),
            Some((true, _)) => {
                entries.pop(&key);
                Err(TagCacheError::NotFound(tag.to_string()))
            }
            None => Err(TagCacheError::NotFound(tag.to_string())),
        }
    }

    /// Live entries; expired ones are dropped on the way.
    pub fn len(&self) -> usize {
        let mut entries = self.lock();
        self.purge_expired(&mut entries, Instant::now());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
