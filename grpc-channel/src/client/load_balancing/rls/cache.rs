/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The route lookup data cache: a size bounded LRU map from lookup keys to
//! lookup results.

use std::collections::HashSet;

use indexmap::IndexMap;
use tokio::time::Instant;

use super::keys::CacheKey;
use crate::status::Status;

// Charged per entry on top of its strings.
const ENTRY_OVERHEAD: usize = 64;

/// The result of the lookups made for one key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The targets returned by the last successful lookup, in preference
    /// order.  Empty if no lookup succeeded yet.
    pub targets: Vec<String>,
    pub header_data: String,
    /// After this, the targets are no longer used.
    pub expiry_time: Instant,
    /// After this, a pick triggers a refresh.
    pub stale_time: Instant,
    /// Set after a failed lookup; no lookup is made before it passes.
    pub backoff_time: Option<Instant>,
    /// The error of the last failed lookup.
    pub status: Option<Status>,
    /// Consecutive failed lookups.
    pub retries: u32,
}

impl CacheEntry {
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_time.is_some_and(|t| now < t)
    }

    fn size(&self, key: &CacheKey) -> usize {
        key.path.len()
            + key.keys.len()
            + self.header_data.len()
            + self.targets.iter().map(String::len).sum::<usize>()
            + ENTRY_OVERHEAD
    }
}

/// An LRU cache bounded by the approximate byte size of its entries.
pub struct DataCache {
    entries: IndexMap<CacheKey, (CacheEntry, usize)>,
    max_size: usize,
    size: usize,
}

impl DataCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            max_size,
            size: 0,
        }
    }

    /// Returns the entry for `key`, marking it most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        let idx = self.entries.get_index_of(key)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        self.entries.get_index(last).map(|(_, (entry, _))| entry)
    }

    /// Returns the entry for `key` without affecting its recency.
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key).map(|(entry, _)| entry)
    }

    /// Adds or replaces the entry for `key` as the most recently used one,
    /// then evicts least recently used entries until the cache fits.  The
    /// entry just added is never evicted.  Returns the evicted entries.
    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> Vec<(CacheKey, CacheEntry)> {
        let size = entry.size(&key);
        if let Some((_, (_, old_size))) = self.entries.shift_remove_entry(&key) {
            self.size -= old_size;
        }
        self.entries.insert(key, (entry, size));
        self.size += size;
        self.evict(1)
    }

    /// Changes the size bound, evicting entries that no longer fit.
    pub fn resize(&mut self, max_size: usize) -> Vec<(CacheKey, CacheEntry)> {
        self.max_size = max_size;
        self.evict(0)
    }

    // Evicts from the least recently used end, keeping at least `keep`
    // entries.
    fn evict(&mut self, keep: usize) -> Vec<(CacheKey, CacheEntry)> {
        let mut evicted = Vec::new();
        while self.size > self.max_size && self.entries.len() > keep {
            let Some((key, (entry, size))) = self.entries.shift_remove_index(0) else {
                break;
            };
            self.size -= size;
            tracing::debug!(path = %key.path, keys = %key.keys, "evicting route lookup cache entry");
            evicted.push((key, entry));
        }
        evicted
    }

    /// Removes entries that are expired and not in backoff.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<(CacheKey, CacheEntry)> {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, (entry, _))| entry.expiry_time <= now && !entry.in_backoff(now))
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let (entry, size) = self.entries.shift_remove(&key)?;
                self.size -= size;
                Some((key, entry))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// Returns every target referenced by an entry.
    pub fn targets(&self) -> HashSet<&str> {
        self.entries
            .values()
            .flat_map(|(entry, _)| entry.targets.iter().map(String::as_str))
            .collect()
    }

    /// Returns true if some lookup failed and no lookup succeeded for its
    /// key.
    pub fn has_failed_lookups(&self) -> bool {
        self.entries
            .values()
            .any(|(entry, _)| entry.targets.is_empty() && entry.status.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey {
            path: path.to_string(),
            keys: String::new(),
        }
    }

    fn entry(target: &str, max_age: Duration) -> CacheEntry {
        let now = Instant::now();
        CacheEntry {
            targets: vec![target.to_string()],
            header_data: String::new(),
            expiry_time: now + max_age,
            stale_time: now + max_age / 2,
            backoff_time: None,
            status: None,
            retries: 0,
        }
    }

    // Every entry built by `key` and `entry` with these lengths costs this.
    const SIZE: usize = 2 + 2 + ENTRY_OVERHEAD;

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used() {
        let mut cache = DataCache::new(3 * SIZE);
        for path in ["/a", "/b", "/c"] {
            assert!(cache.insert(key(path), entry("t1", Duration::from_secs(60))).is_empty());
        }
        assert_eq!(cache.size(), 3 * SIZE);
        // Touch /a so /b is the least recently used.
        assert!(cache.get(&key("/a")).is_some());
        let evicted = cache.insert(key("/d"), entry("t2", Duration::from_secs(60)));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, key("/b"));
        assert!(cache.peek(&key("/a")).is_some());
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_an_entry_updates_size() {
        let mut cache = DataCache::new(1000);
        cache.insert(key("/a"), entry("t1", Duration::from_secs(60)));
        let mut bigger = entry("t1", Duration::from_secs(60));
        bigger.header_data = "0123456789".to_string();
        cache.insert(key("/a"), bigger);
        assert_eq!(cache.size(), SIZE + 10);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newest_entry_survives_a_small_cache() {
        let mut cache = DataCache::new(1);
        assert!(cache.insert(key("/a"), entry("t1", Duration::from_secs(60))).is_empty());
        let evicted = cache.insert(key("/b"), entry("t2", Duration::from_secs(60)));
        assert_eq!(evicted.len(), 1);
        assert!(cache.peek(&key("/b")).is_some());

        let evicted = cache.resize(0);
        assert_eq!(evicted.len(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn purges_expired_entries_not_in_backoff() {
        let mut cache = DataCache::new(1000);
        cache.insert(key("/short"), entry("t1", Duration::from_secs(10)));
        cache.insert(key("/long"), entry("t2", Duration::from_secs(100)));
        let mut failing = entry("t3", Duration::from_secs(10));
        failing.backoff_time = Some(Instant::now() + Duration::from_secs(30));
        cache.insert(key("/backoff"), failing);

        tokio::time::advance(Duration::from_secs(20)).await;
        let purged = cache.purge_expired(Instant::now());
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].0, key("/short"));
        assert_eq!(cache.targets(), HashSet::from(["t2", "t3"]));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.purge_expired(Instant::now()).len(), 1);
        assert_eq!(cache.len(), 1);
    }
}
