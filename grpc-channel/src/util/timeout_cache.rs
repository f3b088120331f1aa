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

//! A map whose entries remove themselves after a fixed timeout.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::rt::{BoxedTaskHandle, Runtime};

type ExpiryCallback = Box<dyn FnOnce() + Send>;

struct CacheEntry<V> {
    item: V,
    on_expiry: ExpiryCallback,
    timer: BoxedTaskHandle,
    // Set under the cache lock when the entry is removed by hand.  A timer that
    // fires concurrently observes it and does nothing.
    abort_deleting: Arc<AtomicBool>,
}

/// A cache where every entry expires `timeout` after insertion.
///
/// When an entry expires it is removed and its callback is invoked.  Entries
/// removed explicitly through [`TimeoutCache::remove`] or
/// [`TimeoutCache::clear`] never run their callback.
pub struct TimeoutCache<K, V> {
    entries: Arc<Mutex<HashMap<K, CacheEntry<V>>>>,
    timeout: Duration,
    runtime: Arc<dyn Runtime>,
}

impl<K, V> TimeoutCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(timeout: Duration, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            entries: Default::default(),
            timeout,
            runtime,
        }
    }

    /// Adds `item` under `key` unless the key is already present.
    ///
    /// Returns whether the item was inserted, along with the item now stored
    /// for the key.  When the key was present the cache is left unchanged and
    /// the existing item is returned.
    pub fn insert(
        &self,
        key: K,
        item: V,
        on_expiry: impl FnOnce() + Send + 'static,
    ) -> (bool, V) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return (false, existing.item.clone());
        }
        let abort_deleting = Arc::new(AtomicBool::new(false));
        let timer = self.spawn_timer(key.clone(), abort_deleting.clone());
        entries.insert(
            key,
            CacheEntry {
                item: item.clone(),
                on_expiry: Box::new(on_expiry),
                timer,
                abort_deleting,
            },
        );
        (true, item)
    }

    /// Removes the entry for `key` without running its expiry callback.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(key)?;
        entry.abort_deleting.store(true, Ordering::Release);
        entry.timer.abort();
        Some(entry.item)
    }

    /// Removes every entry without running any expiry callbacks.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.abort_deleting.store(true, Ordering::Release);
            entry.timer.abort();
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_timer(&self, key: K, abort_deleting: Arc<AtomicBool>) -> BoxedTaskHandle {
        let entries: Weak<Mutex<HashMap<K, CacheEntry<V>>>> = Arc::downgrade(&self.entries);
        let sleep = self.runtime.sleep(self.timeout);
        self.runtime.spawn(Box::pin(async move {
            sleep.await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let expired = {
                let mut entries = entries.lock();
                if abort_deleting.load(Ordering::Acquire) {
                    return;
                }
                entries.remove(&key)
            };
            if let Some(entry) = expired {
                (entry.on_expiry)();
            }
        }))
    }
}

impl<K, V> Drop for TimeoutCache<K, V> {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.abort_deleting.store(true, Ordering::Release);
            entry.timer.abort();
        }
    }
}

impl<K, V> Debug for TimeoutCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutCache")
            .field("timeout", &self.timeout)
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::rt::default_runtime;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn new_cache() -> TimeoutCache<&'static str, u32> {
        TimeoutCache::new(TIMEOUT, default_runtime())
    }

    #[tokio::test(start_paused = true)]
    async fn insert_existing_key_returns_stored_item() {
        let cache = new_cache();
        assert_eq!(cache.insert("a", 1, || {}), (true, 1));
        assert_eq!(cache.insert("a", 2, || {}), (false, 1));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_and_runs_callback() {
        let cache = new_cache();
        let (tx, mut rx) = mpsc::unbounded_channel();
        cache.insert("a", 1, move || {
            tx.send("a").unwrap();
        });

        tokio::time::sleep(TIMEOUT / 2).await;
        assert!(cache.contains_key(&"a"));

        assert_eq!(rx.recv().await, Some("a"));
        assert!(!cache.contains_key(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_callback() {
        let cache = new_cache();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        cache.insert("a", 7, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(cache.remove(&"a"), Some(7));
        assert_eq!(cache.remove(&"a"), None);

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reinserted_key_is_not_removed_by_stale_timer() {
        let cache = new_cache();
        cache.insert("a", 1, || {});
        tokio::time::sleep(TIMEOUT / 2).await;
        cache.remove(&"a");
        cache.insert("a", 2, || {});

        // The first timer would have fired here.
        tokio::time::sleep(TIMEOUT / 2 + Duration::from_secs(1)).await;
        assert!(cache.contains_key(&"a"));

        tokio::time::sleep(TIMEOUT).await;
        assert!(!cache.contains_key(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_everything_without_callbacks() {
        let cache = new_cache();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            let fired = fired.clone();
            cache.insert(key, 0, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        cache.clear();
        assert!(cache.is_empty());

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
