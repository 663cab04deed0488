//! LRU cache of file head bytes.

use std::sync::Mutex;

use bytes::Bytes;

use cbs_tools::lru_cache::LruCache;

/// Bounded cache mapping filename to the first bytes of the file.
///
/// Downloads starting at offset zero consult this cache before touching the
/// disk; a hit hands out a cheap [Bytes] clone of the stored prefix. All
/// operations take the single internal mutex and run in O(1).
pub struct PrefixCache {
    inner: Mutex<LruCache<String, Bytes>>,
    max_entry_size: usize,
}

impl PrefixCache {
    /// Create a cache holding up to `capacity` entries of at most
    /// `max_entry_size` bytes each.
    pub fn new(capacity: usize, max_entry_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            max_entry_size,
        }
    }

    /// Fetch the cached prefix for `name` and mark it most recently used.
    pub fn get(&self, name: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_mut(&name.to_string()).map(|data| data.clone())
    }

    /// Store the head bytes of `name`, truncated to the configured entry
    /// size. A key that is already cached is only promoted; the stored bytes
    /// stay untouched since the file content behind a committed name never
    /// changes.
    pub fn put(&self, name: &str, data: &[u8]) {
        let len = data.len().min(self.max_entry_size);
        let mut inner = self.inner.lock().unwrap();
        if inner.get_mut(&name.to_string()).is_some() {
            return;
        }
        inner.insert(name.to_string(), Bytes::copy_from_slice(&data[..len]));
    }

    /// Drop the entry for `name`, if cached.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(&name.to_string());
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_truncation_and_promotion() {
        let cache = PrefixCache::new(8, 4);

        cache.put("a", b"0123456789");
        assert_eq!(cache.get("a").unwrap(), Bytes::from_static(b"0123"));

        // put of a present key promotes but keeps the stored bytes
        cache.put("a", b"xxxx");
        assert_eq!(cache.get("a").unwrap(), Bytes::from_static(b"0123"));
    }

    #[test]
    fn test_capacity_bound() {
        let cache = PrefixCache::new(2, 16);

        cache.put("a", b"a");
        cache.put("b", b"b");
        cache.put("c", b"c");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());

        cache.remove("b");
        cache.remove("c");
        assert!(cache.is_empty());
        assert!(cache.get("c").is_none());
    }
}
