//! QueryCache - bounded LRU of `find_all` results.
//!
//! Keys are (collection, canonical filter, canonical options). Every write
//! to a collection drops all of that collection's entries.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::collection::Collection;
use crate::document::Document;
use crate::query::{Filter, FindOptions};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    collection: Collection,
    filter: String,
    options: String,
}

impl CacheKey {
    pub(crate) fn new(collection: Collection, filter: &Filter, options: &FindOptions) -> Self {
        Self {
            collection,
            filter: filter.cache_key(),
            options: options.cache_key(),
        }
    }
}

/// `None` capacity disables caching.
#[derive(Debug)]
pub(crate) struct QueryCache {
    entries: Option<LruCache<CacheKey, Vec<Document>>>,
}

impl QueryCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub(crate) fn get(&mut self, key: &CacheKey) -> Option<Vec<Document>> {
        self.entries.as_mut()?.get(key).cloned()
    }

    pub(crate) fn put(&mut self, key: CacheKey, docs: Vec<Document>) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(key, docs);
        }
    }

    pub(crate) fn invalidate_collection(&mut self, collection: Collection) -> usize {
        let Some(entries) = self.entries.as_mut() else {
            return 0;
        };
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub(crate) fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(collection: Collection, status: &str) -> CacheKey {
        CacheKey::new(
            collection,
            &Filter::new().eq("status", status),
            &FindOptions::default(),
        )
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = QueryCache::new(2);
        cache.put(key(Collection::Events, "a"), vec![]);
        cache.put(key(Collection::Events, "b"), vec![]);
        assert!(cache.get(&key(Collection::Events, "a")).is_some());
        cache.put(key(Collection::Events, "c"), vec![]);

        // "b" was least recently used
        assert!(cache.get(&key(Collection::Events, "b")).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_only_touched_collection() {
        let mut cache = QueryCache::new(10);
        cache.put(key(Collection::Events, "a"), vec![]);
        cache.put(key(Collection::Events, "b"), vec![]);
        cache.put(key(Collection::Talks, "a"), vec![]);

        assert_eq!(cache.invalidate_collection(Collection::Events), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(Collection::Talks, "a")).is_some());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut cache = QueryCache::new(0);
        cache.put(key(Collection::Events, "a"), vec![]);
        assert!(cache.get(&key(Collection::Events, "a")).is_none());
        assert_eq!(cache.len(), 0);
    }
}
