//! Bounded page caches, one set per transaction.

use crate::page::{Page, RecordPage};
use crate::reference::TreeKind;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache capacity in pages: the resource configuration, overridable with
/// `ALDERDB_CACHE_PAGES`.
pub fn cache_capacity(configured: usize) -> NonZeroUsize {
    let pages = std::env::var("ALDERDB_CACHE_PAGES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(configured);
    NonZeroUsize::new(pages.max(1)).expect("capacity is at least one")
}

/// Deserialized pages keyed by storage key.
pub struct PageCache {
    inner: LruCache<u64, Arc<Page>>,
}

impl PageCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<Page>> {
        self.inner.get(&key).cloned()
    }

    pub fn put(&mut self, key: u64, page: Arc<Page>) {
        self.inner.put(key, page);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Reconstructed full record pages keyed by `(tree, page_key)`.
pub struct RecordPageCache {
    inner: LruCache<(TreeKind, u64), Arc<RecordPage>>,
}

impl RecordPageCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, tree: TreeKind, page_key: u64) -> Option<Arc<RecordPage>> {
        self.inner.get(&(tree, page_key)).cloned()
    }

    pub fn put(&mut self, tree: TreeKind, page_key: u64, page: Arc<RecordPage>) {
        self.inner.put((tree, page_key), page);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
