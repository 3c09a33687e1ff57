//! Revision-bound page read transaction.
//!
//! Bound to one committed revision at construction; walks the indirect
//! trees, reconstructs record pages through the versioning policy and
//! caches both raw pages and reconstructed record pages. A handle is
//! single-threaded; concurrent readers each open their own.

use crate::cache::{PageCache, RecordPageCache, cache_capacity};
use crate::name::NameKind;
use crate::page::{NamePage, Page, RecordPage, RevisionRootPage, UberPage};
use crate::record::{self, Node, NodeKey};
use crate::reference::{LEAF_LEVEL, LogKey, PageReference, TreeKind};
use crate::resource::ResourceConfig;
use crate::store::Reader;
use crate::{Error, FANOUT, INDIRECT_LEVELS, LEVEL_EXPONENTS, MAX_LEAF_KEY, Result};
use std::sync::Arc;

pub struct PageReadTrx {
    reader: Box<dyn Reader>,
    uber: Arc<UberPage>,
    root: RevisionRootPage,
    names: NamePage,
    config: ResourceConfig,
    page_cache: PageCache,
    record_cache: RecordPageCache,
    closed: bool,
}

impl PageReadTrx {
    /// Binds to `revision`, or to the latest committed revision when
    /// `None`. On a fresh (never committed) store the transaction binds
    /// to an empty revision 0 draft view.
    pub fn open(
        mut reader: Box<dyn Reader>,
        uber: Arc<UberPage>,
        revision: Option<u32>,
        config: ResourceConfig,
    ) -> Result<Self> {
        let capacity = cache_capacity(config.cache_pages);
        let (root, names) = bind(reader.as_mut(), &uber, revision)?;
        Ok(Self {
            reader,
            uber,
            root,
            names,
            config,
            page_cache: PageCache::new(capacity),
            record_cache: RecordPageCache::new(capacity),
            closed: false,
        })
    }

    pub fn assert_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::TransactionClosed)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn revision(&self) -> u32 {
        self.root.revision
    }

    pub fn revision_root(&self) -> &RevisionRootPage {
        &self.root
    }

    pub fn uber(&self) -> &Arc<UberPage> {
        &self.uber
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn names(&self) -> &NamePage {
        &self.names
    }

    pub fn name(&self, name_key: i32, kind: NameKind) -> Option<&str> {
        self.names.name(name_key, kind)
    }

    pub fn raw_name(&self, name_key: i32, kind: NameKind) -> Option<&[u8]> {
        self.names.name(name_key, kind).map(str::as_bytes)
    }

    /// Record lookup; tombstones and transient (negative) keys read as
    /// absent.
    pub fn record(&mut self, key: NodeKey, tree: TreeKind) -> Result<Option<Node>> {
        self.assert_open()?;
        if key < 0 {
            return Ok(None);
        }
        let page = match self.record_page(tree, record::page_key(key))? {
            Some(p) => p,
            None => return Ok(None),
        };
        Ok(page
            .get(record::page_offset(key))
            .filter(|n| !n.is_deleted())
            .cloned())
    }

    /// Reconstructed full record page.
    pub fn record_page(&mut self, tree: TreeKind, page_key: u64) -> Result<Option<Arc<RecordPage>>> {
        self.assert_open()?;
        if let Some(page) = self.record_cache.get(tree, page_key) {
            return Ok(Some(page));
        }
        let fragments = self.fragments(tree, page_key)?;
        if fragments.is_empty() {
            return Ok(None);
        }
        let refs: Vec<(u64, &RecordPage)> = fragments
            .iter()
            .map(|(k, p)| p.as_record().map(|rp| (*k, rp)))
            .collect::<Result<_>>()?;
        let combined = self
            .config
            .versioning
            .combine(&refs, self.config.revs_to_restore)?;
        let combined = Arc::new(combined);
        self.record_cache.put(tree, page_key, combined.clone());
        Ok(Some(combined))
    }

    /// The persisted fragment chain of a record page, newest first,
    /// bounded by the policy's fragment budget.
    pub fn fragments(&mut self, tree: TreeKind, page_key: u64) -> Result<Vec<(u64, Arc<Page>)>> {
        let budget = self
            .config
            .versioning
            .fragment_budget(self.config.revs_to_restore);
        let mut out = Vec::with_capacity(budget);
        let mut next = self.leaf_storage_key(tree, page_key)?;
        while let Some(key) = next {
            if out.len() == budget {
                break;
            }
            let page = self.read_page(key)?;
            let record = page.as_record()?;
            next = if record.full { None } else { record.previous };
            out.push((key, page.clone()));
        }
        Ok(out)
    }

    /// Leaf reference of the indirect walk, annotated with its log key.
    pub fn leaf_reference_for(
        &mut self,
        tree: TreeKind,
        leaf_key: u64,
    ) -> Result<Option<PageReference>> {
        Ok(self.leaf_storage_key(tree, leaf_key)?.map(|key| {
            let mut reference = PageReference::from_storage_key(key);
            reference.set_log_key(LogKey {
                tree,
                level: LEAF_LEVEL,
                offset: leaf_key,
            });
            reference
        }))
    }

    fn leaf_storage_key(&mut self, tree: TreeKind, leaf_key: u64) -> Result<Option<u64>> {
        self.assert_open()?;
        if leaf_key > MAX_LEAF_KEY {
            return Err(Error::NodeKeyTooLarge {
                key: leaf_key,
                max: MAX_LEAF_KEY,
            });
        }
        let mut key = match self.root.tree_ref(tree).storage_key() {
            Some(k) => k,
            None => return Ok(None),
        };
        let mut remaining = leaf_key;
        for exp in LEVEL_EXPONENTS {
            let page = self.read_page(key)?;
            let indirect = page.as_indirect()?;
            let offset = (remaining >> exp) as usize;
            if offset >= FANOUT {
                return Err(Error::NodeKeyTooLarge {
                    key: leaf_key,
                    max: MAX_LEAF_KEY,
                });
            }
            remaining -= (offset as u64) << exp;
            key = match indirect.refs[offset].storage_key() {
                Some(k) => k,
                None => return Ok(None),
            };
        }
        Ok(Some(key))
    }

    pub fn read_page(&mut self, storage_key: u64) -> Result<Arc<Page>> {
        if let Some(page) = self.page_cache.get(storage_key) {
            return Ok(page);
        }
        let page = Arc::new(self.reader.read(storage_key)?);
        self.page_cache.put(storage_key, page.clone());
        Ok(page)
    }

    /// Rebinds to a different revision of the same store, invalidating
    /// the caches. Used by the write transaction after commit and
    /// revert.
    pub(crate) fn rebind(&mut self, uber: Arc<UberPage>, revision: Option<u32>) -> Result<()> {
        let (root, names) = bind(self.reader.as_mut(), &uber, revision)?;
        self.uber = uber;
        self.root = root;
        self.names = names;
        self.page_cache.clear();
        self.record_cache.clear();
        Ok(())
    }

    /// Idempotent; later operations fail with `TransactionClosed`.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.page_cache.clear();
            self.record_cache.clear();
            if let Err(e) = self.reader.close() {
                log::warn!("closing storage reader failed: {e}");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn bind(
    reader: &mut dyn Reader,
    uber: &UberPage,
    revision: Option<u32>,
) -> Result<(RevisionRootPage, NamePage)> {
    let latest = match uber.latest_revision() {
        Some(r) => r,
        None => {
            // Fresh store: nothing committed yet, revision 0 is a draft.
            if let Some(r) = revision {
                return Err(Error::RevisionNotFound(r));
            }
            return Ok((RevisionRootPage::new_empty(0), NamePage::default()));
        }
    };
    let revision = revision.unwrap_or(latest);
    if revision > latest {
        return Err(Error::RevisionNotFound(revision));
    }
    let root = load_revision_root(reader, uber, revision)?;
    let names = match root.name_ref.storage_key() {
        Some(key) => reader.read(key)?.as_name()?.clone(),
        None => NamePage::default(),
    };
    Ok((root, names))
}

/// Walks the uber tree down to the revision root of `revision`.
pub fn load_revision_root(
    reader: &mut dyn Reader,
    uber: &UberPage,
    revision: u32,
) -> Result<RevisionRootPage> {
    let mut key = uber
        .tree_ref
        .storage_key()
        .ok_or(Error::RevisionNotFound(revision))?;
    let mut remaining = u64::from(revision);
    for exp in LEVEL_EXPONENTS {
        let page = reader.read(key)?;
        let indirect = page.as_indirect()?;
        let offset = (remaining >> exp) as usize;
        if offset >= FANOUT {
            return Err(Error::RevisionNotFound(revision));
        }
        remaining -= (offset as u64) << exp;
        key = match indirect.refs[offset].storage_key() {
            Some(k) => k,
            None => return Err(Error::RevisionNotFound(revision)),
        };
    }
    Ok(reader.read(key)?.as_revision_root()?.clone())
}

const _: () = assert!(INDIRECT_LEVELS == LEVEL_EXPONENTS.len());
