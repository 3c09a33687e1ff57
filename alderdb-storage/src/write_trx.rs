//! Single-writer page transaction.
//!
//! All mutation goes through an in-memory page log: the first touch of a
//! record page reconstructs its complete view into a container and clones
//! every indirect page on the path from the revision root down to the
//! leaf. Commit walks the log bottom-up, appends dirty pages through the
//! `Writer`, wires the returned storage keys into the cloned parents and
//! finally installs a new uber page. The store never mutates committed
//! pages in place.

use crate::name::NameKind;
use crate::page::{IndirectPage, NamePage, Page, RecordPage, RevisionRootPage, UberPage};
use crate::record::{self, Node, NodeKey};
use crate::reference::{LEAF_LEVEL, LogKey, PageReference, TREE_KINDS, TreeKind};
use crate::read_trx::PageReadTrx;
use crate::resource::ResourceConfig;
use crate::store::{Reader, Writer};
use crate::{
    Error, FANOUT, FANOUT_EXP, INDIRECT_LEVELS, LEVEL_EXPONENTS, MAX_LEAF_KEY, Result,
};
use crate::versioning::RecordPageContainer;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

pub struct PageWriteTrx {
    rtx: PageReadTrx,
    writer: Box<dyn Writer>,
    /// Cloned indirect pages, keyed by their position in the trees.
    log: HashMap<LogKey, IndirectPage>,
    /// Touched record pages: complete view plus commit delta state.
    record_log: HashMap<(TreeKind, u64), RecordPageContainer>,
    draft: RevisionRootPage,
    names: NamePage,
    names_dirty: bool,
}

impl PageWriteTrx {
    /// Opens a write transaction on the latest committed revision (or on
    /// an empty revision 0 draft for a fresh store).
    pub fn open(
        reader: Box<dyn Reader>,
        writer: Box<dyn Writer>,
        uber: Arc<UberPage>,
        config: ResourceConfig,
    ) -> Result<Self> {
        let rtx = PageReadTrx::open(reader, uber, None, config)?;
        let draft = new_draft(rtx.uber(), rtx.revision_root());
        let names = rtx.names().clone();
        Ok(Self {
            rtx,
            writer,
            log: HashMap::new(),
            record_log: HashMap::new(),
            draft,
            names,
            names_dirty: false,
        })
    }

    /// Revision this transaction will produce.
    #[inline]
    pub fn revision(&self) -> u32 {
        self.draft.revision
    }

    /// Revision the transaction branched from, if any.
    pub fn base_revision(&self) -> Option<u32> {
        self.rtx.uber().latest_revision()
    }

    pub fn config(&self) -> &ResourceConfig {
        self.rtx.config()
    }

    pub fn uber(&self) -> &Arc<UberPage> {
        self.rtx.uber()
    }

    pub fn max_key(&self, tree: TreeKind) -> NodeKey {
        self.draft.max_key(tree)
    }

    pub fn has_changes(&self) -> bool {
        self.names_dirty || self.record_log.values().any(RecordPageContainer::is_dirty)
    }

    pub fn assert_open(&self) -> Result<()> {
        self.rtx.assert_open()
    }

    // --- record access ------------------------------------------------

    /// Transaction-local view: uncommitted changes shadow the base
    /// revision.
    pub fn record(&mut self, key: NodeKey, tree: TreeKind) -> Result<Option<Node>> {
        self.rtx.assert_open()?;
        if key < 0 {
            return Ok(None);
        }
        let page_key = record::page_key(key);
        if let Some(container) = self.record_log.get(&(tree, page_key)) {
            return Ok(container
                .get(record::page_offset(key))
                .filter(|n| !n.is_deleted())
                .cloned());
        }
        self.rtx.record(key, tree)
    }

    /// Copy-on-write preparation: pulls the record's page into the log
    /// and returns a clone to modify; write it back with [`put`].
    ///
    /// [`put`]: Self::put
    pub fn prepare(&mut self, key: NodeKey, tree: TreeKind) -> Result<Node> {
        if key < 0 {
            return Err(Error::RecordNotFound(key));
        }
        self.ensure_container(tree, record::page_key(key))?;
        let container = &self.record_log[&(tree, record::page_key(key))];
        match container.get(record::page_offset(key)) {
            Some(node) if !node.is_deleted() => Ok(node.clone()),
            _ => Err(Error::RecordNotFound(key)),
        }
    }

    /// Stores a record in the page log.
    pub fn put(&mut self, node: Node, tree: TreeKind) -> Result<()> {
        let key = node.key();
        debug_assert!(key >= 0);
        let page_key = record::page_key(key);
        self.ensure_container(tree, page_key)?;
        let container = self.record_log.get_mut(&(tree, page_key)).expect("ensured");
        container.put(record::page_offset(key), node);
        if key > self.draft.max_key(tree) {
            self.draft.set_max_key(tree, key);
        }
        Ok(())
    }

    /// Allocates the next record key of `tree`.
    pub fn allocate_key(&mut self, tree: TreeKind) -> NodeKey {
        let next = self.draft.max_key(tree) + 1;
        self.draft.set_max_key(tree, next);
        next
    }

    /// Inserts a freshly created record.
    pub fn create_entry(&mut self, node: Node, tree: TreeKind) -> Result<()> {
        self.put(node, tree)
    }

    /// Replaces the record with a tombstone keeping key and parent.
    pub fn remove_entry(&mut self, key: NodeKey, tree: TreeKind) -> Result<()> {
        if key < 0 {
            return Err(Error::RecordNotFound(key));
        }
        let page_key = record::page_key(key);
        self.ensure_container(tree, page_key)?;
        let container = self.record_log.get_mut(&(tree, page_key)).expect("ensured");
        let offset = record::page_offset(key);
        match container.get(offset) {
            Some(node) if !node.is_deleted() => {
                let stone = node.tombstone();
                container.put(offset, stone);
                Ok(())
            }
            _ => Err(Error::RecordNotFound(key)),
        }
    }

    fn ensure_container(&mut self, tree: TreeKind, page_key: u64) -> Result<()> {
        self.rtx.assert_open()?;
        if page_key > MAX_LEAF_KEY {
            return Err(Error::NodeKeyTooLarge {
                key: page_key,
                max: MAX_LEAF_KEY,
            });
        }
        if self.record_log.contains_key(&(tree, page_key)) {
            return Ok(());
        }
        let config = self.rtx.config().clone();
        let fragments = self.rtx.fragments(tree, page_key)?;
        let container = if fragments.is_empty() {
            RecordPageContainer::new_empty(tree, page_key, self.draft.revision)
        } else {
            let refs: Vec<(u64, &RecordPage)> = fragments
                .iter()
                .map(|(k, p)| p.as_record().map(|rp| (*k, rp)))
                .collect::<Result<_>>()?;
            RecordPageContainer::from_fragments(
                config.versioning,
                &refs,
                self.draft.revision,
                config.revs_to_restore,
            )?
        };
        self.record_log.insert((tree, page_key), container);
        self.clone_indirect_path(tree, page_key)
    }

    /// Clones every indirect page from the tree root down to the leaf's
    /// parent into the log, annotating traversed references with their
    /// log keys.
    fn clone_indirect_path(&mut self, tree: TreeKind, page_key: u64) -> Result<()> {
        let mut current = self.rtx.revision_root().tree_ref(tree).storage_key();
        let mut remaining = page_key;
        for (level, exp) in LEVEL_EXPONENTS.iter().enumerate() {
            let log_key = log_key_for(tree, level as u8, page_key);
            if !self.log.contains_key(&log_key) {
                let page = match current {
                    Some(k) => self.rtx.read_page(k)?.as_indirect()?.clone(),
                    None => IndirectPage::new_empty(),
                };
                self.log.insert(log_key, page);
            }
            let offset = (remaining >> exp) as usize;
            debug_assert!(offset < FANOUT);
            remaining -= (offset as u64) << exp;
            let logged = self.log.get_mut(&log_key).expect("just inserted");
            let child = &mut logged.refs[offset];
            child.set_log_key(log_key_for(tree, level as u8 + 1, page_key));
            current = child.storage_key();
        }
        Ok(())
    }

    // --- names --------------------------------------------------------

    pub fn create_name_key(&mut self, name: &str, kind: NameKind) -> i32 {
        self.names_dirty = true;
        self.names.create_name_key(name, kind)
    }

    pub fn remove_name(&mut self, key: i32, kind: NameKind) {
        self.names_dirty = true;
        self.names.remove_name(key, kind);
    }

    pub fn name(&self, key: i32, kind: NameKind) -> Option<&str> {
        self.names.name(key, kind)
    }

    pub fn name_key_for(&self, name: &str, kind: NameKind) -> Option<i32> {
        self.names.key_for(name, kind)
    }

    pub fn name_count(&self, key: i32, kind: NameKind) -> u32 {
        self.names.count(key, kind)
    }

    // --- commit protocol ----------------------------------------------

    /// Commits the draft revision and rebinds the transaction to the new
    /// head so it can keep writing.
    pub fn commit(&mut self) -> Result<Arc<UberPage>> {
        self.rtx.assert_open()?;
        let revision = self.draft.revision;
        log::debug!("committing revision {revision}");
        self.writer.begin_commit(revision)?;
        let uber = self.commit_inner(revision)?;
        self.writer.finish_commit(revision)?;

        self.log.clear();
        self.record_log.clear();
        self.rtx.rebind(uber.clone(), None)?;
        self.draft = new_draft(&uber, self.rtx.revision_root());
        self.names = self.rtx.names().clone();
        self.names_dirty = false;
        Ok(uber)
    }

    fn commit_inner(&mut self, revision: u32) -> Result<Arc<UberPage>> {
        let config = self.rtx.config().clone();
        self.draft.timestamp_ms = Utc::now().timestamp_millis();

        // Record page deltas, wired into their cloned parents.
        for tree in TREE_KINDS {
            let mut page_keys: Vec<u64> = self
                .record_log
                .iter()
                .filter(|((t, _), c)| *t == tree && c.is_dirty())
                .map(|((_, pk), _)| *pk)
                .collect();
            page_keys.sort_unstable();
            for page_key in page_keys {
                let container = &self.record_log[&(tree, page_key)];
                let modified = container.modified_page(config.versioning, config.revs_to_restore);
                let key = self.writer.write(&Page::Record(modified))?;

                let parent_key = log_key_for(tree, INDIRECT_LEVELS as u8 - 1, page_key);
                let slot = (page_key & (FANOUT as u64 - 1)) as usize;
                let parent = self
                    .log
                    .get_mut(&parent_key)
                    .ok_or(Error::Corrupted("record page without cloned parent"))?;
                parent.refs[slot] = PageReference::from_storage_key(key);
            }
        }

        // Indirect pages bottom-up; the root of each tree lands in the
        // draft revision root.
        for level in (0..INDIRECT_LEVELS).rev() {
            let mut keys: Vec<LogKey> = self
                .log
                .keys()
                .filter(|k| usize::from(k.level) == level)
                .copied()
                .collect();
            keys.sort_unstable_by_key(|k| (k.tree.tag(), k.offset));
            for log_key in keys {
                let page = self.log[&log_key].clone();
                let key = self.writer.write(&Page::Indirect(page))?;
                if level == 0 {
                    *self.draft.tree_ref_mut(log_key.tree) = PageReference::from_storage_key(key);
                } else {
                    let parent_key = LogKey {
                        tree: log_key.tree,
                        level: log_key.level - 1,
                        offset: if level == 1 {
                            0
                        } else {
                            log_key.offset >> FANOUT_EXP
                        },
                    };
                    let slot = (log_key.offset & (FANOUT as u64 - 1)) as usize;
                    let parent = self
                        .log
                        .get_mut(&parent_key)
                        .ok_or(Error::Corrupted("indirect page without cloned parent"))?;
                    parent.refs[slot] = PageReference::from_storage_key(key);
                }
            }
        }

        if self.names_dirty {
            let key = self.writer.write(&Page::Name(self.names.clone()))?;
            self.draft.name_ref = PageReference::from_storage_key(key);
        }

        let root_key = self.writer.write(&Page::RevisionRoot(self.draft.clone()))?;
        let tree_key = self.extend_uber_tree(revision, root_key)?;

        let uber = UberPage {
            revision_count: revision + 1,
            bootstrap: false,
            tree_ref: PageReference::from_storage_key(tree_key),
        };
        let uber_key = self.writer.write(&Page::Uber(uber.clone()))?;
        self.writer
            .write_uber_page_ref(&PageReference::from_storage_key(uber_key))?;
        Ok(Arc::new(uber))
    }

    /// Clones the uber-tree path for the new revision leaf and writes it
    /// bottom-up.
    fn extend_uber_tree(&mut self, revision: u32, root_key: u64) -> Result<u64> {
        let leaf = u64::from(revision);
        let mut pages: Vec<IndirectPage> = Vec::with_capacity(INDIRECT_LEVELS);
        let mut offsets = [0usize; INDIRECT_LEVELS];
        let mut current = self.rtx.uber().tree_ref.storage_key();
        let mut remaining = leaf;
        for (level, exp) in LEVEL_EXPONENTS.iter().enumerate() {
            let page = match current {
                Some(k) => self.rtx.read_page(k)?.as_indirect()?.clone(),
                None => IndirectPage::new_empty(),
            };
            let offset = (remaining >> exp) as usize;
            debug_assert!(offset < FANOUT);
            remaining -= (offset as u64) << exp;
            offsets[level] = offset;
            current = page.refs[offset].storage_key();
            pages.push(page);
        }

        let mut child_key = root_key;
        for level in (0..INDIRECT_LEVELS).rev() {
            pages[level].refs[offsets[level]] = PageReference::from_storage_key(child_key);
            child_key = self.writer.write(&Page::Indirect(pages[level].clone()))?;
        }
        Ok(child_key)
    }

    /// Discards the page log and any partially flushed commit, rebinding
    /// to the last committed uber page.
    pub fn abort(&mut self) -> Result<()> {
        self.rtx.assert_open()?;
        let revision = self.draft.revision;
        self.writer.abort_commit(revision)?;
        self.log.clear();
        self.record_log.clear();
        let uber = self.rtx.uber().clone();
        self.rtx.rebind(uber, None)?;
        self.draft = new_draft(self.rtx.uber(), self.rtx.revision_root());
        self.names = self.rtx.names().clone();
        self.names_dirty = false;
        Ok(())
    }

    /// Rebinds the transaction so its next commit reproduces the state of
    /// `revision` as a new head revision. Pending changes are discarded.
    pub fn revert_to(&mut self, revision: u32) -> Result<()> {
        self.rtx.assert_open()?;
        let uber = self.rtx.uber().clone();
        let latest = uber
            .latest_revision()
            .ok_or(Error::RevisionNotFound(revision))?;
        if revision > latest {
            return Err(Error::RevisionNotFound(revision));
        }
        self.log.clear();
        self.record_log.clear();
        self.rtx.rebind(uber, Some(revision))?;
        let mut draft = self.rtx.revision_root().clone();
        draft.revision = latest + 1;
        self.draft = draft;
        self.names = self.rtx.names().clone();
        self.names_dirty = false;
        Ok(())
    }

    /// Fails with `PendingModifications` unless the transaction was
    /// committed or aborted first.
    pub fn close(&mut self) -> Result<()> {
        if self.rtx.is_closed() {
            return Ok(());
        }
        if self.has_changes() {
            return Err(Error::PendingModifications);
        }
        self.rtx.close();
        self.writer.close()?;
        Ok(())
    }

    /// Unconditional teardown used by `Drop` in the layers above.
    pub fn force_close(&mut self) {
        if !self.rtx.is_closed() {
            if self.has_changes() {
                if let Err(e) = self.abort() {
                    log::warn!("abort during forced close failed: {e}");
                }
            }
            self.rtx.close();
            if let Err(e) = self.writer.close() {
                log::warn!("closing storage writer failed: {e}");
            }
        }
    }
}

fn new_draft(uber: &UberPage, base: &RevisionRootPage) -> RevisionRootPage {
    match uber.latest_revision() {
        None => RevisionRootPage::new_empty(0),
        Some(latest) => {
            let mut draft = base.clone();
            draft.revision = latest + 1;
            draft
        }
    }
}

/// Log position of the page at `level` on the path to `page_key`.
fn log_key_for(tree: TreeKind, level: u8, page_key: u64) -> LogKey {
    if level == 0 {
        return LogKey {
            tree,
            level,
            offset: 0,
        };
    }
    if level >= LEAF_LEVEL {
        return LogKey {
            tree,
            level: LEAF_LEVEL,
            offset: page_key,
        };
    }
    LogKey {
        tree,
        level,
        offset: page_key >> LEVEL_EXPONENTS[usize::from(level) - 1],
    }
}
