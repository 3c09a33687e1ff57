//! Single-writer node transaction.
//!
//! Every public mutation follows the same protocol: take the internal
//! lock, fail if a background commit poisoned the transaction, count the
//! modification (running an intermediate commit past the configured
//! bound), perform the structural edit through the page log, then
//! maintain ancestor hashes, the path summary, change listeners and
//! optional order labels. The transaction state lives behind one mutex
//! shared with a single auto-commit timer thread.

use crate::cursor::{Cursor, Move};
use crate::event::{self, SubtreeEvent};
use crate::hash::{content_hash, rolling_step};
use crate::hooks::{ChangeListener, ChangeType, CommitView, PostCommitHook, PreCommitHook};
use crate::node_read_trx::NodeReadTrx;
use crate::path_summary;
use crate::resource::ResourceInner;
use crate::{Error, QName, Result};
use alderdb_storage::name::NameKind;
use alderdb_storage::record::{
    AttributeNode, CommentNode, ElementNode, NameNodeDelegate, Node, NodeDelegate, NodeKey,
    NodeKind, PiNode, StructNodeDelegate, TextNode, ValueNodeDelegate,
};
use alderdb_storage::dewey::DeweyId;
use alderdb_storage::reference::TreeKind;
use alderdb_storage::resource::HashKind;
use alderdb_storage::write_trx::PageWriteTrx;
use alderdb_storage::NULL_NODE_KEY;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

const DOC: TreeKind = TreeKind::Document;

/// Auto-commit configuration of one write transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Issue an intermediate commit after this many modifications
    /// (0 disables).
    pub max_node_count: u64,
    /// Issue a background commit on this cadence.
    pub max_time: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertPos {
    FirstChild,
    LeftSibling,
    RightSibling,
}

pub struct NodeWriteTrx {
    core: Arc<Mutex<WriteCore>>,
    resource: Arc<ResourceInner>,
    timer: Option<Timer>,
    closed: bool,
}

impl std::fmt::Debug for NodeWriteTrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWriteTrx")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

struct Timer {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct CommitSnapshot {
    revision: u32,
    max_node_key: NodeKey,
}

impl CommitView for CommitSnapshot {
    fn revision(&self) -> u32 {
        self.revision
    }

    fn max_node_key(&self) -> NodeKey {
        self.max_node_key
    }
}

pub(crate) struct WriteCore {
    cursor: Cursor<PageWriteTrx>,
    resource: Arc<ResourceInner>,
    modification_count: u64,
    max_node_count: u64,
    hashing: HashKind,
    use_dewey: bool,
    /// Bulk insertion defers hash maintenance to a postorder pass.
    bulk_mode: bool,
    pre_hooks: Vec<Box<dyn PreCommitHook>>,
    post_hooks: Vec<Box<dyn PostCommitHook>>,
    listeners: Vec<Box<dyn ChangeListener>>,
    auto_commit_failed: bool,
}

impl NodeWriteTrx {
    pub(crate) fn new(
        pages: PageWriteTrx,
        resource: Arc<ResourceInner>,
        options: WriteOptions,
    ) -> Result<Self> {
        let config = resource.config.clone();
        let core = WriteCore {
            cursor: Cursor::new(pages)?,
            resource: resource.clone(),
            modification_count: 0,
            max_node_count: options.max_node_count,
            hashing: config.hashing,
            use_dewey: config.use_dewey_ids,
            bulk_mode: false,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            listeners: Vec::new(),
            auto_commit_failed: false,
        };
        let core = Arc::new(Mutex::new(core));

        let timer = options.max_time.map(|interval| {
            let (stop, ticks) = mpsc::channel::<()>();
            let shared = Arc::clone(&core);
            let handle = std::thread::spawn(move || {
                loop {
                    match ticks.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let mut core = shared.lock().unwrap();
                            if core.auto_commit_failed {
                                break;
                            }
                            if core.cursor.pages.has_changes() {
                                if let Err(e) = core.commit() {
                                    log::error!("scheduled commit failed: {e}");
                                    core.auto_commit_failed = true;
                                    break;
                                }
                            }
                        }
                        _ => break,
                    }
                }
            });
            Timer { stop, handle }
        });

        Ok(Self {
            core,
            resource,
            timer,
            closed: false,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriteCore>> {
        if self.closed {
            return Err(Error::TransactionClosed);
        }
        let core = self.core.lock().unwrap();
        if core.auto_commit_failed {
            return Err(Error::AutoCommitFailed);
        }
        Ok(core)
    }

    fn lock_any(&self) -> Result<MutexGuard<'_, WriteCore>> {
        if self.closed {
            return Err(Error::TransactionClosed);
        }
        Ok(self.core.lock().unwrap())
    }

    // --- movement and accessors ---------------------------------------

    pub fn revision(&self) -> Result<u32> {
        Ok(self.lock()?.cursor.pages.revision())
    }

    pub fn move_to(&mut self, key: NodeKey) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.try_move(key)?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_document_root(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_document_root()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_parent(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_parent()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_first_child(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_first_child()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_last_child(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_last_child()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_left_sibling(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_left_sibling()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_right_sibling(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_right_sibling()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_next_following(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_next_following()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_attribute(&mut self, index: usize) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_attribute(index)?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_namespace(&mut self, index: usize) -> Result<Move<'_, Self>> {
        let moved = self.lock()?.cursor.move_to_namespace(index)?;
        Ok(self.outcome(moved))
    }

    fn outcome(&mut self, moved: bool) -> Move<'_, Self> {
        if moved {
            Move::Moved(self)
        } else {
            Move::NotMoved
        }
    }

    pub fn node_key(&self) -> Result<NodeKey> {
        Ok(self.lock()?.cursor.key())
    }

    pub fn kind(&self) -> Result<NodeKind> {
        Ok(self.lock()?.cursor.kind())
    }

    pub fn name(&self) -> Result<Option<QName>> {
        self.lock()?.cursor.qname()
    }

    pub fn value(&self) -> Result<String> {
        self.lock()?.cursor.value_string()
    }

    pub fn hash(&self) -> Result<u64> {
        self.lock()?.cursor.hash()
    }

    pub fn parent_key(&self) -> Result<NodeKey> {
        self.lock()?.cursor.parent_key()
    }

    pub fn child_count(&self) -> Result<u64> {
        self.lock()?.cursor.child_count()
    }

    pub fn descendant_count(&self) -> Result<u64> {
        self.lock()?.cursor.descendant_count()
    }

    pub fn attribute_count(&self) -> Result<usize> {
        self.lock()?.cursor.attribute_count()
    }

    pub fn namespace_count(&self) -> Result<usize> {
        self.lock()?.cursor.namespace_count()
    }

    pub fn path_node_key(&self) -> Result<NodeKey> {
        let core = self.lock()?;
        Ok(core
            .cursor
            .current()
            .name_delegate()
            .map(|n| n.path_node_key)
            .unwrap_or(NULL_NODE_KEY))
    }

    pub fn max_node_key(&self) -> Result<NodeKey> {
        Ok(self.lock()?.cursor.pages.max_key(DOC))
    }

    pub fn modification_count(&self) -> Result<u64> {
        Ok(self.lock()?.modification_count)
    }

    /// Record of the path-summary tree, for inspection.
    pub fn path_record(&self, key: NodeKey) -> Result<Option<Node>> {
        let mut core = self.lock()?;
        core.cursor
            .pages
            .record(key, TreeKind::PathSummary)
            .map_err(Error::from_storage)
    }

    pub fn name_count(&self, name: &str, kind: NameKind) -> Result<u32> {
        let core = self.lock()?;
        Ok(match core.cursor.pages.name_key_for(name, kind) {
            Some(key) => core.cursor.pages.name_count(key, kind),
            None => 0,
        })
    }

    // --- hooks and listeners ------------------------------------------

    pub fn add_pre_commit_hook(&mut self, hook: Box<dyn PreCommitHook>) -> Result<()> {
        self.lock()?.pre_hooks.push(hook);
        Ok(())
    }

    pub fn add_post_commit_hook(&mut self, hook: Box<dyn PostCommitHook>) -> Result<()> {
        self.lock()?.post_hooks.push(hook);
        Ok(())
    }

    pub fn add_change_listener(&mut self, listener: Box<dyn ChangeListener>) -> Result<()> {
        self.lock()?.listeners.push(listener);
        Ok(())
    }

    // --- inserts ------------------------------------------------------

    pub fn insert_element_as_first_child(&mut self, name: &QName) -> Result<&mut Self> {
        self.mutate(|core| core.insert_element(name, InsertPos::FirstChild).map(|_| ()))
    }

    pub fn insert_element_as_left_sibling(&mut self, name: &QName) -> Result<&mut Self> {
        self.mutate(|core| core.insert_element(name, InsertPos::LeftSibling).map(|_| ()))
    }

    pub fn insert_element_as_right_sibling(&mut self, name: &QName) -> Result<&mut Self> {
        self.mutate(|core| core.insert_element(name, InsertPos::RightSibling).map(|_| ()))
    }

    pub fn insert_text_as_first_child(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_text(value, InsertPos::FirstChild).map(|_| ()))
    }

    pub fn insert_text_as_left_sibling(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_text(value, InsertPos::LeftSibling).map(|_| ()))
    }

    pub fn insert_text_as_right_sibling(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_text(value, InsertPos::RightSibling).map(|_| ()))
    }

    pub fn insert_comment_as_first_child(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_comment(value, InsertPos::FirstChild).map(|_| ()))
    }

    pub fn insert_comment_as_left_sibling(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_comment(value, InsertPos::LeftSibling).map(|_| ()))
    }

    pub fn insert_comment_as_right_sibling(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_comment(value, InsertPos::RightSibling).map(|_| ()))
    }

    pub fn insert_pi_as_first_child(&mut self, target: &str, data: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_pi(target, data, InsertPos::FirstChild).map(|_| ()))
    }

    pub fn insert_pi_as_left_sibling(&mut self, target: &str, data: &str) -> Result<&mut Self> {
        self.mutate(|core| core.insert_pi(target, data, InsertPos::LeftSibling).map(|_| ()))
    }

    pub fn insert_pi_as_right_sibling(&mut self, target: &str, data: &str) -> Result<&mut Self> {
        self.mutate(|core| {
            core.insert_pi(target, data, InsertPos::RightSibling).map(|_| ())
        })
    }

    /// Inserts or updates an attribute on the selected element. A
    /// matching name with a different value updates in place; a matching
    /// name and value fails with `DuplicateAttribute`.
    /// `move_back_to_origin` keeps the cursor on the element.
    pub fn insert_attribute(
        &mut self,
        name: &QName,
        value: &str,
        move_back_to_origin: bool,
    ) -> Result<&mut Self> {
        self.mutate(|core| core.insert_attribute(name, value, move_back_to_origin))
    }

    /// Declares a namespace on the selected element; a duplicate prefix
    /// fails with `DuplicateNamespace`.
    pub fn insert_namespace(&mut self, name: &QName, move_back_to_origin: bool) -> Result<&mut Self> {
        self.mutate(|core| core.insert_namespace(name, move_back_to_origin))
    }

    pub fn insert_subtree_as_first_child<I>(&mut self, events: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = SubtreeEvent>,
    {
        let events: Vec<SubtreeEvent> = events.into_iter().collect();
        self.mutate(|core| core.insert_subtree(&events, InsertPos::FirstChild).map(|_| ()))
    }

    pub fn insert_subtree_as_left_sibling<I>(&mut self, events: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = SubtreeEvent>,
    {
        let events: Vec<SubtreeEvent> = events.into_iter().collect();
        self.mutate(|core| core.insert_subtree(&events, InsertPos::LeftSibling).map(|_| ()))
    }

    pub fn insert_subtree_as_right_sibling<I>(&mut self, events: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = SubtreeEvent>,
    {
        let events: Vec<SubtreeEvent> = events.into_iter().collect();
        self.mutate(|core| core.insert_subtree(&events, InsertPos::RightSibling).map(|_| ()))
    }

    /// Deep copy of the subtree selected in `src`, which may be bound to
    /// any revision.
    pub fn copy_subtree_as_first_child(&mut self, src: &mut NodeReadTrx) -> Result<&mut Self> {
        let events = src.subtree_events()?;
        self.mutate(|core| core.insert_subtree(&events, InsertPos::FirstChild).map(|_| ()))
    }

    pub fn copy_subtree_as_left_sibling(&mut self, src: &mut NodeReadTrx) -> Result<&mut Self> {
        let events = src.subtree_events()?;
        self.mutate(|core| core.insert_subtree(&events, InsertPos::LeftSibling).map(|_| ()))
    }

    pub fn copy_subtree_as_right_sibling(&mut self, src: &mut NodeReadTrx) -> Result<&mut Self> {
        let events = src.subtree_events()?;
        self.mutate(|core| core.insert_subtree(&events, InsertPos::RightSibling).map(|_| ()))
    }

    /// Replaces the selected node with a subtree copied from `src`.
    pub fn replace_node_with(&mut self, src: &mut NodeReadTrx) -> Result<&mut Self> {
        let events = src.subtree_events()?;
        self.mutate(|core| core.replace_with_events(&events))
    }

    pub fn replace_node(&mut self, events: Vec<SubtreeEvent>) -> Result<&mut Self> {
        self.mutate(|core| core.replace_with_events(&events))
    }

    // --- structure ----------------------------------------------------

    /// Removes the subtree rooted at the selected node; the cursor
    /// advances right sibling, then left sibling, then parent.
    pub fn remove(&mut self) -> Result<&mut Self> {
        self.mutate(|core| core.remove())
    }

    pub fn move_subtree_to_first_child(&mut self, from_key: NodeKey) -> Result<&mut Self> {
        self.mutate(|core| core.move_subtree(from_key, InsertPos::FirstChild))
    }

    pub fn move_subtree_to_left_sibling(&mut self, from_key: NodeKey) -> Result<&mut Self> {
        self.mutate(|core| core.move_subtree(from_key, InsertPos::LeftSibling))
    }

    pub fn move_subtree_to_right_sibling(&mut self, from_key: NodeKey) -> Result<&mut Self> {
        self.mutate(|core| core.move_subtree(from_key, InsertPos::RightSibling))
    }

    pub fn set_name(&mut self, name: &QName) -> Result<&mut Self> {
        self.mutate(|core| core.set_name(name))
    }

    pub fn set_value(&mut self, value: &str) -> Result<&mut Self> {
        self.mutate(|core| core.set_value(value))
    }

    fn mutate<F>(&mut self, op: F) -> Result<&mut Self>
    where
        F: FnOnce(&mut WriteCore) -> Result<()>,
    {
        {
            let mut core = self.lock()?;
            core.check_access()?;
            if let Err(e) = op(&mut core) {
                // Failed preconditions leave the count untouched.
                core.modification_count -= 1;
                return Err(e);
            }
            core.cursor.refresh()?;
            core.maybe_intermediate_commit()?;
        }
        Ok(self)
    }

    // --- transaction control ------------------------------------------

    /// Commits the pending changes as the next revision.
    pub fn commit(&mut self) -> Result<u32> {
        self.lock()?.commit()
    }

    /// Discards the pending changes.
    pub fn abort(&mut self) -> Result<()> {
        self.lock_any()?.abort()
    }

    /// Rebinds so the next commit reproduces `revision` as a new head
    /// revision.
    pub fn revert_to(&mut self, revision: u32) -> Result<()> {
        self.lock()?.revert_to(revision)
    }

    /// Fails with `PendingModifications` unless committed or aborted.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let auto_commit = self.timer.is_some();
        self.stop_timer();
        {
            let mut core = self.core.lock().unwrap();
            if core.auto_commit_failed {
                core.abort()?;
            }
            if core.cursor.pages.has_changes() {
                // Auto-committing transactions flush on close; everything
                // else must commit or abort explicitly.
                if auto_commit || core.max_node_count > 0 {
                    core.commit()?;
                } else {
                    return Err(Error::Storage(
                        alderdb_storage::Error::PendingModifications,
                    ));
                }
            }
            core.cursor.pages.close().map_err(Error::from_storage)?;
        }
        self.closed = true;
        self.resource.release_writer();
        Ok(())
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            let _ = timer.stop.send(());
            let _ = timer.handle.join();
        }
    }
}

impl Drop for NodeWriteTrx {
    fn drop(&mut self) {
        if !self.closed {
            self.stop_timer();
            self.core.lock().unwrap().cursor.pages.force_close();
            self.closed = true;
            self.resource.release_writer();
        }
    }
}

impl WriteCore {
    fn pages(&mut self) -> &mut PageWriteTrx {
        &mut self.cursor.pages
    }

    fn check_access(&mut self) -> Result<()> {
        self.cursor
            .pages
            .assert_open()
            .map_err(Error::from_storage)?;
        self.modification_count += 1;
        Ok(())
    }

    /// Intermediate commit once the modification count passes the bound.
    fn maybe_intermediate_commit(&mut self) -> Result<()> {
        if self.max_node_count > 0 && self.modification_count > self.max_node_count {
            log::debug!(
                "modification count {} exceeded {}, intermediate commit",
                self.modification_count,
                self.max_node_count
            );
            self.commit()?;
        }
        Ok(())
    }

    fn node(&mut self, key: NodeKey) -> Result<Node> {
        self.cursor
            .pages
            .record(key, DOC)
            .map_err(Error::from_storage)?
            .ok_or(Error::NotFound(key))
    }

    fn prepare(&mut self, key: NodeKey) -> Result<Node> {
        self.cursor.pages.prepare(key, DOC).map_err(Error::from_storage)
    }

    fn put(&mut self, node: Node) -> Result<()> {
        self.cursor.pages.put(node, DOC).map_err(Error::from_storage)
    }

    fn notify(&mut self, change: ChangeType, node: &Node, path_node_key: NodeKey) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            listener.on_change(change, node, path_node_key);
        }
        self.listeners = listeners;
    }

    fn path_of(node: &Node) -> NodeKey {
        node.name_delegate()
            .map(|n| n.path_node_key)
            .unwrap_or(NULL_NODE_KEY)
    }

    // --- anchors ------------------------------------------------------

    fn anchor_for_key(&mut self, key: NodeKey, pos: InsertPos) -> Result<(NodeKey, NodeKey, NodeKey)> {
        let node = self.node(key)?;
        let structure = node
            .structure()
            .ok_or(Error::Usage("current node cannot anchor an insertion"))?
            .clone();
        match pos {
            InsertPos::FirstChild => {
                if !matches!(node.kind(), NodeKind::Element | NodeKind::Document) {
                    return Err(Error::Usage("current node cannot take children"));
                }
                Ok((key, NULL_NODE_KEY, structure.first_child_key))
            }
            InsertPos::LeftSibling => {
                if node.kind() == NodeKind::Document {
                    return Err(Error::Usage("document root cannot take siblings"));
                }
                Ok((node.parent_key(), structure.left_sibling_key, key))
            }
            InsertPos::RightSibling => {
                if node.kind() == NodeKind::Document {
                    return Err(Error::Usage("document root cannot take siblings"));
                }
                Ok((node.parent_key(), key, structure.right_sibling_key))
            }
        }
    }

    fn anchor(&mut self, pos: InsertPos) -> Result<(NodeKey, NodeKey, NodeKey)> {
        let key = self.cursor.key();
        if key < 0 {
            return Err(Error::Usage("cannot insert relative to a transient item"));
        }
        self.anchor_for_key(key, pos)
    }

    fn dewey_between(
        &mut self,
        parent: NodeKey,
        left: NodeKey,
        right: NodeKey,
    ) -> Result<Option<DeweyId>> {
        if !self.use_dewey {
            return Ok(None);
        }
        let parent_id = self
            .node(parent)?
            .delegate()
            .dewey
            .clone()
            .ok_or(Error::Storage(alderdb_storage::Error::Corrupted(
                "missing order label on parent",
            )))?;
        let left_id = if left == NULL_NODE_KEY {
            None
        } else {
            self.node(left)?.delegate().dewey.clone()
        };
        let right_id = if right == NULL_NODE_KEY {
            None
        } else {
            self.node(right)?.delegate().dewey.clone()
        };
        Ok(Some(DeweyId::new_between(
            left_id.as_ref(),
            right_id.as_ref(),
            &parent_id,
        )))
    }

    // --- link surgery -------------------------------------------------

    /// Wires a detached node into `(parent, left, right)` and maintains
    /// counts. `size` is the subtree size entering the chain.
    fn attach_links(
        &mut self,
        key: NodeKey,
        parent: NodeKey,
        left: NodeKey,
        right: NodeKey,
        size: u64,
    ) -> Result<()> {
        let mut node = self.prepare(key)?;
        node.delegate_mut().parent_key = parent;
        if let Some(s) = node.structure_mut() {
            s.left_sibling_key = left;
            s.right_sibling_key = right;
        }
        self.put(node)?;

        if left != NULL_NODE_KEY {
            let mut l = self.prepare(left)?;
            if let Some(s) = l.structure_mut() {
                s.right_sibling_key = key;
            }
            self.put(l)?;
        }
        if right != NULL_NODE_KEY {
            let mut r = self.prepare(right)?;
            if let Some(s) = r.structure_mut() {
                s.left_sibling_key = key;
            }
            self.put(r)?;
        }
        let mut p = self.prepare(parent)?;
        if let Some(s) = p.structure_mut() {
            if left == NULL_NODE_KEY {
                s.first_child_key = key;
            }
            s.child_count += 1;
        }
        self.put(p)?;
        self.adjust_descendant_counts(parent, size as i64)
    }

    /// Unwires a node from its sibling chain and maintains counts.
    fn detach_links(&mut self, key: NodeKey) -> Result<()> {
        let node = self.node(key)?;
        let structure = node
            .structure()
            .ok_or(Error::InvalidMove("only structural nodes can be detached"))?
            .clone();
        let parent = node.parent_key();
        let size = structure.descendant_count + 1;

        if structure.left_sibling_key != NULL_NODE_KEY {
            let mut l = self.prepare(structure.left_sibling_key)?;
            if let Some(s) = l.structure_mut() {
                s.right_sibling_key = structure.right_sibling_key;
            }
            self.put(l)?;
        }
        if structure.right_sibling_key != NULL_NODE_KEY {
            let mut r = self.prepare(structure.right_sibling_key)?;
            if let Some(s) = r.structure_mut() {
                s.left_sibling_key = structure.left_sibling_key;
            }
            self.put(r)?;
        }
        let mut p = self.prepare(parent)?;
        if let Some(s) = p.structure_mut() {
            if s.first_child_key == key {
                s.first_child_key = structure.right_sibling_key;
            }
            s.child_count = s.child_count.saturating_sub(1);
        }
        self.put(p)?;
        self.adjust_descendant_counts(parent, -(size as i64))
    }

    fn adjust_descendant_counts(&mut self, start: NodeKey, delta: i64) -> Result<()> {
        let mut key = start;
        while key != NULL_NODE_KEY {
            let mut node = self.prepare(key)?;
            let parent = node.parent_key();
            if let Some(s) = node.structure_mut() {
                s.descendant_count = s.descendant_count.saturating_add_signed(delta);
            }
            self.put(node)?;
            key = parent;
        }
        Ok(())
    }

    // --- hashes -------------------------------------------------------

    /// Applies the rolling step at every ancestor, starting with the
    /// parent whose direct child's hash moved from `old` to `new`.
    fn propagate_hash(&mut self, start_parent: NodeKey, old: u64, new: u64) -> Result<()> {
        if self.hashing == HashKind::None || self.bulk_mode {
            return Ok(());
        }
        let mut old_child = old;
        let mut new_child = new;
        let mut key = start_parent;
        while key != NULL_NODE_KEY {
            let mut node = self.prepare(key)?;
            let before = node.hash();
            let after = rolling_step(before, old_child, new_child);
            node.delegate_mut().hash = after;
            let parent = node.parent_key();
            self.put(node)?;
            old_child = before;
            new_child = after;
            key = parent;
        }
        Ok(())
    }

    /// Recomputes the whole subtree bottom-up, then adds the subtree's
    /// contribution to the ancestors. Used after bulk insertion, whose
    /// per-record hash maintenance is suppressed, so the ancestors have
    /// seen nothing of the subtree yet.
    fn postorder_rehash(&mut self, root: NodeKey) -> Result<()> {
        if self.hashing == HashKind::None {
            return Ok(());
        }
        let keys = self.collect_subtree(root)?;
        for key in keys {
            let mut node = self.prepare(key)?;
            let mut sum = 0u64;
            if let Node::Element(e) = &node {
                for k in e.attribute_keys.iter().chain(e.namespace_keys.iter()) {
                    sum = sum.wrapping_add(
                        self.node(*k)?.hash().wrapping_mul(crate::hash::HASH_PRIME),
                    );
                }
            }
            if let Some(s) = node.structure() {
                let mut child = s.first_child_key;
                while child != NULL_NODE_KEY {
                    let c = self.node(child)?;
                    sum = sum.wrapping_add(c.hash().wrapping_mul(crate::hash::HASH_PRIME));
                    child = c.structure().map(|cs| cs.right_sibling_key).unwrap_or(NULL_NODE_KEY);
                }
            }
            let h = content_hash(&node).wrapping_add(sum);
            node.delegate_mut().hash = h;
            self.put(node)?;
        }
        let root_after = self.node(root)?.hash();
        let parent = self.node(root)?.parent_key();
        self.propagate_hash(parent, 0, root_after)
    }

    // --- subtree walks ------------------------------------------------

    /// Keys of the subtree rooted at `root` in post-order; an element's
    /// attributes and namespaces precede it like children.
    fn collect_subtree(&mut self, root: NodeKey) -> Result<Vec<NodeKey>> {
        let mut out = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((key, expanded)) = stack.pop() {
            if expanded {
                out.push(key);
                continue;
            }
            stack.push((key, true));
            let node = self.node(key)?;
            if let Node::Element(e) = &node {
                for k in e.attribute_keys.iter().chain(e.namespace_keys.iter()) {
                    stack.push((*k, true));
                }
            }
            if let Some(s) = node.structure() {
                let mut child = s.first_child_key;
                let mut children = Vec::new();
                while child != NULL_NODE_KEY {
                    children.push(child);
                    child = self
                        .node(child)?
                        .structure()
                        .map(|cs| cs.right_sibling_key)
                        .unwrap_or(NULL_NODE_KEY);
                }
                for k in children.into_iter().rev() {
                    stack.push((k, false));
                }
            }
        }
        Ok(out)
    }

    /// Top-down keys of the subtree, parents before children.
    fn collect_subtree_top_down(&mut self, root: NodeKey) -> Result<Vec<NodeKey>> {
        let mut post = self.collect_subtree(root)?;
        post.reverse();
        Ok(post)
    }

    // --- names and paths ----------------------------------------------

    fn intern_qname(&mut self, name: &QName, kind: NameKind) -> (i32, i32, i32) {
        let prefix_key = match name.prefix.as_deref() {
            Some(p) => self.cursor.pages.create_name_key(p, kind),
            None => -1,
        };
        let local_name_key = self.cursor.pages.create_name_key(&name.local, kind);
        let uri_key = match name.uri.as_deref() {
            Some(u) => self.cursor.pages.create_name_key(u, kind),
            None => -1,
        };
        (prefix_key, local_name_key, uri_key)
    }

    fn release_names(&mut self, node: &Node) {
        let kind = match NameKind::for_node(node.kind()) {
            Some(k) => k,
            None => return,
        };
        if let Some(nd) = node.name_delegate() {
            for key in [nd.prefix_key, nd.local_name_key, nd.uri_key] {
                if key != -1 {
                    self.cursor.pages.remove_name(key, kind);
                }
            }
        }
    }

    fn release_names_and_path(&mut self, node: &Node) -> Result<()> {
        self.release_names(node);
        if let Some(nd) = node.name_delegate() {
            path_summary::release(self.pages(), nd.path_node_key)?;
        }
        Ok(())
    }

    /// Re-derives the path summary entries for a whole subtree after a
    /// rename or move. Parents are processed first so children see their
    /// parent's fresh path.
    fn rebuild_paths_subtree(&mut self, root: NodeKey) -> Result<()> {
        for key in self.collect_subtree_top_down(root)? {
            let node = self.node(key)?;
            let nd = match node.name_delegate() {
                Some(n) => n.clone(),
                None => continue,
            };
            path_summary::release(self.pages(), nd.path_node_key)?;
            let parent_node = self.node(node.parent_key())?;
            let parent_path = path_summary::parent_path_key(&parent_node);
            let path_key = path_summary::find_or_create(
                self.pages(),
                parent_path,
                node.kind(),
                nd.prefix_key,
                nd.local_name_key,
                nd.uri_key,
            )?;
            let mut updated = self.prepare(key)?;
            if let Some(n) = updated.name_delegate_mut() {
                n.path_node_key = path_key;
            }
            self.put(updated)?;
        }
        Ok(())
    }

    // --- inserts ------------------------------------------------------

    fn insert_element(&mut self, name: &QName, pos: InsertPos) -> Result<NodeKey> {
        let (parent, left, right) = self.anchor(pos)?;
        let (prefix_key, local_name_key, uri_key) = self.intern_qname(name, NameKind::Element);
        let parent_node = self.node(parent)?;
        let parent_path = path_summary::parent_path_key(&parent_node);
        let path_key = path_summary::find_or_create(
            self.pages(),
            parent_path,
            NodeKind::Element,
            prefix_key,
            local_name_key,
            uri_key,
        )?;

        let key = self.cursor.pages.allocate_key(DOC);
        let dewey = self.dewey_between(parent, left, right)?;
        let mut node = Node::Element(ElementNode {
            del: NodeDelegate {
                node_key: key,
                parent_key: parent,
                type_key: 0,
                hash: 0,
                dewey,
            },
            structure: StructNodeDelegate {
                first_child_key: NULL_NODE_KEY,
                left_sibling_key: left,
                right_sibling_key: right,
                child_count: 0,
                descendant_count: 0,
            },
            name: NameNodeDelegate {
                prefix_key,
                local_name_key,
                uri_key,
                path_node_key: path_key,
            },
            attribute_keys: Vec::new(),
            namespace_keys: Vec::new(),
        });
        let h = content_hash(&node);
        node.delegate_mut().hash = h;
        self.cursor
            .pages
            .create_entry(node.clone(), DOC)
            .map_err(Error::from_storage)?;
        self.finish_structural_insert(key, parent, left, right, h, &node, path_key)
    }

    fn insert_text(&mut self, value: &str, pos: InsertPos) -> Result<NodeKey> {
        if value.is_empty() {
            return Err(Error::Usage("text value must not be empty"));
        }
        let (parent, left, right) = self.anchor(pos)?;

        // Adjacent text merges instead of creating a second text node.
        if left != NULL_NODE_KEY {
            let l = self.node(left)?;
            if l.kind() == NodeKind::Text {
                let merged = [l.value().unwrap_or_default(), value.as_bytes()].concat();
                self.update_value_of(left, merged)?;
                self.cursor.try_move(left)?;
                return Ok(left);
            }
        }
        if right != NULL_NODE_KEY {
            let r = self.node(right)?;
            if r.kind() == NodeKind::Text {
                let merged = [value.as_bytes(), r.value().unwrap_or_default()].concat();
                self.update_value_of(right, merged)?;
                self.cursor.try_move(right)?;
                return Ok(right);
            }
        }

        let key = self.cursor.pages.allocate_key(DOC);
        let dewey = self.dewey_between(parent, left, right)?;
        let mut node = Node::Text(TextNode {
            del: NodeDelegate {
                node_key: key,
                parent_key: parent,
                type_key: 0,
                hash: 0,
                dewey,
            },
            structure: StructNodeDelegate {
                first_child_key: NULL_NODE_KEY,
                left_sibling_key: left,
                right_sibling_key: right,
                child_count: 0,
                descendant_count: 0,
            },
            value: ValueNodeDelegate::raw(value.as_bytes().to_vec()),
        });
        let h = content_hash(&node);
        node.delegate_mut().hash = h;
        self.cursor
            .pages
            .create_entry(node.clone(), DOC)
            .map_err(Error::from_storage)?;
        self.finish_structural_insert(key, parent, left, right, h, &node, NULL_NODE_KEY)
    }

    fn insert_comment(&mut self, value: &str, pos: InsertPos) -> Result<NodeKey> {
        event::validate_comment(value)?;
        let (parent, left, right) = self.anchor(pos)?;
        let key = self.cursor.pages.allocate_key(DOC);
        let dewey = self.dewey_between(parent, left, right)?;
        let mut node = Node::Comment(CommentNode {
            del: NodeDelegate {
                node_key: key,
                parent_key: parent,
                type_key: 0,
                hash: 0,
                dewey,
            },
            structure: StructNodeDelegate {
                first_child_key: NULL_NODE_KEY,
                left_sibling_key: left,
                right_sibling_key: right,
                child_count: 0,
                descendant_count: 0,
            },
            value: ValueNodeDelegate::raw(value.as_bytes().to_vec()),
        });
        let h = content_hash(&node);
        node.delegate_mut().hash = h;
        self.cursor
            .pages
            .create_entry(node.clone(), DOC)
            .map_err(Error::from_storage)?;
        self.finish_structural_insert(key, parent, left, right, h, &node, NULL_NODE_KEY)
    }

    fn insert_pi(&mut self, target: &str, data: &str, pos: InsertPos) -> Result<NodeKey> {
        event::validate_pi(target, data)?;
        let (parent, left, right) = self.anchor(pos)?;
        let kind = NameKind::ProcessingInstruction;
        let local_name_key = self.cursor.pages.create_name_key(target, kind);
        let parent_node = self.node(parent)?;
        let parent_path = path_summary::parent_path_key(&parent_node);
        let path_key = path_summary::find_or_create(
            self.pages(),
            parent_path,
            NodeKind::ProcessingInstruction,
            -1,
            local_name_key,
            -1,
        )?;

        let key = self.cursor.pages.allocate_key(DOC);
        let dewey = self.dewey_between(parent, left, right)?;
        let mut node = Node::ProcessingInstruction(PiNode {
            del: NodeDelegate {
                node_key: key,
                parent_key: parent,
                type_key: 0,
                hash: 0,
                dewey,
            },
            structure: StructNodeDelegate {
                first_child_key: NULL_NODE_KEY,
                left_sibling_key: left,
                right_sibling_key: right,
                child_count: 0,
                descendant_count: 0,
            },
            name: NameNodeDelegate {
                prefix_key: -1,
                local_name_key,
                uri_key: -1,
                path_node_key: path_key,
            },
            value: ValueNodeDelegate::raw(data.as_bytes().to_vec()),
        });
        let h = content_hash(&node);
        node.delegate_mut().hash = h;
        self.cursor
            .pages
            .create_entry(node.clone(), DOC)
            .map_err(Error::from_storage)?;
        self.finish_structural_insert(key, parent, left, right, h, &node, path_key)
    }

    fn finish_structural_insert(
        &mut self,
        key: NodeKey,
        parent: NodeKey,
        left: NodeKey,
        right: NodeKey,
        hash: u64,
        node: &Node,
        path_key: NodeKey,
    ) -> Result<NodeKey> {
        // The new record carries its links already; wire the neighbours.
        if left != NULL_NODE_KEY {
            let mut l = self.prepare(left)?;
            if let Some(s) = l.structure_mut() {
                s.right_sibling_key = key;
            }
            self.put(l)?;
        }
        if right != NULL_NODE_KEY {
            let mut r = self.prepare(right)?;
            if let Some(s) = r.structure_mut() {
                s.left_sibling_key = key;
            }
            self.put(r)?;
        }
        let mut p = self.prepare(parent)?;
        if let Some(s) = p.structure_mut() {
            if left == NULL_NODE_KEY {
                s.first_child_key = key;
            }
            s.child_count += 1;
        }
        self.put(p)?;
        self.adjust_descendant_counts(parent, 1)?;
        self.propagate_hash(parent, 0, hash)?;
        self.notify(ChangeType::Inserted, node, path_key);
        self.cursor.try_move(key)?;
        Ok(key)
    }

    fn insert_attribute(
        &mut self,
        name: &QName,
        value: &str,
        move_back_to_origin: bool,
    ) -> Result<()> {
        let element = match self.cursor.current().clone() {
            Node::Element(e) => e,
            _ => return Err(Error::Usage("attributes can only live on elements")),
        };
        let kind = NameKind::Attribute;

        // Same qname with a different value updates in place; identical
        // value is rejected.
        let local_key = self.cursor.pages.name_key_for(&name.local, kind);
        let prefix_key = name
            .prefix
            .as_deref()
            .and_then(|p| self.cursor.pages.name_key_for(p, kind));
        for &attr_key in &element.attribute_keys {
            let attr = self.node(attr_key)?;
            let nd = attr.name_delegate().expect("attributes are named").clone();
            let local_matches = local_key == Some(nd.local_name_key);
            let prefix_matches = match (name.prefix.as_deref(), nd.prefix_key) {
                (None, -1) => true,
                (Some(_), k) if k != -1 => prefix_key == Some(k),
                _ => false,
            };
            if local_matches && prefix_matches {
                if attr.value() == Some(value.as_bytes()) {
                    return Err(Error::DuplicateAttribute);
                }
                self.update_value_of(attr_key, value.as_bytes().to_vec())?;
                if move_back_to_origin {
                    self.cursor.try_move(element.del.node_key)?;
                } else {
                    self.cursor.try_move(attr_key)?;
                }
                return Ok(());
            }
        }

        let (prefix_key, local_name_key, uri_key) = self.intern_qname(name, kind);
        let path_key = path_summary::find_or_create(
            self.pages(),
            element.name.path_node_key,
            NodeKind::Attribute,
            prefix_key,
            local_name_key,
            uri_key,
        )?;

        let key = self.cursor.pages.allocate_key(DOC);
        let dewey = if self.use_dewey {
            element
                .del
                .dewey
                .as_ref()
                .map(|d| d.new_attribute(element.attribute_keys.len()))
        } else {
            None
        };
        let mut node = Node::Attribute(AttributeNode {
            del: NodeDelegate {
                node_key: key,
                parent_key: element.del.node_key,
                type_key: 0,
                hash: 0,
                dewey,
            },
            name: NameNodeDelegate {
                prefix_key,
                local_name_key,
                uri_key,
                path_node_key: path_key,
            },
            value: ValueNodeDelegate::raw(value.as_bytes().to_vec()),
        });
        let h = content_hash(&node);
        node.delegate_mut().hash = h;
        self.cursor
            .pages
            .create_entry(node.clone(), DOC)
            .map_err(Error::from_storage)?;

        let mut owner = self.prepare(element.del.node_key)?;
        if let Node::Element(e) = &mut owner {
            e.attribute_keys.push(key);
        }
        self.put(owner)?;
        self.propagate_hash(element.del.node_key, 0, h)?;
        self.notify(ChangeType::Inserted, &node, path_key);
        if move_back_to_origin {
            self.cursor.try_move(element.del.node_key)?;
        } else {
            self.cursor.try_move(key)?;
        }
        Ok(())
    }

    fn insert_namespace(&mut self, name: &QName, move_back_to_origin: bool) -> Result<()> {
        let element = match self.cursor.current().clone() {
            Node::Element(e) => e,
            _ => return Err(Error::Usage("namespaces can only live on elements")),
        };
        let kind = NameKind::Namespace;
        let prefix = name
            .prefix
            .as_deref()
            .ok_or(Error::Usage("namespace needs a prefix"))?;

        if let Some(existing_prefix_key) = self.cursor.pages.name_key_for(prefix, kind) {
            for &ns_key in &element.namespace_keys {
                let ns = self.node(ns_key)?;
                if ns.name_delegate().map(|n| n.prefix_key) == Some(existing_prefix_key) {
                    return Err(Error::DuplicateNamespace);
                }
            }
        }

        let prefix_key = self.cursor.pages.create_name_key(prefix, kind);
        let uri_key = match name.uri.as_deref() {
            Some(u) => self.cursor.pages.create_name_key(u, kind),
            None => -1,
        };
        let path_key = path_summary::find_or_create(
            self.pages(),
            element.name.path_node_key,
            NodeKind::Namespace,
            prefix_key,
            -1,
            uri_key,
        )?;

        let key = self.cursor.pages.allocate_key(DOC);
        let dewey = if self.use_dewey {
            element
                .del
                .dewey
                .as_ref()
                .map(|d| d.new_namespace(element.namespace_keys.len()))
        } else {
            None
        };
        let mut node = Node::Namespace(alderdb_storage::record::NamespaceNode {
            del: NodeDelegate {
                node_key: key,
                parent_key: element.del.node_key,
                type_key: 0,
                hash: 0,
                dewey,
            },
            name: NameNodeDelegate {
                prefix_key,
                local_name_key: -1,
                uri_key,
                path_node_key: path_key,
            },
        });
        let h = content_hash(&node);
        node.delegate_mut().hash = h;
        self.cursor
            .pages
            .create_entry(node.clone(), DOC)
            .map_err(Error::from_storage)?;

        let mut owner = self.prepare(element.del.node_key)?;
        if let Node::Element(e) = &mut owner {
            e.namespace_keys.push(key);
        }
        self.put(owner)?;
        self.propagate_hash(element.del.node_key, 0, h)?;
        self.notify(ChangeType::Inserted, &node, path_key);
        if move_back_to_origin {
            self.cursor.try_move(element.del.node_key)?;
        } else {
            self.cursor.try_move(key)?;
        }
        Ok(())
    }

    /// Bulk insertion from a shredder event stream with postorder hash
    /// maintenance.
    fn insert_subtree(&mut self, events: &[SubtreeEvent], pos: InsertPos) -> Result<NodeKey> {
        // A single leaf event may merge into a pre-existing text sibling,
        // which the postorder pass must not re-add; insert it plainly.
        match events {
            [] => return Err(Error::Usage("empty subtree event stream")),
            [SubtreeEvent::Text(value)] => return self.insert_text(value, pos),
            [SubtreeEvent::Comment(value)] => return self.insert_comment(value, pos),
            [SubtreeEvent::ProcessingInstruction { target, data }] => {
                return self.insert_pi(target, data, pos);
            }
            _ => {}
        }
        let was_bulk = self.bulk_mode;
        self.bulk_mode = true;
        let result = self.insert_subtree_inner(events, pos);
        self.bulk_mode = was_bulk;
        let first = result?;
        self.postorder_rehash(first)?;
        self.cursor.try_move(first)?;
        Ok(first)
    }

    fn insert_subtree_inner(&mut self, events: &[SubtreeEvent], pos: InsertPos) -> Result<NodeKey> {
        let mut first: Option<NodeKey> = None;
        let mut next_pos = pos;
        let mut depth: i64 = 0;

        for event in events {
            // The stream must describe exactly one subtree.
            if first.is_some() && depth == 0 {
                return Err(Error::Usage(
                    "subtree event stream must describe a single subtree",
                ));
            }
            match event {
                SubtreeEvent::StartElement {
                    name,
                    attributes,
                    namespaces,
                } => {
                    let key = self.insert_element(name, next_pos)?;
                    first.get_or_insert(key);
                    for ns in namespaces {
                        self.insert_namespace(ns, true)?;
                    }
                    for (qname, value) in attributes {
                        self.insert_attribute(qname, value, true)?;
                    }
                    next_pos = InsertPos::FirstChild;
                    depth += 1;
                }
                SubtreeEvent::Text(value) => {
                    let key = self.insert_text(value, next_pos)?;
                    first.get_or_insert(key);
                    next_pos = InsertPos::RightSibling;
                }
                SubtreeEvent::Comment(value) => {
                    let key = self.insert_comment(value, next_pos)?;
                    first.get_or_insert(key);
                    next_pos = InsertPos::RightSibling;
                }
                SubtreeEvent::ProcessingInstruction { target, data } => {
                    let key = self.insert_pi(target, data, next_pos)?;
                    first.get_or_insert(key);
                    next_pos = InsertPos::RightSibling;
                }
                SubtreeEvent::EndElement => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::Usage("unbalanced subtree event stream"));
                    }
                    if next_pos == InsertPos::FirstChild {
                        // Empty element, the cursor already sits on it.
                        next_pos = InsertPos::RightSibling;
                    } else {
                        self.cursor.move_to_parent()?;
                        next_pos = InsertPos::RightSibling;
                    }
                }
            }
        }
        if depth != 0 {
            return Err(Error::Usage("unbalanced subtree event stream"));
        }
        first.ok_or(Error::Usage("empty subtree event stream"))
    }

    fn replace_with_events(&mut self, events: &[SubtreeEvent]) -> Result<()> {
        let current = self.cursor.current().clone();
        match current.kind() {
            NodeKind::Document => return Err(Error::Usage("cannot replace the document root")),
            NodeKind::Attribute | NodeKind::Namespace => {
                return Err(Error::Usage("cannot replace attributes or namespaces"));
            }
            _ => {}
        }
        let old_key = current.key();
        let new_key = self.insert_subtree(events, InsertPos::RightSibling)?;
        self.cursor.try_move(old_key)?;
        self.remove()?;
        self.cursor.try_move(new_key)?;
        Ok(())
    }

    // --- value and name updates ---------------------------------------

    fn update_value_of(&mut self, key: NodeKey, value: Vec<u8>) -> Result<()> {
        let mut node = self.prepare(key)?;
        let before = node.hash();
        let old_content = content_hash(&node);
        node.set_value(value);
        let new_content = content_hash(&node);
        let after = before.wrapping_sub(old_content).wrapping_add(new_content);
        node.delegate_mut().hash = after;
        let parent = node.parent_key();
        let path = Self::path_of(&node);
        self.put(node.clone())?;
        self.propagate_hash(parent, before, after)?;
        self.notify(ChangeType::Updated, &node, path);
        Ok(())
    }

    fn set_value(&mut self, value: &str) -> Result<()> {
        let current = self.cursor.current().clone();
        if current.value().is_none() {
            return Err(Error::Usage("current node carries no value"));
        }
        if current.kind() == NodeKind::Comment {
            event::validate_comment(value)?;
        }
        if current.kind() == NodeKind::ProcessingInstruction && value.contains("?>") {
            return Err(Error::InvalidContent(
                "processing instruction must not contain '?>'",
            ));
        }
        self.update_value_of(current.key(), value.as_bytes().to_vec())
    }

    fn set_name(&mut self, name: &QName) -> Result<()> {
        let current = self.cursor.current().clone();
        let kind = NameKind::for_node(current.kind())
            .ok_or(Error::Usage("current node carries no name"))?;
        let old_delegate = current.name_delegate().expect("named node").clone();

        let (prefix_key, local_name_key, uri_key) = self.intern_qname(name, kind);
        let mut node = self.prepare(current.key())?;
        let before = node.hash();
        let old_content = content_hash(&node);
        if let Some(nd) = node.name_delegate_mut() {
            nd.prefix_key = prefix_key;
            nd.local_name_key = local_name_key;
            nd.uri_key = uri_key;
        }
        let new_content = content_hash(&node);
        let after = before.wrapping_sub(old_content).wrapping_add(new_content);
        node.delegate_mut().hash = after;
        let parent = node.parent_key();
        self.put(node.clone())?;

        for key in [
            old_delegate.prefix_key,
            old_delegate.local_name_key,
            old_delegate.uri_key,
        ] {
            if key != -1 {
                self.cursor.pages.remove_name(key, kind);
            }
        }

        if current.kind() == NodeKind::Element {
            // Every descendant path runs through the renamed label.
            self.rebuild_paths_subtree(current.key())?;
        } else {
            path_summary::release(self.pages(), old_delegate.path_node_key)?;
            let parent_node = self.node(parent)?;
            let parent_path = path_summary::parent_path_key(&parent_node);
            let path_key = path_summary::find_or_create(
                self.pages(),
                parent_path,
                current.kind(),
                prefix_key,
                local_name_key,
                uri_key,
            )?;
            let mut updated = self.prepare(current.key())?;
            if let Some(nd) = updated.name_delegate_mut() {
                nd.path_node_key = path_key;
            }
            self.put(updated)?;
        }

        self.propagate_hash(parent, before, after)?;
        let refreshed = self.node(current.key())?;
        let path = Self::path_of(&refreshed);
        self.notify(ChangeType::Updated, &refreshed, path);
        Ok(())
    }

    // --- removal ------------------------------------------------------

    fn remove(&mut self) -> Result<()> {
        let current = self.cursor.current().clone();
        match current.kind() {
            NodeKind::Document => Err(Error::Usage("cannot remove the document root")),
            NodeKind::Attribute => self.remove_attribute(current),
            NodeKind::Namespace => self.remove_namespace(current),
            _ => self.remove_structural(current),
        }
    }

    fn remove_attribute(&mut self, attr: Node) -> Result<()> {
        let element_key = attr.parent_key();
        let mut owner = self.prepare(element_key)?;
        if let Node::Element(e) = &mut owner {
            e.attribute_keys.retain(|&k| k != attr.key());
        }
        self.put(owner)?;
        self.propagate_hash(element_key, attr.hash(), 0)?;
        self.release_names_and_path(&attr)?;
        self.notify(ChangeType::Removed, &attr, Self::path_of(&attr));
        self.cursor
            .pages
            .remove_entry(attr.key(), DOC)
            .map_err(Error::from_storage)?;
        self.cursor.try_move(element_key)?;
        Ok(())
    }

    fn remove_namespace(&mut self, ns: Node) -> Result<()> {
        let element_key = ns.parent_key();
        let mut owner = self.prepare(element_key)?;
        if let Node::Element(e) = &mut owner {
            e.namespace_keys.retain(|&k| k != ns.key());
        }
        self.put(owner)?;
        self.propagate_hash(element_key, ns.hash(), 0)?;
        self.release_names_and_path(&ns)?;
        self.notify(ChangeType::Removed, &ns, Self::path_of(&ns));
        self.cursor
            .pages
            .remove_entry(ns.key(), DOC)
            .map_err(Error::from_storage)?;
        self.cursor.try_move(element_key)?;
        Ok(())
    }

    fn remove_structural(&mut self, root: Node) -> Result<()> {
        let root_key = root.key();
        let structure = root.structure().expect("structural node").clone();
        let parent = root.parent_key();
        let (left, right) = (structure.left_sibling_key, structure.right_sibling_key);

        self.propagate_hash(parent, root.hash(), 0)?;

        for key in self.collect_subtree(root_key)? {
            let node = self.node(key)?;
            self.release_names_and_path(&node)?;
            self.notify(ChangeType::Removed, &node, Self::path_of(&node));
            self.cursor
                .pages
                .remove_entry(key, DOC)
                .map_err(Error::from_storage)?;
        }

        // Link surgery around the gap.
        if left != NULL_NODE_KEY {
            let mut l = self.prepare(left)?;
            if let Some(s) = l.structure_mut() {
                s.right_sibling_key = right;
            }
            self.put(l)?;
        }
        if right != NULL_NODE_KEY {
            let mut r = self.prepare(right)?;
            if let Some(s) = r.structure_mut() {
                s.left_sibling_key = left;
            }
            self.put(r)?;
        }
        let mut p = self.prepare(parent)?;
        if let Some(s) = p.structure_mut() {
            if s.first_child_key == root_key {
                s.first_child_key = right;
            }
            s.child_count = s.child_count.saturating_sub(1);
        }
        self.put(p)?;
        self.adjust_descendant_counts(parent, -((structure.descendant_count + 1) as i64))?;

        // The removal may expose two adjacent text nodes; merge them.
        let mut target = if right != NULL_NODE_KEY {
            right
        } else if left != NULL_NODE_KEY {
            left
        } else {
            parent
        };
        if left != NULL_NODE_KEY && right != NULL_NODE_KEY {
            let l = self.node(left)?;
            let r = self.node(right)?;
            if l.kind() == NodeKind::Text && r.kind() == NodeKind::Text {
                let merged = [l.value().unwrap_or_default(), r.value().unwrap_or_default()]
                    .concat();
                self.remove_leaf_text(right)?;
                self.update_value_of(left, merged)?;
                target = left;
            }
        }
        self.cursor.try_move(target)?;
        Ok(())
    }

    /// Removes a single text node: tombstone, links, counts, hash.
    fn remove_leaf_text(&mut self, key: NodeKey) -> Result<()> {
        let node = self.node(key)?;
        debug_assert_eq!(node.kind(), NodeKind::Text);
        let parent = node.parent_key();
        self.propagate_hash(parent, node.hash(), 0)?;
        self.detach_links(key)?;
        self.notify(ChangeType::Removed, &node, NULL_NODE_KEY);
        self.cursor
            .pages
            .remove_entry(key, DOC)
            .map_err(Error::from_storage)
    }

    // --- subtree moves ------------------------------------------------

    fn move_subtree(&mut self, from_key: NodeKey, pos: InsertPos) -> Result<()> {
        let from = self.node(from_key)?;
        if from.structure().is_none() || from.kind() == NodeKind::Document {
            return Err(Error::InvalidMove("only structural nodes can move"));
        }
        let target = self.cursor.current().clone();
        if target.key() == from_key {
            return Err(Error::InvalidMove("cannot move a node relative to itself"));
        }

        // Moving a node below one of its own descendants cycles the tree.
        let mut probe = target.key();
        while probe != NULL_NODE_KEY {
            if probe == from_key {
                return Err(Error::MoveIntoDescendant);
            }
            probe = self.node(probe)?.parent_key();
        }

        // Validate the target anchor before touching anything.
        self.anchor_for_key(target.key(), pos)?;

        let old_parent = from.parent_key();
        let from_hash = from.hash();
        let size = from.structure().expect("structural").descendant_count + 1;

        self.propagate_hash(old_parent, from_hash, 0)?;
        self.detach_links(from_key)?;

        // Anchors may have shifted during the detach.
        let (parent, left, right) = self.anchor_for_key(target.key(), pos)?;
        self.attach_links(from_key, parent, left, right, size)?;
        self.propagate_hash(parent, 0, from_hash)?;

        if self.use_dewey {
            self.relabel_subtree(from_key)?;
        }
        self.rebuild_paths_subtree(from_key)?;
        for key in self.collect_subtree_top_down(from_key)? {
            let node = self.node(key)?;
            self.notify(ChangeType::Updated, &node, Self::path_of(&node));
        }
        self.cursor.try_move(from_key)?;
        Ok(())
    }

    /// Assigns fresh order labels to a re-parented subtree, top-down.
    fn relabel_subtree(&mut self, root: NodeKey) -> Result<()> {
        let node = self.node(root)?;
        let structure = node.structure().expect("structural").clone();
        let label = self.dewey_between(
            node.parent_key(),
            structure.left_sibling_key,
            structure.right_sibling_key,
        )?;
        let mut updated = self.prepare(root)?;
        updated.delegate_mut().dewey = label;
        self.put(updated)?;

        for key in self.collect_subtree_top_down(root)? {
            let node = self.node(key)?;
            let parent_label = match node.delegate().dewey.clone() {
                Some(l) => l,
                None => continue,
            };
            if let Node::Element(e) = &node {
                for (i, &ak) in e.attribute_keys.iter().enumerate() {
                    let mut a = self.prepare(ak)?;
                    a.delegate_mut().dewey = Some(parent_label.new_attribute(i));
                    self.put(a)?;
                }
                for (i, &nk) in e.namespace_keys.iter().enumerate() {
                    let mut n = self.prepare(nk)?;
                    n.delegate_mut().dewey = Some(parent_label.new_namespace(i));
                    self.put(n)?;
                }
            }
            if let Some(s) = node.structure() {
                let mut child = s.first_child_key;
                let mut previous: Option<DeweyId> = None;
                while child != NULL_NODE_KEY {
                    let label = match &previous {
                        None => parent_label.new_first_child(),
                        Some(p) => p.new_right_of(),
                    };
                    let mut c = self.prepare(child)?;
                    c.delegate_mut().dewey = Some(label.clone());
                    let next = c
                        .structure()
                        .map(|cs| cs.right_sibling_key)
                        .unwrap_or(NULL_NODE_KEY);
                    self.put(c)?;
                    previous = Some(label);
                    child = next;
                }
            }
        }
        Ok(())
    }

    // --- transaction control ------------------------------------------

    pub(crate) fn commit(&mut self) -> Result<u32> {
        let view = CommitSnapshot {
            revision: self.cursor.pages.revision(),
            max_node_key: self.cursor.pages.max_key(DOC),
        };
        let mut hooks = std::mem::take(&mut self.pre_hooks);
        let mut failed = None;
        for hook in &mut hooks {
            if let Err(e) = hook.pre_commit(&view) {
                failed = Some(e);
                break;
            }
        }
        self.pre_hooks = hooks;
        if let Some(e) = failed {
            log::warn!("pre-commit hook failed, commit aborted: {e}");
            return Err(e);
        }

        let committed = view.revision;
        let uber = self.cursor.pages.commit().map_err(Error::from_storage)?;
        self.resource.publish(uber);
        self.modification_count = 0;
        self.cursor.refresh()?;

        let view = CommitSnapshot {
            revision: committed,
            max_node_key: self.cursor.pages.max_key(DOC),
        };
        let mut hooks = std::mem::take(&mut self.post_hooks);
        let mut failed = None;
        for hook in &mut hooks {
            if let Err(e) = hook.post_commit(&view) {
                failed = Some(e);
                break;
            }
        }
        self.post_hooks = hooks;
        if let Some(e) = failed {
            // The revision is already published; report the failure.
            return Err(e);
        }
        Ok(committed)
    }

    fn abort(&mut self) -> Result<()> {
        self.cursor.pages.abort().map_err(Error::from_storage)?;
        self.modification_count = 0;
        self.auto_commit_failed = false;
        self.cursor.move_to_document_root()?;
        Ok(())
    }

    fn revert_to(&mut self, revision: u32) -> Result<()> {
        self.cursor.pages.revert_to(revision).map_err(|e| match e {
            alderdb_storage::Error::RevisionNotFound(r) => Error::InvalidRevision(r),
            other => Error::Storage(other),
        })?;
        self.modification_count = 0;
        self.cursor.move_to_document_root()?;
        Ok(())
    }
}
