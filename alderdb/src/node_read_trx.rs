//! Read-only node cursor bound to one committed revision.

use crate::cursor::{Cursor, Move};
use crate::event::SubtreeEvent;
use crate::resource::ResourceInner;
use crate::{QName, Result};
use alderdb_storage::name::NameKind;
use alderdb_storage::read_trx::PageReadTrx;
use alderdb_storage::record::{Node, NodeKey, NodeKind};
use alderdb_storage::reference::TreeKind;
use std::sync::Arc;

pub struct NodeReadTrx {
    cursor: Cursor<PageReadTrx>,
    _resource: Arc<ResourceInner>,
}

impl NodeReadTrx {
    pub(crate) fn new(pages: PageReadTrx, resource: Arc<ResourceInner>) -> Result<Self> {
        Ok(Self {
            cursor: Cursor::new(pages)?,
            _resource: resource,
        })
    }

    pub fn revision(&self) -> u32 {
        self.cursor.pages.revision()
    }

    pub fn max_node_key(&self) -> NodeKey {
        self.cursor.pages.revision_root().max_node_key
    }

    pub fn commit_timestamp_ms(&self) -> i64 {
        self.cursor.pages.revision_root().timestamp_ms
    }

    // --- movement -----------------------------------------------------

    pub fn move_to(&mut self, key: NodeKey) -> Result<Move<'_, Self>> {
        let moved = self.cursor.try_move(key)?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_document_root(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_document_root()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_parent(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_parent()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_first_child(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_first_child()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_last_child(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_last_child()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_left_sibling(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_left_sibling()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_right_sibling(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_right_sibling()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_next_following(&mut self) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_next_following()?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_attribute(&mut self, index: usize) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_attribute(index)?;
        Ok(self.outcome(moved))
    }

    pub fn move_to_namespace(&mut self, index: usize) -> Result<Move<'_, Self>> {
        let moved = self.cursor.move_to_namespace(index)?;
        Ok(self.outcome(moved))
    }

    fn outcome(&mut self, moved: bool) -> Move<'_, Self> {
        if moved {
            Move::Moved(self)
        } else {
            Move::NotMoved
        }
    }

    // --- selected record ----------------------------------------------

    pub fn node_key(&self) -> Result<NodeKey> {
        self.cursor.pages.assert_open().map_err(crate::Error::from_storage)?;
        Ok(self.cursor.key())
    }

    pub fn kind(&self) -> Result<NodeKind> {
        self.cursor.pages.assert_open().map_err(crate::Error::from_storage)?;
        Ok(self.cursor.kind())
    }

    pub fn node(&self) -> &Node {
        self.cursor.current()
    }

    pub fn name(&self) -> Result<Option<QName>> {
        self.cursor.qname()
    }

    pub fn value(&self) -> Result<String> {
        self.cursor.value_string()
    }

    pub fn hash(&self) -> Result<u64> {
        self.cursor.hash()
    }

    pub fn parent_key(&self) -> Result<NodeKey> {
        self.cursor.parent_key()
    }

    pub fn child_count(&self) -> Result<u64> {
        self.cursor.child_count()
    }

    pub fn descendant_count(&self) -> Result<u64> {
        self.cursor.descendant_count()
    }

    pub fn attribute_count(&self) -> Result<usize> {
        self.cursor.attribute_count()
    }

    pub fn namespace_count(&self) -> Result<usize> {
        self.cursor.namespace_count()
    }

    pub fn path_node_key(&self) -> Result<NodeKey> {
        self.cursor.pages.assert_open().map_err(crate::Error::from_storage)?;
        Ok(self
            .cursor
            .current()
            .name_delegate()
            .map(|n| n.path_node_key)
            .unwrap_or(-1))
    }

    /// Registers a transient atomic value; address it with the returned
    /// negative key.
    pub fn register_item(&mut self, value: Vec<u8>) -> NodeKey {
        self.cursor.register_item(value)
    }

    // --- auxiliary state ----------------------------------------------

    /// Record of the path-summary tree, for index inspection.
    pub fn path_record(&mut self, key: NodeKey) -> Result<Option<Node>> {
        self.cursor
            .pages
            .record(key, TreeKind::PathSummary)
            .map_err(crate::Error::from_storage)
    }

    pub fn max_path_node_key(&self) -> NodeKey {
        self.cursor.pages.revision_root().max_path_node_key
    }

    /// Reference count of `name` in the revision's dictionary.
    pub fn name_count(&self, name: &str, kind: NameKind) -> u32 {
        match self.cursor.pages.names().key_for(name, kind) {
            Some(key) => self.cursor.pages.names().count(key, kind),
            None => 0,
        }
    }

    pub fn lookup_name(&self, key: i32, kind: NameKind) -> Option<String> {
        self.cursor.pages.name(key, kind).map(String::from)
    }

    /// Flattens the subtree rooted at the selected node into a shredder
    /// event stream; the cursor is restored afterwards.
    pub fn subtree_events(&mut self) -> Result<Vec<SubtreeEvent>> {
        let origin = self.node_key()?;
        let mut events = Vec::new();
        let result = self.emit_events(&mut events);
        let _ = self.move_to(origin)?;
        result?;
        Ok(events)
    }

    fn emit_events(&mut self, out: &mut Vec<SubtreeEvent>) -> Result<()> {
        match self.kind()? {
            NodeKind::Element => {
                let name = self.name()?.ok_or(crate::Error::Usage("element without a name"))?;
                let mut attributes = Vec::new();
                for i in 0..self.attribute_count()? {
                    if self.move_to_attribute(i)?.has_moved() {
                        let qname = self
                            .name()?
                            .ok_or(crate::Error::Usage("attribute without a name"))?;
                        let value = self.value()?;
                        attributes.push((qname, value));
                        let _ = self.move_to_parent()?;
                    }
                }
                let mut namespaces = Vec::new();
                for i in 0..self.namespace_count()? {
                    if self.move_to_namespace(i)?.has_moved() {
                        let qname = self
                            .name()?
                            .ok_or(crate::Error::Usage("namespace without a name"))?;
                        namespaces.push(qname);
                        let _ = self.move_to_parent()?;
                    }
                }
                out.push(SubtreeEvent::StartElement {
                    name,
                    attributes,
                    namespaces,
                });
                if self.move_to_first_child()?.has_moved() {
                    loop {
                        self.emit_events(out)?;
                        if !self.move_to_right_sibling()?.has_moved() {
                            break;
                        }
                    }
                    let _ = self.move_to_parent()?;
                }
                out.push(SubtreeEvent::EndElement);
                Ok(())
            }
            NodeKind::Text => {
                out.push(SubtreeEvent::Text(self.value()?));
                Ok(())
            }
            NodeKind::Comment => {
                out.push(SubtreeEvent::Comment(self.value()?));
                Ok(())
            }
            NodeKind::ProcessingInstruction => {
                let target = self.name()?.map(|q| q.local).unwrap_or_default();
                out.push(SubtreeEvent::ProcessingInstruction {
                    target,
                    data: self.value()?,
                });
                Ok(())
            }
            _ => Err(crate::Error::Usage("this node kind cannot be copied")),
        }
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.cursor.pages.close();
    }
}

impl Drop for NodeReadTrx {
    fn drop(&mut self) {
        self.close();
    }
}
