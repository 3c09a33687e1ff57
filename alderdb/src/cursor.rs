//! Navigation state machine shared by the read and write cursors.
//!
//! A cursor owns its page transaction and a clone of the selected
//! record. Failed movements leave the cursor exactly where it was.

use crate::{Error, QName, Result};
use alderdb_storage::name::NameKind;
use alderdb_storage::read_trx::PageReadTrx;
use alderdb_storage::record::{Node, NodeDelegate, NodeKey, NodeKind, StructNodeDelegate, TextNode, ValueNodeDelegate};
use alderdb_storage::reference::TreeKind;
use alderdb_storage::write_trx::PageWriteTrx;
use alderdb_storage::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};

/// Outcome of a cursor movement.
#[must_use]
#[derive(Debug)]
pub enum Move<'a, C> {
    Moved(&'a mut C),
    NotMoved,
}

impl<'a, C> Move<'a, C> {
    pub fn has_moved(&self) -> bool {
        matches!(self, Move::Moved(_))
    }

    pub fn get(self) -> Option<&'a mut C> {
        match self {
            Move::Moved(c) => Some(c),
            Move::NotMoved => None,
        }
    }
}

/// Page-transaction capabilities the cursor needs; implemented by both
/// the read and the write side so one state machine serves both.
pub(crate) trait PageAccess {
    fn check_open(&self) -> Result<()>;
    fn node(&mut self, key: NodeKey, tree: TreeKind) -> Result<Option<Node>>;
    fn lookup_name(&self, key: i32, kind: NameKind) -> Option<String>;
    fn revision(&self) -> u32;
    fn max_node_key(&self) -> NodeKey;
}

impl PageAccess for PageReadTrx {
    fn check_open(&self) -> Result<()> {
        self.assert_open().map_err(Error::from_storage)
    }

    fn node(&mut self, key: NodeKey, tree: TreeKind) -> Result<Option<Node>> {
        self.record(key, tree).map_err(Error::from_storage)
    }

    fn lookup_name(&self, key: i32, kind: NameKind) -> Option<String> {
        self.name(key, kind).map(String::from)
    }

    fn revision(&self) -> u32 {
        PageReadTrx::revision(self)
    }

    fn max_node_key(&self) -> NodeKey {
        self.revision_root().max_node_key
    }
}

impl PageAccess for PageWriteTrx {
    fn check_open(&self) -> Result<()> {
        self.assert_open().map_err(Error::from_storage)
    }

    fn node(&mut self, key: NodeKey, tree: TreeKind) -> Result<Option<Node>> {
        self.record(key, tree).map_err(Error::from_storage)
    }

    fn lookup_name(&self, key: i32, kind: NameKind) -> Option<String> {
        self.name(key, kind).map(String::from)
    }

    fn revision(&self) -> u32 {
        PageWriteTrx::revision(self)
    }

    fn max_node_key(&self) -> NodeKey {
        self.max_key(TreeKind::Document)
    }
}

pub(crate) struct Cursor<P: PageAccess> {
    pub(crate) pages: P,
    current: Node,
    /// Transient atomic values addressed by negative keys; `-1` stays
    /// reserved for the null key, so item `i` lives at key `-i - 2`.
    items: Vec<Node>,
}

impl<P: PageAccess> Cursor<P> {
    pub fn new(mut pages: P) -> Result<Self> {
        let current = pages
            .node(DOCUMENT_NODE_KEY, TreeKind::Document)?
            .ok_or(Error::NotFound(DOCUMENT_NODE_KEY))?;
        Ok(Self {
            pages,
            current,
            items: Vec::new(),
        })
    }

    pub fn current(&self) -> &Node {
        &self.current
    }

    pub fn key(&self) -> NodeKey {
        self.current.key()
    }

    pub fn kind(&self) -> NodeKind {
        self.current.kind()
    }

    /// Re-reads the selected record after mutations; falls back to the
    /// document root if it disappeared.
    pub fn refresh(&mut self) -> Result<()> {
        let key = self.current.key();
        if key < 0 {
            return Ok(());
        }
        match self.pages.node(key, TreeKind::Document)? {
            Some(node) => self.current = node,
            None => {
                self.current = self
                    .pages
                    .node(DOCUMENT_NODE_KEY, TreeKind::Document)?
                    .ok_or(Error::NotFound(DOCUMENT_NODE_KEY))?;
            }
        }
        Ok(())
    }

    pub fn try_move(&mut self, key: NodeKey) -> Result<bool> {
        self.pages.check_open()?;
        if key == NULL_NODE_KEY {
            return Ok(false);
        }
        if key < 0 {
            let index = (-key - 2) as usize;
            return Ok(match self.items.get(index) {
                Some(item) => {
                    self.current = item.clone();
                    true
                }
                None => false,
            });
        }
        Ok(match self.pages.node(key, TreeKind::Document)? {
            Some(node) => {
                self.current = node;
                true
            }
            None => false,
        })
    }

    pub fn move_to_document_root(&mut self) -> Result<bool> {
        self.try_move(DOCUMENT_NODE_KEY)
    }

    pub fn move_to_parent(&mut self) -> Result<bool> {
        self.try_move(self.current.parent_key())
    }

    pub fn move_to_first_child(&mut self) -> Result<bool> {
        match self.current.structure() {
            Some(s) => self.try_move(s.first_child_key),
            None => Ok(false),
        }
    }

    pub fn move_to_left_sibling(&mut self) -> Result<bool> {
        match self.current.structure() {
            Some(s) => self.try_move(s.left_sibling_key),
            None => Ok(false),
        }
    }

    pub fn move_to_right_sibling(&mut self) -> Result<bool> {
        match self.current.structure() {
            Some(s) => self.try_move(s.right_sibling_key),
            None => Ok(false),
        }
    }

    /// First child, then along the right-sibling chain.
    pub fn move_to_last_child(&mut self) -> Result<bool> {
        self.pages.check_open()?;
        let mut key = match self.current.structure() {
            Some(s) => s.first_child_key,
            None => return Ok(false),
        };
        if key == NULL_NODE_KEY {
            return Ok(false);
        }
        loop {
            let node = self
                .pages
                .node(key, TreeKind::Document)?
                .ok_or(Error::NotFound(key))?;
            let right = node.structure().map(|s| s.right_sibling_key);
            match right {
                Some(r) if r != NULL_NODE_KEY => key = r,
                _ => break,
            }
        }
        self.try_move(key)
    }

    /// Climbs to the first ancestor-or-self with a right sibling and
    /// moves to that sibling.
    pub fn move_to_next_following(&mut self) -> Result<bool> {
        self.pages.check_open()?;
        let mut probe = self.current.clone();
        loop {
            if let Some(s) = probe.structure() {
                if s.right_sibling_key != NULL_NODE_KEY {
                    return self.try_move(s.right_sibling_key);
                }
            }
            let parent = probe.parent_key();
            if parent == NULL_NODE_KEY {
                return Ok(false);
            }
            probe = self
                .pages
                .node(parent, TreeKind::Document)?
                .ok_or(Error::NotFound(parent))?;
        }
    }

    pub fn move_to_attribute(&mut self, index: usize) -> Result<bool> {
        self.pages.check_open()?;
        match &self.current {
            Node::Element(e) => match e.attribute_keys.get(index).copied() {
                Some(key) => self.try_move(key),
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    pub fn move_to_namespace(&mut self, index: usize) -> Result<bool> {
        self.pages.check_open()?;
        match &self.current {
            Node::Element(e) => match e.namespace_keys.get(index).copied() {
                Some(key) => self.try_move(key),
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    /// Registers a transient atomic value and returns its negative key.
    pub fn register_item(&mut self, value: Vec<u8>) -> NodeKey {
        let key = -(self.items.len() as NodeKey) - 2;
        self.items.push(Node::Text(TextNode {
            del: NodeDelegate::new(key, NULL_NODE_KEY),
            structure: StructNodeDelegate::leaf(NULL_NODE_KEY, NULL_NODE_KEY),
            value: ValueNodeDelegate::raw(value),
        }));
        key
    }

    // --- accessors, defaulting where a kind lacks the attribute -------

    pub fn qname(&self) -> Result<Option<QName>> {
        self.pages.check_open()?;
        let name = match self.current.name_delegate() {
            Some(n) => n,
            None => return Ok(None),
        };
        let kind = match NameKind::for_node(self.current.kind()) {
            Some(k) => k,
            None => return Ok(None),
        };
        let resolve = |key: i32| -> Option<String> {
            if key == -1 {
                None
            } else {
                self.pages.lookup_name(key, kind)
            }
        };
        Ok(Some(QName {
            prefix: resolve(name.prefix_key),
            local: resolve(name.local_name_key).unwrap_or_default(),
            uri: resolve(name.uri_key),
        }))
    }

    pub fn value_string(&self) -> Result<String> {
        self.pages.check_open()?;
        Ok(self
            .current
            .value()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default())
    }

    pub fn hash(&self) -> Result<u64> {
        self.pages.check_open()?;
        Ok(self.current.hash())
    }

    pub fn parent_key(&self) -> Result<NodeKey> {
        self.pages.check_open()?;
        Ok(self.current.parent_key())
    }

    pub fn child_count(&self) -> Result<u64> {
        self.pages.check_open()?;
        Ok(self.current.structure().map(|s| s.child_count).unwrap_or(0))
    }

    pub fn descendant_count(&self) -> Result<u64> {
        self.pages.check_open()?;
        Ok(self
            .current
            .structure()
            .map(|s| s.descendant_count)
            .unwrap_or(0))
    }

    pub fn attribute_count(&self) -> Result<usize> {
        self.pages.check_open()?;
        Ok(match &self.current {
            Node::Element(e) => e.attribute_keys.len(),
            _ => 0,
        })
    }

    pub fn namespace_count(&self) -> Result<usize> {
        self.pages.check_open()?;
        Ok(match &self.current {
            Node::Element(e) => e.namespace_keys.len(),
            _ => 0,
        })
    }
}
