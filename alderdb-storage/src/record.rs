//! Node records.
//!
//! A record is addressed by a signed 64-bit key; negative keys are
//! reserved for transient per-transaction values and never reach a page.
//! Structure, naming and value payloads are composed out of delegates so
//! every kind carries exactly the state it needs. Links between records
//! are plain keys, never pointers; the owning container is always the
//! record page.

use crate::dewey::DeweyId;
use crate::varint;
use crate::{Error, NULL_NODE_KEY, RECORDS_PER_PAGE_EXP, Result};

pub type NodeKey = i64;

/// Type key of untyped content (the only type in scope).
pub const TYPE_KEY_UNTYPED: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Document,
    Element,
    Text,
    Attribute,
    Namespace,
    Comment,
    ProcessingInstruction,
    Path,
    Deleted,
}

impl NodeKind {
    pub fn tag(self) -> u8 {
        match self {
            NodeKind::Document => 1,
            NodeKind::Element => 2,
            NodeKind::Text => 3,
            NodeKind::Attribute => 4,
            NodeKind::Namespace => 5,
            NodeKind::Comment => 6,
            NodeKind::ProcessingInstruction => 7,
            NodeKind::Path => 8,
            NodeKind::Deleted => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => NodeKind::Document,
            2 => NodeKind::Element,
            3 => NodeKind::Text,
            4 => NodeKind::Attribute,
            5 => NodeKind::Namespace,
            6 => NodeKind::Comment,
            7 => NodeKind::ProcessingInstruction,
            8 => NodeKind::Path,
            9 => NodeKind::Deleted,
            _ => return Err(Error::Corrupted("unknown record kind tag")),
        })
    }
}

/// Record page a key belongs to.
#[inline]
pub fn page_key(key: NodeKey) -> u64 {
    debug_assert!(key >= 0);
    (key as u64) >> RECORDS_PER_PAGE_EXP
}

/// Slot offset of a key inside its record page.
#[inline]
pub fn page_offset(key: NodeKey) -> u16 {
    debug_assert!(key >= 0);
    ((key as u64) & ((1 << RECORDS_PER_PAGE_EXP) - 1)) as u16
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDelegate {
    pub node_key: NodeKey,
    pub parent_key: NodeKey,
    pub type_key: i32,
    pub hash: u64,
    pub dewey: Option<DeweyId>,
}

impl NodeDelegate {
    pub fn new(node_key: NodeKey, parent_key: NodeKey) -> Self {
        Self {
            node_key,
            parent_key,
            type_key: TYPE_KEY_UNTYPED,
            hash: 0,
            dewey: None,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        varint::write_i64(out, self.node_key);
        varint::write_i64(out, self.parent_key);
        varint::write_i64(out, self.type_key as i64);
        out.extend_from_slice(&self.hash.to_le_bytes());
        match &self.dewey {
            Some(id) => {
                out.push(1);
                id.encode(out);
            }
            None => out.push(0),
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let node_key = varint::read_i64(buf, pos)?;
        let parent_key = varint::read_i64(buf, pos)?;
        let type_key = varint::read_i64(buf, pos)? as i32;
        if buf.len() < *pos + 8 {
            return Err(Error::Corrupted("truncated node delegate"));
        }
        let hash = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
        *pos += 8;
        let dewey = match buf.get(*pos) {
            Some(0) => {
                *pos += 1;
                None
            }
            Some(1) => {
                *pos += 1;
                Some(DeweyId::decode(buf, pos)?)
            }
            _ => return Err(Error::Corrupted("invalid order label flag")),
        };
        Ok(Self {
            node_key,
            parent_key,
            type_key,
            hash,
            dewey,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructNodeDelegate {
    pub first_child_key: NodeKey,
    pub left_sibling_key: NodeKey,
    pub right_sibling_key: NodeKey,
    pub child_count: u64,
    pub descendant_count: u64,
}

impl StructNodeDelegate {
    pub fn empty() -> Self {
        Self {
            first_child_key: NULL_NODE_KEY,
            left_sibling_key: NULL_NODE_KEY,
            right_sibling_key: NULL_NODE_KEY,
            child_count: 0,
            descendant_count: 0,
        }
    }

    pub fn leaf(left_sibling_key: NodeKey, right_sibling_key: NodeKey) -> Self {
        Self {
            first_child_key: NULL_NODE_KEY,
            left_sibling_key,
            right_sibling_key,
            child_count: 0,
            descendant_count: 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        varint::write_i64(out, self.first_child_key);
        varint::write_i64(out, self.left_sibling_key);
        varint::write_i64(out, self.right_sibling_key);
        varint::write_u64(out, self.child_count);
        varint::write_u64(out, self.descendant_count);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        Ok(Self {
            first_child_key: varint::read_i64(buf, pos)?,
            left_sibling_key: varint::read_i64(buf, pos)?,
            right_sibling_key: varint::read_i64(buf, pos)?,
            child_count: varint::read_u64(buf, pos)?,
            descendant_count: varint::read_u64(buf, pos)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameNodeDelegate {
    pub prefix_key: i32,
    pub local_name_key: i32,
    pub uri_key: i32,
    pub path_node_key: i64,
}

impl NameNodeDelegate {
    fn encode(&self, out: &mut Vec<u8>) {
        varint::write_i64(out, self.prefix_key as i64);
        varint::write_i64(out, self.local_name_key as i64);
        varint::write_i64(out, self.uri_key as i64);
        varint::write_i64(out, self.path_node_key);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        Ok(Self {
            prefix_key: varint::read_i64(buf, pos)? as i32,
            local_name_key: varint::read_i64(buf, pos)? as i32,
            uri_key: varint::read_i64(buf, pos)? as i32,
            path_node_key: varint::read_i64(buf, pos)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueNodeDelegate {
    pub value: Vec<u8>,
    pub compressed: bool,
}

impl ValueNodeDelegate {
    pub fn raw(value: Vec<u8>) -> Self {
        Self {
            value,
            compressed: false,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.compressed as u8);
        varint::write_u64(out, self.value.len() as u64);
        out.extend_from_slice(&self.value);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let compressed = match buf.get(*pos) {
            Some(0) => false,
            Some(1) => true,
            _ => return Err(Error::Corrupted("invalid value compression flag")),
        };
        *pos += 1;
        let len = varint::read_u64(buf, pos)? as usize;
        if buf.len() < *pos + len {
            return Err(Error::Corrupted("truncated value payload"));
        }
        let value = buf[*pos..*pos + len].to_vec();
        *pos += len;
        Ok(Self { value, compressed })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentNode {
    pub del: NodeDelegate,
    pub structure: StructNodeDelegate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub del: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub name: NameNodeDelegate,
    pub attribute_keys: Vec<NodeKey>,
    pub namespace_keys: Vec<NodeKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextNode {
    pub del: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub value: ValueNodeDelegate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeNode {
    pub del: NodeDelegate,
    pub name: NameNodeDelegate,
    pub value: ValueNodeDelegate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceNode {
    pub del: NodeDelegate,
    pub name: NameNodeDelegate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub del: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub value: ValueNodeDelegate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PiNode {
    pub del: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub name: NameNodeDelegate,
    pub value: ValueNodeDelegate,
}

/// Entry of the path-summary tree: one distinct root-to-node label path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathNode {
    pub del: NodeDelegate,
    pub structure: StructNodeDelegate,
    /// Kind of the records sharing this path.
    pub referenced_kind: NodeKind,
    pub prefix_key: i32,
    pub local_name_key: i32,
    pub uri_key: i32,
    pub references: u64,
    pub level: u32,
}

/// Tombstone keeping key and parent so versioned reconstruction can stop
/// falling through to older revisions.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedNode {
    pub del: NodeDelegate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Document(DocumentNode),
    Element(ElementNode),
    Text(TextNode),
    Attribute(AttributeNode),
    Namespace(NamespaceNode),
    Comment(CommentNode),
    ProcessingInstruction(PiNode),
    Path(PathNode),
    Deleted(DeletedNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Document(_) => NodeKind::Document,
            Node::Element(_) => NodeKind::Element,
            Node::Text(_) => NodeKind::Text,
            Node::Attribute(_) => NodeKind::Attribute,
            Node::Namespace(_) => NodeKind::Namespace,
            Node::Comment(_) => NodeKind::Comment,
            Node::ProcessingInstruction(_) => NodeKind::ProcessingInstruction,
            Node::Path(_) => NodeKind::Path,
            Node::Deleted(_) => NodeKind::Deleted,
        }
    }

    pub fn delegate(&self) -> &NodeDelegate {
        match self {
            Node::Document(n) => &n.del,
            Node::Element(n) => &n.del,
            Node::Text(n) => &n.del,
            Node::Attribute(n) => &n.del,
            Node::Namespace(n) => &n.del,
            Node::Comment(n) => &n.del,
            Node::ProcessingInstruction(n) => &n.del,
            Node::Path(n) => &n.del,
            Node::Deleted(n) => &n.del,
        }
    }

    pub fn delegate_mut(&mut self) -> &mut NodeDelegate {
        match self {
            Node::Document(n) => &mut n.del,
            Node::Element(n) => &mut n.del,
            Node::Text(n) => &mut n.del,
            Node::Attribute(n) => &mut n.del,
            Node::Namespace(n) => &mut n.del,
            Node::Comment(n) => &mut n.del,
            Node::ProcessingInstruction(n) => &mut n.del,
            Node::Path(n) => &mut n.del,
            Node::Deleted(n) => &mut n.del,
        }
    }

    pub fn key(&self) -> NodeKey {
        self.delegate().node_key
    }

    pub fn parent_key(&self) -> NodeKey {
        self.delegate().parent_key
    }

    pub fn hash(&self) -> u64 {
        self.delegate().hash
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Node::Deleted(_))
    }

    /// Structural records take part in the sibling/child chains.
    pub fn structure(&self) -> Option<&StructNodeDelegate> {
        match self {
            Node::Document(n) => Some(&n.structure),
            Node::Element(n) => Some(&n.structure),
            Node::Text(n) => Some(&n.structure),
            Node::Comment(n) => Some(&n.structure),
            Node::ProcessingInstruction(n) => Some(&n.structure),
            Node::Path(n) => Some(&n.structure),
            _ => None,
        }
    }

    pub fn structure_mut(&mut self) -> Option<&mut StructNodeDelegate> {
        match self {
            Node::Document(n) => Some(&mut n.structure),
            Node::Element(n) => Some(&mut n.structure),
            Node::Text(n) => Some(&mut n.structure),
            Node::Comment(n) => Some(&mut n.structure),
            Node::ProcessingInstruction(n) => Some(&mut n.structure),
            Node::Path(n) => Some(&mut n.structure),
            _ => None,
        }
    }

    pub fn name_delegate(&self) -> Option<&NameNodeDelegate> {
        match self {
            Node::Element(n) => Some(&n.name),
            Node::Attribute(n) => Some(&n.name),
            Node::Namespace(n) => Some(&n.name),
            Node::ProcessingInstruction(n) => Some(&n.name),
            _ => None,
        }
    }

    pub fn name_delegate_mut(&mut self) -> Option<&mut NameNodeDelegate> {
        match self {
            Node::Element(n) => Some(&mut n.name),
            Node::Attribute(n) => Some(&mut n.name),
            Node::Namespace(n) => Some(&mut n.name),
            Node::ProcessingInstruction(n) => Some(&mut n.name),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Node::Text(n) => Some(&n.value.value),
            Node::Attribute(n) => Some(&n.value.value),
            Node::Comment(n) => Some(&n.value.value),
            Node::ProcessingInstruction(n) => Some(&n.value.value),
            _ => None,
        }
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        match self {
            Node::Text(n) => n.value.value = value,
            Node::Attribute(n) => n.value.value = value,
            Node::Comment(n) => n.value.value = value,
            Node::ProcessingInstruction(n) => n.value.value = value,
            _ => {}
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind().tag());
        match self {
            Node::Document(n) => {
                n.del.encode(out);
                n.structure.encode(out);
            }
            Node::Element(n) => {
                n.del.encode(out);
                n.structure.encode(out);
                n.name.encode(out);
                varint::write_u32(out, n.attribute_keys.len() as u32);
                for &k in &n.attribute_keys {
                    varint::write_i64(out, k);
                }
                varint::write_u32(out, n.namespace_keys.len() as u32);
                for &k in &n.namespace_keys {
                    varint::write_i64(out, k);
                }
            }
            Node::Text(n) => {
                n.del.encode(out);
                n.structure.encode(out);
                n.value.encode(out);
            }
            Node::Attribute(n) => {
                n.del.encode(out);
                n.name.encode(out);
                n.value.encode(out);
            }
            Node::Namespace(n) => {
                n.del.encode(out);
                n.name.encode(out);
            }
            Node::Comment(n) => {
                n.del.encode(out);
                n.structure.encode(out);
                n.value.encode(out);
            }
            Node::ProcessingInstruction(n) => {
                n.del.encode(out);
                n.structure.encode(out);
                n.name.encode(out);
                n.value.encode(out);
            }
            Node::Path(n) => {
                n.del.encode(out);
                n.structure.encode(out);
                out.push(n.referenced_kind.tag());
                varint::write_i64(out, n.prefix_key as i64);
                varint::write_i64(out, n.local_name_key as i64);
                varint::write_i64(out, n.uri_key as i64);
                varint::write_u64(out, n.references);
                varint::write_u32(out, n.level);
            }
            Node::Deleted(n) => {
                n.del.encode(out);
            }
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let tag = *buf
            .get(*pos)
            .ok_or(Error::Corrupted("truncated record"))?;
        *pos += 1;
        let kind = NodeKind::from_tag(tag)?;
        Ok(match kind {
            NodeKind::Document => Node::Document(DocumentNode {
                del: NodeDelegate::decode(buf, pos)?,
                structure: StructNodeDelegate::decode(buf, pos)?,
            }),
            NodeKind::Element => {
                let del = NodeDelegate::decode(buf, pos)?;
                let structure = StructNodeDelegate::decode(buf, pos)?;
                let name = NameNodeDelegate::decode(buf, pos)?;
                let attr_count = varint::read_u32(buf, pos)? as usize;
                let mut attribute_keys = Vec::with_capacity(attr_count);
                for _ in 0..attr_count {
                    attribute_keys.push(varint::read_i64(buf, pos)?);
                }
                let ns_count = varint::read_u32(buf, pos)? as usize;
                let mut namespace_keys = Vec::with_capacity(ns_count);
                for _ in 0..ns_count {
                    namespace_keys.push(varint::read_i64(buf, pos)?);
                }
                Node::Element(ElementNode {
                    del,
                    structure,
                    name,
                    attribute_keys,
                    namespace_keys,
                })
            }
            NodeKind::Text => Node::Text(TextNode {
                del: NodeDelegate::decode(buf, pos)?,
                structure: StructNodeDelegate::decode(buf, pos)?,
                value: ValueNodeDelegate::decode(buf, pos)?,
            }),
            NodeKind::Attribute => Node::Attribute(AttributeNode {
                del: NodeDelegate::decode(buf, pos)?,
                name: NameNodeDelegate::decode(buf, pos)?,
                value: ValueNodeDelegate::decode(buf, pos)?,
            }),
            NodeKind::Namespace => Node::Namespace(NamespaceNode {
                del: NodeDelegate::decode(buf, pos)?,
                name: NameNodeDelegate::decode(buf, pos)?,
            }),
            NodeKind::Comment => Node::Comment(CommentNode {
                del: NodeDelegate::decode(buf, pos)?,
                structure: StructNodeDelegate::decode(buf, pos)?,
                value: ValueNodeDelegate::decode(buf, pos)?,
            }),
            NodeKind::ProcessingInstruction => Node::ProcessingInstruction(PiNode {
                del: NodeDelegate::decode(buf, pos)?,
                structure: StructNodeDelegate::decode(buf, pos)?,
                name: NameNodeDelegate::decode(buf, pos)?,
                value: ValueNodeDelegate::decode(buf, pos)?,
            }),
            NodeKind::Path => {
                let del = NodeDelegate::decode(buf, pos)?;
                let structure = StructNodeDelegate::decode(buf, pos)?;
                let kind_tag = *buf
                    .get(*pos)
                    .ok_or(Error::Corrupted("truncated path record"))?;
                *pos += 1;
                Node::Path(PathNode {
                    del,
                    structure,
                    referenced_kind: NodeKind::from_tag(kind_tag)?,
                    prefix_key: varint::read_i64(buf, pos)? as i32,
                    local_name_key: varint::read_i64(buf, pos)? as i32,
                    uri_key: varint::read_i64(buf, pos)? as i32,
                    references: varint::read_u64(buf, pos)?,
                    level: varint::read_u32(buf, pos)?,
                })
            }
            NodeKind::Deleted => Node::Deleted(DeletedNode {
                del: NodeDelegate::decode(buf, pos)?,
            }),
        })
    }

    /// Tombstone replacing this record, keeping key and parent.
    pub fn tombstone(&self) -> Node {
        Node::Deleted(DeletedNode {
            del: NodeDelegate::new(self.key(), self.parent_key()),
        })
    }
}
