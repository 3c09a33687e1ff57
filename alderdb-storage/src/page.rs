//! Page kinds and their wire format.
//!
//! Every page serialises as a single tag byte followed by kind-specific
//! fields. Indirect pages write their full fan-out array of references;
//! record pages write a varint slot count and a densely packed
//! `(offset, record)` map.

use crate::name::{NAME_KINDS, NameDict, NameKind};
use crate::record::{Node, NodeKey};
use crate::reference::{PageReference, TreeKind};
use crate::varint;
use crate::{Error, FANOUT, NULL_NODE_KEY, RECORDS_PER_PAGE, Result};
use std::collections::BTreeMap;

const TAG_UBER: u8 = 1;
const TAG_REVISION_ROOT: u8 = 2;
const TAG_INDIRECT: u8 = 3;
const TAG_NAME: u8 = 4;
const TAG_RECORD: u8 = 5;

#[derive(Debug, Clone)]
pub enum Page {
    Uber(UberPage),
    RevisionRoot(RevisionRootPage),
    Indirect(IndirectPage),
    Name(NamePage),
    Record(RecordPage),
}

impl Page {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        match self {
            Page::Uber(p) => {
                out.push(TAG_UBER);
                p.encode(&mut out);
            }
            Page::RevisionRoot(p) => {
                out.push(TAG_REVISION_ROOT);
                p.encode(&mut out);
            }
            Page::Indirect(p) => {
                out.push(TAG_INDIRECT);
                p.encode(&mut out);
            }
            Page::Name(p) => {
                out.push(TAG_NAME);
                p.encode(&mut out);
            }
            Page::Record(p) => {
                out.push(TAG_RECORD);
                p.encode(&mut out);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let tag = *buf.first().ok_or(Error::Corrupted("empty page"))?;
        let mut pos = 1;
        let page = match tag {
            TAG_UBER => Page::Uber(UberPage::decode(buf, &mut pos)?),
            TAG_REVISION_ROOT => Page::RevisionRoot(RevisionRootPage::decode(buf, &mut pos)?),
            TAG_INDIRECT => Page::Indirect(IndirectPage::decode(buf, &mut pos)?),
            TAG_NAME => Page::Name(NamePage::decode(buf, &mut pos)?),
            TAG_RECORD => Page::Record(RecordPage::decode(buf, &mut pos)?),
            _ => return Err(Error::Corrupted("unknown page tag")),
        };
        Ok(page)
    }

    pub fn as_indirect(&self) -> Result<&IndirectPage> {
        match self {
            Page::Indirect(p) => Ok(p),
            _ => Err(Error::Corrupted("expected an indirect page")),
        }
    }

    pub fn as_record(&self) -> Result<&RecordPage> {
        match self {
            Page::Record(p) => Ok(p),
            _ => Err(Error::Corrupted("expected a record page")),
        }
    }

    pub fn as_revision_root(&self) -> Result<&RevisionRootPage> {
        match self {
            Page::RevisionRoot(p) => Ok(p),
            _ => Err(Error::Corrupted("expected a revision root page")),
        }
    }

    pub fn as_name(&self) -> Result<&NamePage> {
        match self {
            Page::Name(p) => Ok(p),
            _ => Err(Error::Corrupted("expected a name page")),
        }
    }

    pub fn as_uber(&self) -> Result<&UberPage> {
        match self {
            Page::Uber(p) => Ok(p),
            _ => Err(Error::Corrupted("expected an uber page")),
        }
    }
}

/// The one persistent root, replaced atomically at commit.
#[derive(Debug, Clone)]
pub struct UberPage {
    pub revision_count: u32,
    pub bootstrap: bool,
    /// Indirect tree whose leaves are the committed revision root pages.
    pub tree_ref: PageReference,
}

impl UberPage {
    pub fn new_bootstrap() -> Self {
        Self {
            revision_count: 0,
            bootstrap: true,
            tree_ref: PageReference::empty(),
        }
    }

    /// Latest committed revision, if any.
    pub fn latest_revision(&self) -> Option<u32> {
        self.revision_count.checked_sub(1)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        varint::write_u32(out, self.revision_count);
        out.push(self.bootstrap as u8);
        self.tree_ref.encode(out);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let revision_count = varint::read_u32(buf, pos)?;
        let bootstrap = match buf.get(*pos) {
            Some(0) => false,
            Some(1) => true,
            _ => return Err(Error::Corrupted("invalid bootstrap flag")),
        };
        *pos += 1;
        Ok(Self {
            revision_count,
            bootstrap,
            tree_ref: PageReference::decode(buf, pos)?,
        })
    }
}

/// Per-revision root.
#[derive(Debug, Clone)]
pub struct RevisionRootPage {
    pub revision: u32,
    pub timestamp_ms: i64,
    pub max_node_key: NodeKey,
    pub max_path_node_key: NodeKey,
    pub document_ref: PageReference,
    pub path_summary_ref: PageReference,
    pub name_ref: PageReference,
}

impl RevisionRootPage {
    /// Root of a revision with nothing committed underneath yet.
    pub fn new_empty(revision: u32) -> Self {
        Self {
            revision,
            timestamp_ms: 0,
            max_node_key: NULL_NODE_KEY,
            max_path_node_key: NULL_NODE_KEY,
            document_ref: PageReference::empty(),
            path_summary_ref: PageReference::empty(),
            name_ref: PageReference::empty(),
        }
    }

    pub fn tree_ref(&self, tree: TreeKind) -> &PageReference {
        match tree {
            TreeKind::Document => &self.document_ref,
            TreeKind::PathSummary => &self.path_summary_ref,
        }
    }

    pub fn tree_ref_mut(&mut self, tree: TreeKind) -> &mut PageReference {
        match tree {
            TreeKind::Document => &mut self.document_ref,
            TreeKind::PathSummary => &mut self.path_summary_ref,
        }
    }

    pub fn max_key(&self, tree: TreeKind) -> NodeKey {
        match tree {
            TreeKind::Document => self.max_node_key,
            TreeKind::PathSummary => self.max_path_node_key,
        }
    }

    pub fn set_max_key(&mut self, tree: TreeKind, key: NodeKey) {
        match tree {
            TreeKind::Document => self.max_node_key = key,
            TreeKind::PathSummary => self.max_path_node_key = key,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        varint::write_u32(out, self.revision);
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        varint::write_i64(out, self.max_node_key);
        varint::write_i64(out, self.max_path_node_key);
        self.document_ref.encode(out);
        self.path_summary_ref.encode(out);
        self.name_ref.encode(out);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let revision = varint::read_u32(buf, pos)?;
        if buf.len() < *pos + 8 {
            return Err(Error::Corrupted("truncated revision root"));
        }
        let timestamp_ms = i64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
        *pos += 8;
        Ok(Self {
            revision,
            timestamp_ms,
            max_node_key: varint::read_i64(buf, pos)?,
            max_path_node_key: varint::read_i64(buf, pos)?,
            document_ref: PageReference::decode(buf, pos)?,
            path_summary_ref: PageReference::decode(buf, pos)?,
            name_ref: PageReference::decode(buf, pos)?,
        })
    }
}

/// Interior node of a page tree, fixed fan-out.
#[derive(Debug, Clone)]
pub struct IndirectPage {
    pub refs: Vec<PageReference>,
}

impl IndirectPage {
    pub fn new_empty() -> Self {
        Self {
            refs: vec![PageReference::empty(); FANOUT],
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        debug_assert_eq!(self.refs.len(), FANOUT);
        for r in &self.refs {
            r.encode(out);
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let mut refs = Vec::with_capacity(FANOUT);
        for _ in 0..FANOUT {
            refs.push(PageReference::decode(buf, pos)?);
        }
        Ok(Self { refs })
    }
}

/// The revision's name dictionaries, one partition per record kind.
#[derive(Debug, Clone, Default)]
pub struct NamePage {
    dicts: [NameDict; 4],
}

impl NamePage {
    pub fn create_name_key(&mut self, name: &str, kind: NameKind) -> i32 {
        self.dicts[kind.index()].create(name)
    }

    pub fn key_for(&self, name: &str, kind: NameKind) -> Option<i32> {
        self.dicts[kind.index()].key_for(name)
    }

    pub fn name(&self, key: i32, kind: NameKind) -> Option<&str> {
        self.dicts[kind.index()].name(key)
    }

    pub fn count(&self, key: i32, kind: NameKind) -> u32 {
        self.dicts[kind.index()].count(key)
    }

    pub fn remove_name(&mut self, key: i32, kind: NameKind) {
        self.dicts[kind.index()].remove(key);
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for kind in NAME_KINDS {
            self.dicts[kind.index()].encode(out);
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let mut page = NamePage::default();
        for kind in NAME_KINDS {
            page.dicts[kind.index()] = NameDict::decode(buf, pos)?;
        }
        Ok(page)
    }
}

/// Leaf of the indirect page tree: up to `RECORDS_PER_PAGE` records.
///
/// A record page is one *fragment* of the page's history: `previous`
/// chains to the next-older fragment and `full` marks a complete
/// snapshot that terminates reconstruction.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub tree: TreeKind,
    pub page_key: u64,
    pub revision: u32,
    pub full: bool,
    pub previous: Option<u64>,
    pub slots: BTreeMap<u16, Node>,
}

impl RecordPage {
    pub fn new(tree: TreeKind, page_key: u64, revision: u32) -> Self {
        Self {
            tree,
            page_key,
            revision,
            full: false,
            previous: None,
            slots: BTreeMap::new(),
        }
    }

    pub fn get(&self, offset: u16) -> Option<&Node> {
        debug_assert!((offset as usize) < RECORDS_PER_PAGE);
        self.slots.get(&offset)
    }

    pub fn set(&mut self, offset: u16, node: Node) {
        debug_assert!((offset as usize) < RECORDS_PER_PAGE);
        self.slots.insert(offset, node);
    }

    /// Records that are neither absent nor tombstoned.
    pub fn live(&self) -> impl Iterator<Item = (&u16, &Node)> {
        self.slots.iter().filter(|(_, n)| !n.is_deleted())
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tree.tag());
        varint::write_u64(out, self.page_key);
        varint::write_u32(out, self.revision);
        out.push(self.full as u8);
        varint::write_u64(out, self.previous.unwrap_or(0));
        varint::write_u64(out, self.slots.len() as u64);
        for (offset, node) in &self.slots {
            varint::write_u64(out, u64::from(*offset));
            node.encode(out);
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let tree_tag = *buf
            .get(*pos)
            .ok_or(Error::Corrupted("truncated record page"))?;
        *pos += 1;
        let tree = TreeKind::from_tag(tree_tag)?;
        let page_key = varint::read_u64(buf, pos)?;
        let revision = varint::read_u32(buf, pos)?;
        let full = match buf.get(*pos) {
            Some(0) => false,
            Some(1) => true,
            _ => return Err(Error::Corrupted("invalid full-dump flag")),
        };
        *pos += 1;
        let previous = match varint::read_u64(buf, pos)? {
            0 => None,
            k => Some(k),
        };
        let count = varint::read_u64(buf, pos)? as usize;
        if count > RECORDS_PER_PAGE {
            return Err(Error::Corrupted("record page slot count out of range"));
        }
        let mut slots = BTreeMap::new();
        for _ in 0..count {
            let offset = varint::read_u16(buf, pos)?;
            if offset as usize >= RECORDS_PER_PAGE {
                return Err(Error::Corrupted("record slot offset out of range"));
            }
            let node = Node::decode(buf, pos)?;
            slots.insert(offset, node);
        }
        Ok(Self {
            tree,
            page_key,
            revision,
            full,
            previous,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NodeDelegate, StructNodeDelegate, TextNode, ValueNodeDelegate};

    fn text(key: NodeKey) -> Node {
        Node::Text(TextNode {
            del: NodeDelegate::new(key, 0),
            structure: StructNodeDelegate::leaf(NULL_NODE_KEY, NULL_NODE_KEY),
            value: ValueNodeDelegate::raw(format!("t{key}").into_bytes()),
        })
    }

    #[test]
    fn record_page_roundtrip() {
        let mut page = RecordPage::new(TreeKind::Document, 7, 3);
        page.previous = Some(4096);
        page.set(1, text(7 * 512 + 1));
        page.set(17, text(7 * 512 + 17));
        let bytes = Page::Record(page.clone()).encode();
        let back = Page::decode(&bytes).unwrap();
        let rp = back.as_record().unwrap();
        assert_eq!(rp.page_key, 7);
        assert_eq!(rp.revision, 3);
        assert_eq!(rp.previous, Some(4096));
        assert_eq!(rp.slots.len(), 2);
        assert_eq!(rp.get(17).unwrap().key(), 7 * 512 + 17);
    }

    #[test]
    fn revision_root_roundtrip() {
        let mut root = RevisionRootPage::new_empty(5);
        root.timestamp_ms = 1_700_000_000_000;
        root.max_node_key = 99;
        root.document_ref = PageReference::from_storage_key(64);
        let bytes = Page::RevisionRoot(root).encode();
        let back = Page::decode(&bytes).unwrap();
        let r = back.as_revision_root().unwrap();
        assert_eq!(r.revision, 5);
        assert_eq!(r.max_node_key, 99);
        assert_eq!(r.document_ref.storage_key(), Some(64));
        assert!(r.path_summary_ref.storage_key().is_none());
    }

    #[test]
    fn indirect_page_roundtrip_keeps_fanout() {
        let mut page = IndirectPage::new_empty();
        page.refs[0] = PageReference::from_storage_key(64);
        page.refs[127] = PageReference::from_storage_key(8192);
        let bytes = Page::Indirect(page).encode();
        let back = Page::decode(&bytes).unwrap();
        let ip = back.as_indirect().unwrap();
        assert_eq!(ip.refs.len(), FANOUT);
        assert_eq!(ip.refs[0].storage_key(), Some(64));
        assert_eq!(ip.refs[127].storage_key(), Some(8192));
        assert!(ip.refs[64].is_empty());
    }

    #[test]
    fn name_page_partitions_are_independent() {
        let mut page = NamePage::default();
        let e = page.create_name_key("x", NameKind::Element);
        let a = page.create_name_key("x", NameKind::Attribute);
        assert_eq!(page.count(e, NameKind::Element), 1);
        assert_eq!(page.count(a, NameKind::Attribute), 1);
        assert_eq!(page.name(e, NameKind::Element), Some("x"));

        let bytes = Page::Name(page).encode();
        let back = Page::decode(&bytes).unwrap();
        let np = back.as_name().unwrap();
        assert_eq!(np.name(a, NameKind::Attribute), Some("x"));
    }
}
