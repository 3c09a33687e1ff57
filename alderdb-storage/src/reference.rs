//! Page references and page-log keys.

use crate::page::Page;
use crate::varint;
use crate::{INDIRECT_LEVELS, Result};
use std::sync::Arc;

/// Record subtree a page or operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    Document,
    PathSummary,
}

impl TreeKind {
    pub fn tag(self) -> u8 {
        match self {
            TreeKind::Document => 0,
            TreeKind::PathSummary => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(TreeKind::Document),
            1 => Ok(TreeKind::PathSummary),
            _ => Err(crate::Error::Corrupted("unknown tree kind tag")),
        }
    }
}

pub const TREE_KINDS: [TreeKind; 2] = [TreeKind::Document, TreeKind::PathSummary];

/// Position of a cloned page inside the write-transaction page log.
///
/// `level` counts indirect levels from the root; `LEAF_LEVEL` marks
/// record pages, whose `offset` is then the record-page key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub tree: TreeKind,
    pub level: u8,
    pub offset: u64,
}

pub const LEAF_LEVEL: u8 = INDIRECT_LEVELS as u8;

/// Indirection site used everywhere a page points at another page.
///
/// A reference can be empty, persisted (`storage_key`), logged
/// (`log_key`), materialised (`page`), or several of those at once: a
/// logged page usually still carries the storage key of its previous
/// revision. Only the storage key is serialised; a reference flushed
/// inside a committed subtree always carries one.
#[derive(Debug, Clone, Default)]
pub struct PageReference {
    storage_key: Option<u64>,
    log_key: Option<LogKey>,
    page: Option<Arc<Page>>,
}

impl PageReference {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_storage_key(key: u64) -> Self {
        Self {
            storage_key: Some(key),
            log_key: None,
            page: None,
        }
    }

    #[inline]
    pub fn storage_key(&self) -> Option<u64> {
        self.storage_key
    }

    pub fn set_storage_key(&mut self, key: u64) {
        self.storage_key = Some(key);
    }

    #[inline]
    pub fn log_key(&self) -> Option<LogKey> {
        self.log_key
    }

    pub fn set_log_key(&mut self, key: LogKey) {
        self.log_key = Some(key);
    }

    pub fn clear_log_key(&mut self) {
        self.log_key = None;
    }

    pub fn page(&self) -> Option<&Arc<Page>> {
        self.page.as_ref()
    }

    pub fn set_page(&mut self, page: Arc<Page>) {
        self.page = Some(page);
    }

    pub fn take_page(&mut self) -> Option<Arc<Page>> {
        self.page.take()
    }

    pub fn is_empty(&self) -> bool {
        self.storage_key.is_none() && self.log_key.is_none() && self.page.is_none()
    }

    /// Storage key with `0` meaning absent; key 0 is the file header and
    /// never addresses a page.
    pub fn encode(&self, out: &mut Vec<u8>) {
        varint::write_u64(out, self.storage_key.unwrap_or(0));
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let raw = varint::read_u64(buf, pos)?;
        Ok(if raw == 0 {
            Self::empty()
        } else {
            Self::from_storage_key(raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reference_roundtrips_as_zero() {
        let mut buf = Vec::new();
        PageReference::empty().encode(&mut buf);
        assert_eq!(buf, vec![0]);
        let mut pos = 0;
        assert!(PageReference::decode(&buf, &mut pos).unwrap().is_empty());
    }

    #[test]
    fn log_key_is_transient() {
        let mut r = PageReference::from_storage_key(64);
        r.set_log_key(LogKey {
            tree: TreeKind::Document,
            level: LEAF_LEVEL,
            offset: 3,
        });
        let mut buf = Vec::new();
        r.encode(&mut buf);
        let mut pos = 0;
        let back = PageReference::decode(&buf, &mut pos).unwrap();
        assert_eq!(back.storage_key(), Some(64));
        assert!(back.log_key().is_none());
    }
}
