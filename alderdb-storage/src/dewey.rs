//! Hierarchical order labels.
//!
//! A label is a non-empty division list; lexicographic comparison of the
//! divisions (shorter prefix first) equals document order. Sibling
//! insertion never renumbers existing labels: there is always room between
//! two labels by either halving a gap or extending the left label with a
//! fresh level.
//!
//! Reserved first divisions below an element label: `0` for namespaces,
//! `1` for attributes. Child content starts at division 2, so attributes
//! and namespaces always sort before the element's children.

use crate::varint;
use crate::{Error, Result};

/// Spacing for freshly assigned divisions, leaving room for later
/// in-between inserts.
const STEP: u32 = 16;

/// Upper fence of the attribute area, used as the exclusive lower bound
/// when inserting before the first child.
const ATTR_CEILING: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeweyId {
    divisions: Vec<u32>,
}

impl DeweyId {
    pub fn document_root() -> Self {
        Self { divisions: vec![1] }
    }

    pub fn divisions(&self) -> &[u32] {
        &self.divisions
    }

    /// Label for the first child of `self` when no sibling exists yet.
    pub fn new_first_child(&self) -> Self {
        let mut divisions = self.divisions.clone();
        divisions.push(STEP);
        Self { divisions }
    }

    /// Label sorting directly after `self` on the same insertion axis.
    pub fn new_right_of(&self) -> Self {
        let mut divisions = self.divisions.clone();
        let last = divisions.last_mut().expect("labels are non-empty");
        match last.checked_add(STEP) {
            Some(v) => *last = v,
            None => divisions.push(STEP),
        }
        Self { divisions }
    }

    /// Label for the i-th attribute of the element labelled `self`.
    pub fn new_attribute(&self, i: usize) -> Self {
        let mut divisions = self.divisions.clone();
        divisions.push(1);
        divisions.push(STEP + STEP * i as u32);
        Self { divisions }
    }

    /// Label for the i-th namespace of the element labelled `self`.
    pub fn new_namespace(&self, i: usize) -> Self {
        let mut divisions = self.divisions.clone();
        divisions.push(0);
        divisions.push(STEP + STEP * i as u32);
        Self { divisions }
    }

    /// Label strictly between `left` and `right`, both children of
    /// `parent`; either bound may be absent at the boundary.
    pub fn new_between(left: Option<&DeweyId>, right: Option<&DeweyId>, parent: &DeweyId) -> Self {
        match (left, right) {
            (None, None) => parent.new_first_child(),
            (Some(l), None) => l.new_right_of(),
            (None, Some(r)) => {
                // The attribute area fences child labels from below.
                let mut floor = parent.divisions.clone();
                floor.push(1);
                floor.push(ATTR_CEILING);
                Self {
                    divisions: between(&floor, &r.divisions),
                }
            }
            (Some(l), Some(r)) => Self {
                divisions: between(&l.divisions, &r.divisions),
            },
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        varint::write_u32(out, self.divisions.len() as u32);
        for &d in &self.divisions {
            varint::write_u32(out, d);
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let len = varint::read_u32(buf, pos)? as usize;
        if len == 0 {
            return Err(Error::Corrupted("empty order label"));
        }
        let mut divisions = Vec::with_capacity(len);
        for _ in 0..len {
            divisions.push(varint::read_u32(buf, pos)?);
        }
        Ok(Self { divisions })
    }
}

/// A division list strictly between `l` and `r` (lexicographic, `l < r`).
///
/// Walks the common prefix; a gap of two or more at the first difference
/// is halved, an adjacent pair keeps the left digit and opens a fresh
/// level past `l`. Generated labels never end in a zero division, which
/// keeps the `(exhausted, 0)` descent below terminating.
fn between(l: &[u32], r: &[u32]) -> Vec<u32> {
    debug_assert!(l < r, "order label bounds inverted");
    let mut out = Vec::with_capacity(r.len() + 1);
    let mut i = 0;
    loop {
        match (l.get(i).copied(), r.get(i).copied()) {
            (Some(x), Some(y)) if x == y => {
                out.push(x);
                i += 1;
            }
            (Some(x), Some(y)) => {
                debug_assert!(x < y);
                if y - x >= 2 {
                    out.push(x + (y - x) / 2);
                    return out;
                }
                out.push(x);
                out.extend_from_slice(&l[i + 1..]);
                out.push(STEP);
                return out;
            }
            (None, Some(y)) => {
                if y >= 2 {
                    out.push(y / 2);
                    return out;
                }
                if y == 1 {
                    out.push(0);
                    out.push(STEP);
                    return out;
                }
                out.push(0);
                i += 1;
            }
            (_, None) => unreachable!("right bound must not be a prefix of the left"),
        }
    }
}
