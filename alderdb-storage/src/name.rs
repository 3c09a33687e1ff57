//! Ref-counted name dictionaries, partitioned by record kind.
//!
//! Keys are FNV-1a/32 hashes of the string with linear probing on
//! collision, so a name maps to the same key in every revision. A removed
//! name keeps resolving within the revision that removed it; zero-count
//! entries are reclaimed when the dictionary is next serialised.

use crate::record::NodeKind;
use crate::varint;
use crate::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Element,
    Attribute,
    Namespace,
    ProcessingInstruction,
}

impl NameKind {
    pub fn for_node(kind: NodeKind) -> Option<NameKind> {
        match kind {
            NodeKind::Element => Some(NameKind::Element),
            NodeKind::Attribute => Some(NameKind::Attribute),
            NodeKind::Namespace => Some(NameKind::Namespace),
            NodeKind::ProcessingInstruction => Some(NameKind::ProcessingInstruction),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            NameKind::Element => 0,
            NameKind::Attribute => 1,
            NameKind::Namespace => 2,
            NameKind::ProcessingInstruction => 3,
        }
    }
}

pub const NAME_KINDS: [NameKind; 4] = [
    NameKind::Element,
    NameKind::Attribute,
    NameKind::Namespace,
    NameKind::ProcessingInstruction,
];

fn fnv1a32(s: &str) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as i32
}

#[derive(Debug, Clone, PartialEq)]
struct NameEntry {
    name: String,
    count: u32,
}

/// One dictionary partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameDict {
    entries: HashMap<i32, NameEntry>,
    by_name: HashMap<String, i32>,
}

impl NameDict {
    /// Looks up or inserts `name` and bumps its reference count.
    pub fn create(&mut self, name: &str) -> i32 {
        if let Some(&key) = self.by_name.get(name) {
            let entry = self.entries.get_mut(&key).expect("interned name present");
            entry.count += 1;
            return key;
        }
        let mut key = fnv1a32(name);
        while self.entries.contains_key(&key) {
            key = key.wrapping_add(1);
        }
        self.entries.insert(
            key,
            NameEntry {
                name: name.to_string(),
                count: 1,
            },
        );
        self.by_name.insert(name.to_string(), key);
        key
    }

    pub fn key_for(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, key: i32) -> Option<&str> {
        self.entries.get(&key).map(|e| e.name.as_str())
    }

    pub fn count(&self, key: i32) -> u32 {
        self.entries.get(&key).map(|e| e.count).unwrap_or(0)
    }

    /// Drops one reference. The string stays resolvable at count zero
    /// until the dictionary is serialised.
    pub fn remove(&mut self, key: i32) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let live: Vec<(&i32, &NameEntry)> =
            self.entries.iter().filter(|(_, e)| e.count > 0).collect();
        varint::write_u32(out, live.len() as u32);
        let mut sorted = live;
        sorted.sort_by_key(|(k, _)| **k);
        for (key, entry) in sorted {
            varint::write_i64(out, *key as i64);
            varint::write_u32(out, entry.count);
            let bytes = entry.name.as_bytes();
            varint::write_u64(out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let count = varint::read_u32(buf, pos)? as usize;
        let mut dict = NameDict::default();
        for _ in 0..count {
            let key = varint::read_i64(buf, pos)? as i32;
            let refs = varint::read_u32(buf, pos)?;
            let len = varint::read_u64(buf, pos)? as usize;
            if buf.len() < *pos + len {
                return Err(Error::Corrupted("truncated name entry"));
            }
            let name = std::str::from_utf8(&buf[*pos..*pos + len])
                .map_err(|_| Error::Corrupted("name entry is not utf-8"))?
                .to_string();
            *pos += len;
            dict.by_name.insert(name.clone(), key);
            dict.entries.insert(key, NameEntry { name, count: refs });
        }
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent_and_counts() {
        let mut dict = NameDict::default();
        let a = dict.create("chapter");
        let b = dict.create("chapter");
        assert_eq!(a, b);
        assert_eq!(dict.count(a), 2);
        assert_eq!(dict.name(a), Some("chapter"));
    }

    #[test]
    fn removed_name_resolves_until_serialised() {
        let mut dict = NameDict::default();
        let key = dict.create("once");
        dict.remove(key);
        assert_eq!(dict.count(key), 0);
        assert_eq!(dict.name(key), Some("once"));

        let mut buf = Vec::new();
        dict.encode(&mut buf);
        let mut pos = 0;
        let reloaded = NameDict::decode(&buf, &mut pos).unwrap();
        assert_eq!(reloaded.name(key), None);
    }

    #[test]
    fn distinct_names_get_distinct_keys() {
        let mut dict = NameDict::default();
        let a = dict.create("p");
        let b = dict.create("q");
        assert_ne!(a, b);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut dict = NameDict::default();
        dict.create("alpha");
        dict.create("beta");
        dict.create("alpha");
        let mut buf = Vec::new();
        dict.encode(&mut buf);
        let mut pos = 0;
        let reloaded = NameDict::decode(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        assert_eq!(reloaded.count(dict.key_for("alpha").unwrap()), 2);
        assert_eq!(reloaded.count(dict.key_for("beta").unwrap()), 1);
    }
}
