//! Record content hashing for the rolling ancestor hash.
//!
//! The stored hash of a node is `content + P * sum(child hashes)` in
//! wrapping arithmetic. Ancestors are maintained incrementally: when a
//! direct child's hash moves from `old` to `new`, the parent applies
//! `h' = h - old * P + new * P`, and the delta cascades upwards one
//! level at a time. The content part covers only what the node itself
//! says, never its links, so link surgery keeps subtree hashes stable.

use alderdb_storage::record::Node;
use sha2::{Digest, Sha256};

pub const HASH_PRIME: u64 = 77081;

/// Content hash of a single record, independent of its position.
pub fn content_hash(node: &Node) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update([node.kind().tag()]);
    hasher.update(node.key().to_le_bytes());
    if let Some(name) = node.name_delegate() {
        hasher.update(name.prefix_key.to_le_bytes());
        hasher.update(name.local_name_key.to_le_bytes());
        hasher.update(name.uri_key.to_le_bytes());
    }
    if let Some(value) = node.value() {
        hasher.update(value);
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is long enough"))
}

/// One rolling step: the direct child's hash moved from `old` to `new`.
#[inline]
pub fn rolling_step(parent_hash: u64, old_child: u64, new_child: u64) -> u64 {
    parent_hash
        .wrapping_sub(old_child.wrapping_mul(HASH_PRIME))
        .wrapping_add(new_child.wrapping_mul(HASH_PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alderdb_storage::record::{
        NodeDelegate, StructNodeDelegate, TextNode, ValueNodeDelegate,
    };
    use alderdb_storage::NULL_NODE_KEY;

    fn text(key: i64, value: &str) -> Node {
        Node::Text(TextNode {
            del: NodeDelegate::new(key, 0),
            structure: StructNodeDelegate::leaf(NULL_NODE_KEY, NULL_NODE_KEY),
            value: ValueNodeDelegate::raw(value.as_bytes().to_vec()),
        })
    }

    #[test]
    fn content_hash_is_stable_and_value_sensitive() {
        let a = text(1, "x");
        assert_eq!(content_hash(&a), content_hash(&a.clone()));
        assert_ne!(content_hash(&a), content_hash(&text(1, "y")));
        assert_ne!(content_hash(&a), content_hash(&text(2, "x")));
    }

    #[test]
    fn rolling_step_is_invertible() {
        let base = 0xfeed_f00d_dead_beef;
        let child = content_hash(&text(3, "payload"));
        let with_child = rolling_step(base, 0, child);
        assert_eq!(rolling_step(with_child, child, 0), base);
    }
}
