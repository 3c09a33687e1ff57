//! Path-summary maintenance.
//!
//! A parallel tree of `Path` records mirrors the distinct root-to-node
//! label paths of the document. Every named record points at its path
//! node; the path node counts how many records do. Insertion walks from
//! the parent's path node and either bumps a matching child or creates
//! one; removal decrements and prunes zero-reference leaves, cascading
//! upwards.

use crate::{Error, Result};
use alderdb_storage::record::{Node, NodeDelegate, NodeKey, NodeKind, PathNode, StructNodeDelegate};
use alderdb_storage::reference::TreeKind;
use alderdb_storage::write_trx::PageWriteTrx;
use alderdb_storage::NULL_NODE_KEY;

pub(crate) const PATH_ROOT_KEY: NodeKey = 0;

const TREE: TreeKind = TreeKind::PathSummary;

fn storage(e: alderdb_storage::Error) -> Error {
    Error::from_storage(e)
}

fn path_fields(node: &Node) -> Result<&PathNode> {
    match node {
        Node::Path(p) => Ok(p),
        _ => Err(Error::Storage(alderdb_storage::Error::Corrupted(
            "path summary holds a non-path record",
        ))),
    }
}

/// Finds the child path of `parent_path_key` matching the name keys, or
/// creates it; bumps its reference count either way.
pub(crate) fn find_or_create(
    pages: &mut PageWriteTrx,
    parent_path_key: NodeKey,
    kind: NodeKind,
    prefix_key: i32,
    local_name_key: i32,
    uri_key: i32,
) -> Result<NodeKey> {
    let parent = pages
        .record(parent_path_key, TREE)
        .map_err(storage)?
        .ok_or(Error::Storage(alderdb_storage::Error::Corrupted(
            "path summary parent missing",
        )))?;
    let parent_level = path_fields(&parent)?.level;
    let mut child_key = path_fields(&parent)?.structure.first_child_key;

    while child_key != NULL_NODE_KEY {
        let child = pages
            .record(child_key, TREE)
            .map_err(storage)?
            .ok_or(Error::NotFound(child_key))?;
        let p = path_fields(&child)?;
        if p.referenced_kind == kind
            && p.local_name_key == local_name_key
            && p.prefix_key == prefix_key
            && p.uri_key == uri_key
        {
            let mut node = pages.prepare(child_key, TREE).map_err(storage)?;
            if let Node::Path(path) = &mut node {
                path.references += 1;
            }
            pages.put(node, TREE).map_err(storage)?;
            return Ok(child_key);
        }
        child_key = p.structure.right_sibling_key;
    }

    // No matching child: insert a new path node as first child.
    let key = pages.allocate_key(TREE);
    let old_first = path_fields(&parent)?.structure.first_child_key;
    let node = PathNode {
        del: NodeDelegate::new(key, parent_path_key),
        structure: StructNodeDelegate {
            first_child_key: NULL_NODE_KEY,
            left_sibling_key: NULL_NODE_KEY,
            right_sibling_key: old_first,
            child_count: 0,
            descendant_count: 0,
        },
        referenced_kind: kind,
        prefix_key,
        local_name_key,
        uri_key,
        references: 1,
        level: parent_level + 1,
    };
    pages.create_entry(Node::Path(node), TREE).map_err(storage)?;

    if old_first != NULL_NODE_KEY {
        let mut first = pages.prepare(old_first, TREE).map_err(storage)?;
        if let Some(s) = first.structure_mut() {
            s.left_sibling_key = key;
        }
        pages.put(first, TREE).map_err(storage)?;
    }
    let mut parent = pages.prepare(parent_path_key, TREE).map_err(storage)?;
    if let Some(s) = parent.structure_mut() {
        s.first_child_key = key;
        s.child_count += 1;
    }
    pages.put(parent, TREE).map_err(storage)?;
    adjust_descendant_counts(pages, parent_path_key, 1)?;

    Ok(key)
}

/// Root path node of the record's parent: the parent element's path, or
/// the summary root below the document root.
pub(crate) fn parent_path_key(parent: &Node) -> NodeKey {
    parent
        .name_delegate()
        .map(|n| n.path_node_key)
        .filter(|&k| k != NULL_NODE_KEY)
        .unwrap_or(PATH_ROOT_KEY)
}

/// Drops one reference from `path_key`; prunes zero-reference childless
/// path nodes and cascades the pruning towards the root.
pub(crate) fn release(pages: &mut PageWriteTrx, path_key: NodeKey) -> Result<()> {
    if path_key == NULL_NODE_KEY || path_key == PATH_ROOT_KEY {
        return Ok(());
    }
    let mut node = pages.prepare(path_key, TREE).map_err(storage)?;
    let (references, first_child, parent_key) = {
        let p = match &mut node {
            Node::Path(p) => p,
            _ => {
                return Err(Error::Storage(alderdb_storage::Error::Corrupted(
                    "path summary holds a non-path record",
                )));
            }
        };
        p.references = p.references.saturating_sub(1);
        (p.references, p.structure.first_child_key, p.del.parent_key)
    };
    pages.put(node, TREE).map_err(storage)?;

    if references == 0 && first_child == NULL_NODE_KEY {
        unlink(pages, path_key)?;
        // A pruned child may leave its parent both unreferenced and
        // childless; keep pruning towards the root.
        let mut key = parent_key;
        while key != NULL_NODE_KEY && key != PATH_ROOT_KEY {
            let node = match pages.record(key, TREE).map_err(storage)? {
                Some(n) => n,
                None => break,
            };
            let p = path_fields(&node)?;
            if p.references > 0 || p.structure.first_child_key != NULL_NODE_KEY {
                break;
            }
            let parent = p.del.parent_key;
            unlink(pages, key)?;
            key = parent;
        }
    }
    Ok(())
}

/// Detaches a path node from its parent chain and tombstones it.
fn unlink(pages: &mut PageWriteTrx, key: NodeKey) -> Result<()> {
    let node = pages
        .record(key, TREE)
        .map_err(storage)?
        .ok_or(Error::NotFound(key))?;
    let p = path_fields(&node)?;
    let (left, right, parent_key) = (
        p.structure.left_sibling_key,
        p.structure.right_sibling_key,
        p.del.parent_key,
    );

    if left != NULL_NODE_KEY {
        let mut l = pages.prepare(left, TREE).map_err(storage)?;
        if let Some(s) = l.structure_mut() {
            s.right_sibling_key = right;
        }
        pages.put(l, TREE).map_err(storage)?;
    }
    if right != NULL_NODE_KEY {
        let mut r = pages.prepare(right, TREE).map_err(storage)?;
        if let Some(s) = r.structure_mut() {
            s.left_sibling_key = left;
        }
        pages.put(r, TREE).map_err(storage)?;
    }
    let mut parent = pages.prepare(parent_key, TREE).map_err(storage)?;
    if let Some(s) = parent.structure_mut() {
        if s.first_child_key == key {
            s.first_child_key = right;
        }
        s.child_count = s.child_count.saturating_sub(1);
    }
    pages.put(parent, TREE).map_err(storage)?;
    adjust_descendant_counts(pages, parent_key, -1)?;

    pages.remove_entry(key, TREE).map_err(storage)?;
    Ok(())
}

fn adjust_descendant_counts(pages: &mut PageWriteTrx, start: NodeKey, delta: i64) -> Result<()> {
    let mut key = start;
    while key != NULL_NODE_KEY {
        let mut node = pages.prepare(key, TREE).map_err(storage)?;
        let parent = node.parent_key();
        if let Some(s) = node.structure_mut() {
            s.descendant_count = s.descendant_count.saturating_add_signed(delta);
        }
        pages.put(node, TREE).map_err(storage)?;
        key = parent;
    }
    Ok(())
}
