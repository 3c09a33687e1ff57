//! Structural invariants: sibling chains, counts, removal semantics,
//! subtree moves and rolling-hash reversibility.

use alderdb::{Database, Error, NodeKind, NodeReadTrx, QName, ResourceConfig};
use tempfile::tempdir;

fn setup(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource(name, ResourceConfig::default()).unwrap();
    (dir, db)
}

/// Checks the doubly-linked sibling chain and the count invariants for
/// the children of the selected node, recursively.
fn assert_chain_invariants(rtx: &mut NodeReadTrx) {
    let parent_key = rtx.node_key().unwrap();
    let child_count = rtx.child_count().unwrap();
    let descendant_count = rtx.descendant_count().unwrap();

    let mut visited = 0u64;
    let mut descendants = 0u64;
    let mut previous = alderdb::NULL_NODE_KEY;
    if rtx.move_to_first_child().unwrap().has_moved() {
        loop {
            let me = rtx.node_key().unwrap();
            assert_eq!(rtx.parent_key().unwrap(), parent_key);
            let left = rtx
                .node()
                .structure()
                .expect("structural child")
                .left_sibling_key;
            assert_eq!(left, previous, "left link of {me}");
            visited += 1;
            descendants += rtx.descendant_count().unwrap() + 1;

            assert_chain_invariants(rtx);

            previous = me;
            if !rtx.move_to_right_sibling().unwrap().has_moved() {
                break;
            }
        }
        assert!(rtx.move_to_parent().unwrap().has_moved());
    }
    assert_eq!(visited, child_count, "child count of {parent_key}");
    assert_eq!(descendants, descendant_count, "descendants of {parent_key}");
}

fn build_small_tree(db: &Database, name: &str) -> (i64, i64, i64, i64) {
    let resource = db.resource(name).unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("a")).unwrap();
    let a = wtx.node_key().unwrap();
    wtx.insert_element_as_first_child(&QName::new("x")).unwrap();
    let x = wtx.node_key().unwrap();
    wtx.insert_element_as_right_sibling(&QName::new("y"))
        .unwrap();
    let y = wtx.node_key().unwrap();
    wtx.insert_element_as_right_sibling(&QName::new("z"))
        .unwrap();
    let z = wtx.node_key().unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();
    (a, x, y, z)
}

#[test]
fn invariants_hold_after_edits_and_reopen() {
    let (_dir, db) = setup("inv");
    build_small_tree(&db, "inv");
    let resource = db.resource("inv").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    wtx.insert_text_as_first_child("lead").unwrap();
    let _ = wtx.move_to_parent().unwrap();
    assert!(wtx.move_to_last_child().unwrap().has_moved());
    wtx.remove().unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    assert!(rtx.move_to_document_root().unwrap().has_moved());
    assert_chain_invariants(&mut rtx);
}

#[test]
fn remove_advances_right_then_left_then_parent() {
    let (_dir, db) = setup("rm");
    let (_a, x, y, z) = build_small_tree(&db, "rm");
    let resource = db.resource("rm").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    // Middle child: cursor lands on the right sibling.
    assert!(wtx.move_to(y).unwrap().has_moved());
    wtx.remove().unwrap();
    assert_eq!(wtx.node_key().unwrap(), z);
    // Last child: no right sibling, cursor lands on the left sibling.
    wtx.remove().unwrap();
    assert_eq!(wtx.node_key().unwrap(), x);
    // Only child: cursor climbs to the parent.
    wtx.remove().unwrap();
    assert_eq!(wtx.kind().unwrap(), NodeKind::Element);
    assert_eq!(wtx.child_count().unwrap(), 0);
    wtx.commit().unwrap();
    wtx.close().unwrap();
}

#[test]
fn removal_merges_exposed_text_siblings() {
    let (_dir, db) = setup("merge");
    let resource = db.resource("merge").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("p")).unwrap();
    wtx.insert_text_as_first_child("left").unwrap();
    wtx.insert_element_as_right_sibling(&QName::new("b"))
        .unwrap();
    let b = wtx.node_key().unwrap();
    wtx.insert_text_as_right_sibling("right").unwrap();
    assert!(wtx.move_to(b).unwrap().has_moved());
    wtx.remove().unwrap();

    // Cursor sits on the merged text node.
    assert_eq!(wtx.kind().unwrap(), NodeKind::Text);
    assert_eq!(wtx.value().unwrap(), "leftright");
    let _ = wtx.move_to_parent().unwrap();
    assert_eq!(wtx.child_count().unwrap(), 1);
    wtx.commit().unwrap();
    wtx.close().unwrap();
}

#[test]
fn insert_then_remove_restores_ancestor_hashes() {
    let (_dir, db) = setup("hashrev");
    let (a, _x, y, _z) = build_small_tree(&db, "hashrev");
    let resource = db.resource("hashrev").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    assert!(wtx.move_to_document_root().unwrap().has_moved());
    let doc_hash = wtx.hash().unwrap();
    assert!(wtx.move_to(a).unwrap().has_moved());
    let a_hash = wtx.hash().unwrap();

    assert!(wtx.move_to(y).unwrap().has_moved());
    wtx.insert_element_as_first_child(&QName::new("extra"))
        .unwrap();
    wtx.insert_text_as_first_child("payload").unwrap();
    let _ = wtx.move_to_parent().unwrap();
    assert!(wtx.move_to(a).unwrap().has_moved());
    assert_ne!(wtx.hash().unwrap(), a_hash);

    // Remove the inserted subtree again.
    assert!(wtx.move_to(y).unwrap().has_moved());
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    wtx.remove().unwrap();

    assert!(wtx.move_to(a).unwrap().has_moved());
    assert_eq!(wtx.hash().unwrap(), a_hash);
    assert!(wtx.move_to_document_root().unwrap().has_moved());
    assert_eq!(wtx.hash().unwrap(), doc_hash);
    wtx.commit().unwrap();
    wtx.close().unwrap();
}

#[test]
fn move_right_then_left_is_an_identity() {
    let (_dir, db) = setup("movident");
    let (a, x, y, z) = build_small_tree(&db, "movident");
    let resource = db.resource("movident").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    assert!(wtx.move_to(a).unwrap().has_moved());
    let a_hash = wtx.hash().unwrap();

    // x moves behind y, then back in front of it.
    assert!(wtx.move_to(y).unwrap().has_moved());
    wtx.move_subtree_to_right_sibling(x).unwrap();
    assert_eq!(wtx.node_key().unwrap(), x);
    assert!(wtx.move_to(y).unwrap().has_moved());
    wtx.move_subtree_to_left_sibling(x).unwrap();

    assert!(wtx.move_to(a).unwrap().has_moved());
    assert_eq!(wtx.hash().unwrap(), a_hash);
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    assert_eq!(wtx.node_key().unwrap(), x);
    assert!(wtx.move_to_right_sibling().unwrap().has_moved());
    assert_eq!(wtx.node_key().unwrap(), y);
    assert!(wtx.move_to_right_sibling().unwrap().has_moved());
    assert_eq!(wtx.node_key().unwrap(), z);
    wtx.abort().unwrap();
    wtx.close().unwrap();
}

#[test]
fn move_into_descendant_is_refused() {
    let (_dir, db) = setup("movedesc");
    let resource = db.resource("movedesc").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("a")).unwrap();
    let a = wtx.node_key().unwrap();
    wtx.insert_element_as_first_child(&QName::new("b")).unwrap();
    wtx.insert_element_as_first_child(&QName::new("c")).unwrap();
    let c = wtx.node_key().unwrap();
    wtx.commit().unwrap();

    let before = wtx.modification_count().unwrap();
    assert!(wtx.move_to(c).unwrap().has_moved());
    let err = wtx.move_subtree_to_first_child(a).unwrap_err();
    assert!(matches!(err, Error::MoveIntoDescendant));
    // Tree unchanged.
    assert!(wtx.move_to(a).unwrap().has_moved());
    assert_eq!(wtx.child_count().unwrap(), 1);
    assert_eq!(wtx.descendant_count().unwrap(), 2);
    assert_eq!(wtx.modification_count().unwrap(), before);
    wtx.close().unwrap();
}

#[test]
fn moving_non_structural_nodes_is_invalid() {
    let (_dir, db) = setup("moveinval");
    let resource = db.resource("moveinval").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("e")).unwrap();
    wtx.insert_attribute(&QName::new("k"), "v", true).unwrap();
    assert!(wtx.move_to_attribute(0).unwrap().has_moved());
    let attr = wtx.node_key().unwrap();
    let _ = wtx.move_to_parent().unwrap();

    let err = wtx.move_subtree_to_first_child(attr).unwrap_err();
    assert!(matches!(err, Error::InvalidMove(_)));
    wtx.abort().unwrap();
    wtx.close().unwrap();
}

#[test]
fn copy_subtree_preserves_shape_and_source() {
    let (_dir, db) = setup("copy");
    let resource = db.resource("copy").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("list"))
        .unwrap();
    let list = wtx.node_key().unwrap();
    wtx.insert_element_as_first_child(&QName::new("item"))
        .unwrap();
    wtx.insert_attribute(&QName::new("n"), "1", true).unwrap();
    wtx.insert_text_as_first_child("one").unwrap();
    wtx.commit().unwrap();

    // Copy the item next to itself, reading from the committed revision.
    let mut src = resource.begin_read().unwrap();
    assert!(src.move_to_first_child().unwrap().has_moved());
    assert!(src.move_to_first_child().unwrap().has_moved());

    assert!(wtx.move_to(list).unwrap().has_moved());
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    wtx.copy_subtree_as_right_sibling(&mut src).unwrap();
    let copy_key = wtx.node_key().unwrap();
    assert_eq!(wtx.name().unwrap().unwrap().local, "item");
    assert_eq!(wtx.attribute_count().unwrap(), 1);
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    assert_eq!(wtx.value().unwrap(), "one");
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    assert!(rtx.move_to(list).unwrap().has_moved());
    assert_eq!(rtx.child_count().unwrap(), 2);
    assert!(rtx.move_to(copy_key).unwrap().has_moved());
    assert!(rtx.move_to_left_sibling().unwrap().has_moved());
    assert_eq!(rtx.name().unwrap().unwrap().local, "item");
}

#[test]
fn replace_node_swaps_the_selected_subtree() {
    let (_dir, db) = setup("replace");
    let resource = db.resource("replace").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("root"))
        .unwrap();
    wtx.insert_element_as_first_child(&QName::new("old"))
        .unwrap();
    wtx.commit().unwrap();

    assert!(wtx.move_to_document_root().unwrap().has_moved());
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    wtx.replace_node(vec![
        alderdb::SubtreeEvent::StartElement {
            name: QName::new("new"),
            attributes: vec![(QName::new("v"), "2".to_string())],
            namespaces: vec![],
        },
        alderdb::SubtreeEvent::EndElement,
    ])
    .unwrap();
    assert_eq!(wtx.name().unwrap().unwrap().local, "new");
    let _ = wtx.move_to_parent().unwrap();
    assert_eq!(wtx.child_count().unwrap(), 1);
    wtx.commit().unwrap();
    wtx.close().unwrap();
}
