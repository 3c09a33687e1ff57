//! Path-summary reference counts, name-dictionary reclaim and
//! hierarchical order labels.

use alderdb::{
    Database, NameKind, Node, NodeKind, NodeReadTrx, QName, ResourceConfig,
};
use std::collections::HashMap;
use tempfile::tempdir;

fn setup(name: &str, config: ResourceConfig) -> (tempfile::TempDir, Database) {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource(name, config).unwrap();
    (dir, db)
}

/// Records per path node, gathered from the document tree.
fn count_path_references(rtx: &mut NodeReadTrx) -> HashMap<i64, u64> {
    let mut counts = HashMap::new();
    let mut stack = vec![0i64];
    while let Some(key) = stack.pop() {
        assert!(rtx.move_to(key).unwrap().has_moved());
        let path_key = rtx.path_node_key().unwrap();
        if path_key >= 0 && rtx.kind().unwrap() != NodeKind::Document {
            *counts.entry(path_key).or_default() += 1;
        }
        for i in 0..rtx.attribute_count().unwrap() {
            assert!(rtx.move_to_attribute(i).unwrap().has_moved());
            *counts.entry(rtx.path_node_key().unwrap()).or_default() += 1;
            assert!(rtx.move_to_parent().unwrap().has_moved());
        }
        for i in 0..rtx.namespace_count().unwrap() {
            assert!(rtx.move_to_namespace(i).unwrap().has_moved());
            *counts.entry(rtx.path_node_key().unwrap()).or_default() += 1;
            assert!(rtx.move_to_parent().unwrap().has_moved());
        }
        assert!(rtx.move_to(key).unwrap().has_moved());
        if rtx.move_to_first_child().unwrap().has_moved() {
            loop {
                stack.push(rtx.node_key().unwrap());
                if !rtx.move_to_right_sibling().unwrap().has_moved() {
                    break;
                }
            }
        }
    }
    counts
}

/// Reference counts stored in the path-summary tree, excluding its root.
fn stored_path_references(rtx: &mut NodeReadTrx) -> HashMap<i64, u64> {
    let mut counts = HashMap::new();
    let mut stack = vec![0i64];
    while let Some(key) = stack.pop() {
        let node = rtx.path_record(key).unwrap().expect("path node exists");
        let path = match &node {
            Node::Path(p) => p,
            other => panic!("unexpected record in path summary: {other:?}"),
        };
        if key != 0 {
            counts.insert(key, path.references);
        }
        let mut child = path.structure.first_child_key;
        while child != -1 {
            stack.push(child);
            let next = rtx.path_record(child).unwrap().expect("sibling exists");
            child = match &next {
                Node::Path(p) => p.structure.right_sibling_key,
                other => panic!("unexpected record in path summary: {other:?}"),
            };
        }
    }
    counts
}

#[test]
fn path_reference_counts_match_the_records() {
    let (_dir, db) = setup("paths", ResourceConfig::default());
    let resource = db.resource("paths").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    // Two <entry> elements sharing paths, one with a nested <entry>.
    wtx.insert_element_as_first_child(&QName::new("log")).unwrap();
    wtx.insert_element_as_first_child(&QName::new("entry"))
        .unwrap();
    wtx.insert_attribute(&QName::new("at"), "1", true).unwrap();
    wtx.insert_element_as_right_sibling(&QName::new("entry"))
        .unwrap();
    wtx.insert_attribute(&QName::new("at"), "2", true).unwrap();
    wtx.insert_element_as_first_child(&QName::new("entry"))
        .unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    let counted = count_path_references(&mut rtx);
    let stored = stored_path_references(&mut rtx);
    assert_eq!(counted, stored);
    // /log, /log/entry, /log/entry/@at, /log/entry/entry are distinct.
    assert_eq!(stored.len(), 4);
    assert!(stored.values().any(|&c| c == 2));
}

#[test]
fn removing_records_prunes_zero_reference_paths() {
    let (_dir, db) = setup("prune", ResourceConfig::default());
    let resource = db.resource("prune").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("a")).unwrap();
    wtx.insert_element_as_first_child(&QName::new("b")).unwrap();
    let b = wtx.node_key().unwrap();
    wtx.commit().unwrap();

    assert!(wtx.move_to(b).unwrap().has_moved());
    let b_path = wtx.path_node_key().unwrap();
    wtx.remove().unwrap();
    assert!(wtx.path_record(b_path).unwrap().is_none());
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    let counted = count_path_references(&mut rtx);
    let stored = stored_path_references(&mut rtx);
    assert_eq!(counted, stored);
    assert_eq!(stored.len(), 1);
}

#[test]
fn renaming_an_element_rewires_its_paths() {
    let (_dir, db) = setup("rename", ResourceConfig::default());
    let resource = db.resource("rename").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("a")).unwrap();
    wtx.insert_element_as_first_child(&QName::new("b")).unwrap();
    wtx.insert_attribute(&QName::new("k"), "v", true).unwrap();
    let old_path = wtx.path_node_key().unwrap();

    wtx.set_name(&QName::new("c")).unwrap();
    assert_eq!(wtx.name().unwrap().unwrap().local, "c");
    let new_path = wtx.path_node_key().unwrap();
    assert_ne!(old_path, new_path);
    // The old path node lost its last reference.
    assert!(wtx.path_record(old_path).unwrap().is_none());
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    let counted = count_path_references(&mut rtx);
    let stored = stored_path_references(&mut rtx);
    assert_eq!(counted, stored);
}

#[test]
fn name_dictionary_reclaims_after_last_reference() {
    let (_dir, db) = setup("names", ResourceConfig::default());
    let resource = db.resource("names").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("tmp")).unwrap();
    let first = wtx.node_key().unwrap();
    wtx.insert_element_as_right_sibling(&QName::new("tmp"))
        .unwrap();
    assert_eq!(wtx.name_count("tmp", NameKind::Element).unwrap(), 2);

    wtx.remove().unwrap();
    assert_eq!(wtx.name_count("tmp", NameKind::Element).unwrap(), 1);
    assert!(wtx.move_to(first).unwrap().has_moved());
    wtx.remove().unwrap();
    // Zero references, the string is reclaimable at the next commit.
    assert_eq!(wtx.name_count("tmp", NameKind::Element).unwrap(), 0);
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let rtx = resource.begin_read().unwrap();
    assert_eq!(rtx.name_count("tmp", NameKind::Element), 0);
}

#[test]
fn order_labels_follow_document_order() {
    let config = ResourceConfig {
        use_dewey_ids: true,
        ..ResourceConfig::default()
    };
    let (_dir, db) = setup("order", config);
    let resource = db.resource("order").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("root"))
        .unwrap();
    wtx.insert_attribute(&QName::new("a"), "1", true).unwrap();
    wtx.insert_element_as_first_child(&QName::new("mid")).unwrap();
    wtx.insert_text_as_first_child("inner").unwrap();
    let _ = wtx.move_to_parent().unwrap();
    // Left-of-first insert exercises the between logic.
    wtx.insert_element_as_left_sibling(&QName::new("first"))
        .unwrap();
    let _ = wtx.move_to_right_sibling().unwrap();
    wtx.insert_element_as_right_sibling(&QName::new("last"))
        .unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    let mut labels = Vec::new();
    collect_labels(&mut rtx, 0, &mut labels);
    for pair in labels.windows(2) {
        assert!(
            pair[0].1 < pair[1].1,
            "document order violated between {} and {}",
            pair[0].0,
            pair[1].0
        );
    }
}

fn collect_labels(rtx: &mut NodeReadTrx, key: i64, out: &mut Vec<(i64, alderdb::DeweyId)>) {
    assert!(rtx.move_to(key).unwrap().has_moved());
    let label = rtx
        .node()
        .delegate()
        .dewey
        .clone()
        .expect("order labels are enabled");
    out.push((key, label));

    for i in 0..rtx.namespace_count().unwrap() {
        assert!(rtx.move_to_namespace(i).unwrap().has_moved());
        let k = rtx.node_key().unwrap();
        let l = rtx.node().delegate().dewey.clone().unwrap();
        out.push((k, l));
        assert!(rtx.move_to_parent().unwrap().has_moved());
    }
    for i in 0..rtx.attribute_count().unwrap() {
        assert!(rtx.move_to_attribute(i).unwrap().has_moved());
        let k = rtx.node_key().unwrap();
        let l = rtx.node().delegate().dewey.clone().unwrap();
        out.push((k, l));
        assert!(rtx.move_to_parent().unwrap().has_moved());
    }

    let mut children = Vec::new();
    assert!(rtx.move_to(key).unwrap().has_moved());
    if rtx.move_to_first_child().unwrap().has_moved() {
        loop {
            children.push(rtx.node_key().unwrap());
            if !rtx.move_to_right_sibling().unwrap().has_moved() {
                break;
            }
        }
    }
    for child in children {
        collect_labels(rtx, child, out);
    }
}
