//! End-to-end editing over a fresh resource: first element, text
//! merging, attribute and namespace semantics, content validation.

use alderdb::{Database, Error, NodeKind, QName, ResourceConfig};
use tempfile::tempdir;

fn setup(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource(name, ResourceConfig::default()).unwrap();
    (dir, db)
}

#[test]
fn empty_resource_to_single_element() {
    let (_dir, db) = setup("shelf");
    let resource = db.resource("shelf").unwrap();
    assert_eq!(resource.latest_revision(), Some(0));

    let mut wtx = resource.begin_write().unwrap();
    assert!(wtx.move_to_document_root().unwrap().has_moved());
    wtx.insert_element_as_first_child(&QName::new("a")).unwrap();
    let committed = wtx.commit().unwrap();
    assert_eq!(committed, 1);
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    assert_eq!(rtx.revision(), 1);
    assert_eq!(rtx.max_node_key(), 1);
    assert!(rtx.move_to_first_child().unwrap().has_moved());
    assert_eq!(rtx.kind().unwrap(), NodeKind::Element);
    assert_eq!(rtx.name().unwrap().unwrap().local, "a");
}

#[test]
fn adjacent_text_inserts_merge() {
    let (_dir, db) = setup("texts");
    let resource = db.resource("texts").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("p")).unwrap();
    wtx.insert_text_as_first_child("hello").unwrap();
    // The cursor sits on the text node; the sibling insert merges.
    wtx.insert_text_as_right_sibling(" world").unwrap();
    assert_eq!(wtx.value().unwrap(), "hello world");
    let text_key = wtx.node_key().unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    assert!(rtx.move_to(text_key).unwrap().has_moved());
    assert_eq!(rtx.value().unwrap(), "hello world");
    let _ = rtx.move_to_parent().unwrap();
    assert_eq!(rtx.child_count().unwrap(), 1);
}

#[test]
fn duplicate_attribute_updates_then_rejects() {
    let (_dir, db) = setup("attrs");
    let resource = db.resource("attrs").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("item"))
        .unwrap();
    wtx.insert_attribute(&QName::new("x"), "1", true).unwrap();
    assert_eq!(wtx.kind().unwrap(), NodeKind::Element);
    assert_eq!(wtx.attribute_count().unwrap(), 1);

    // Same name, different value: in-place update.
    wtx.insert_attribute(&QName::new("x"), "2", true).unwrap();
    assert_eq!(wtx.attribute_count().unwrap(), 1);
    assert!(wtx.move_to_attribute(0).unwrap().has_moved());
    assert_eq!(wtx.value().unwrap(), "2");
    let _ = wtx.move_to_parent().unwrap();

    // Same name and value: rejected, nothing changes.
    let err = wtx
        .insert_attribute(&QName::new("x"), "2", true)
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateAttribute));
    assert_eq!(wtx.attribute_count().unwrap(), 1);
    wtx.commit().unwrap();
    wtx.close().unwrap();
}

#[test]
fn duplicate_namespace_prefix_is_rejected() {
    let (_dir, db) = setup("ns");
    let resource = db.resource("ns").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("root"))
        .unwrap();
    wtx.insert_namespace(
        &QName::prefixed("svg", "").with_uri("http://www.w3.org/2000/svg"),
        true,
    )
    .unwrap();
    let err = wtx
        .insert_namespace(
            &QName::prefixed("svg", "").with_uri("urn:other"),
            true,
        )
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateNamespace));
    assert_eq!(wtx.namespace_count().unwrap(), 1);
    wtx.commit().unwrap();
    wtx.close().unwrap();
}

#[test]
fn comment_and_pi_content_is_validated() {
    let (_dir, db) = setup("content");
    let resource = db.resource("content").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("doc"))
        .unwrap();

    assert!(matches!(
        wtx.insert_comment_as_first_child("no -- allowed"),
        Err(Error::InvalidContent(_))
    ));
    wtx.insert_comment_as_first_child("fine").unwrap();
    assert_eq!(wtx.kind().unwrap(), NodeKind::Comment);

    assert!(matches!(
        wtx.insert_pi_as_right_sibling("target", "oops ?> data"),
        Err(Error::InvalidContent(_))
    ));
    wtx.insert_pi_as_right_sibling("style", "href=x").unwrap();
    assert_eq!(wtx.kind().unwrap(), NodeKind::ProcessingInstruction);
    assert_eq!(wtx.name().unwrap().unwrap().local, "style");
    assert_eq!(wtx.value().unwrap(), "href=x");

    wtx.commit().unwrap();
    wtx.close().unwrap();
}

#[test]
fn accessors_default_when_kind_lacks_the_attribute() {
    let (_dir, db) = setup("defaults");
    let resource = db.resource("defaults").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("e")).unwrap();
    wtx.insert_text_as_first_child("t").unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();

    let mut rtx = resource.begin_read().unwrap();
    // Text node: no name, no children.
    assert!(rtx.move_to_first_child().unwrap().has_moved());
    assert!(rtx.move_to_first_child().unwrap().has_moved());
    assert_eq!(rtx.kind().unwrap(), NodeKind::Text);
    assert!(rtx.name().unwrap().is_none());
    assert_eq!(rtx.child_count().unwrap(), 0);
    assert_eq!(rtx.path_node_key().unwrap(), -1);
    // Document root: no value.
    assert!(rtx.move_to_document_root().unwrap().has_moved());
    assert_eq!(rtx.value().unwrap(), "");
}

#[test]
fn closed_transaction_rejects_operations() {
    let (_dir, db) = setup("closing");
    let resource = db.resource("closing").unwrap();
    let mut rtx = resource.begin_read().unwrap();
    rtx.close();
    rtx.close(); // idempotent
    assert!(matches!(
        rtx.move_to_document_root(),
        Err(Error::TransactionClosed)
    ));
    assert!(matches!(rtx.name(), Err(Error::TransactionClosed)));
}

#[test]
fn transient_items_live_on_negative_keys() {
    let (_dir, db) = setup("items");
    let resource = db.resource("items").unwrap();
    let mut rtx = resource.begin_read().unwrap();
    let key = rtx.register_item(b"atomic".to_vec());
    assert!(key < -1);
    assert!(rtx.move_to(key).unwrap().has_moved());
    assert_eq!(rtx.value().unwrap(), "atomic");
    // The null key never resolves.
    assert!(!rtx.move_to(-1).unwrap().has_moved());
}
