//! Revision lifecycle: auto-commit, revision-bound reads, revert and
//! crash recovery.

use alderdb::{
    Database, Error, NodeKind, QName, ResourceConfig, Versioning, WriteOptions,
};
use std::io::Write as _;
use tempfile::tempdir;

#[test]
fn auto_commit_boundary_issues_one_intermediate_commit() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource("bulk", ResourceConfig::default()).unwrap();
    let resource = db.resource("bulk").unwrap();

    let mut wtx = resource
        .begin_write_with(WriteOptions {
            max_node_count: 100,
            max_time: None,
        })
        .unwrap();
    wtx.insert_element_as_first_child(&QName::new("root"))
        .unwrap();
    // 100 more inserts: crossing the bound at the 101st modification
    // triggers exactly one intermediate commit.
    for i in 0..100 {
        wtx.insert_element_as_right_sibling(&QName::new(format!("n{i}")))
            .unwrap();
    }
    wtx.close().unwrap();
    drop(wtx);

    let resource = db.resource("bulk").unwrap();
    assert_eq!(resource.latest_revision(), Some(1));
    let mut rtx = resource.begin_read().unwrap();
    assert_eq!(rtx.child_count().unwrap(), 101);
}

#[test]
fn readers_bind_to_their_revision() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    let config = ResourceConfig {
        versioning: Versioning::Incremental,
        revs_to_restore: 4,
        ..ResourceConfig::default()
    };
    db.create_resource("versions", config).unwrap();
    let resource = db.resource("versions").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("item"))
        .unwrap();
    let item = wtx.node_key().unwrap();
    wtx.insert_attribute(&QName::new("v"), "0", true).unwrap();
    wtx.commit().unwrap();

    for i in 1..=10u32 {
        assert!(wtx.move_to(item).unwrap().has_moved());
        wtx.insert_attribute(&QName::new("v"), &format!("{i}"), true)
            .unwrap();
        wtx.commit().unwrap();
    }
    wtx.close().unwrap();

    for revision in [1u32, 4, 7, 10, 11] {
        let expected = (revision - 1).min(10);
        let mut rtx = resource.begin_read_at(revision).unwrap();
        assert!(rtx.move_to(item).unwrap().has_moved());
        assert!(rtx.move_to_attribute(0).unwrap().has_moved());
        assert_eq!(rtx.value().unwrap(), format!("{expected}"), "rev {revision}");
    }

    // A concurrent reader keeps observing its bound revision.
    let mut old = resource.begin_read_at(3).unwrap();
    let mut wtx = resource.begin_write().unwrap();
    assert!(wtx.move_to(item).unwrap().has_moved());
    wtx.insert_attribute(&QName::new("v"), "fresh", true).unwrap();
    wtx.commit().unwrap();
    wtx.close().unwrap();
    assert!(old.move_to(item).unwrap().has_moved());
    assert!(old.move_to_attribute(0).unwrap().has_moved());
    assert_eq!(old.value().unwrap(), "2");
}

#[test]
fn single_writer_per_resource() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource("locked", ResourceConfig::default())
        .unwrap();
    let resource = db.resource("locked").unwrap();

    let wtx = resource.begin_write().unwrap();
    assert!(matches!(resource.begin_write(), Err(Error::WriterBusy)));
    drop(wtx);
    // Dropping the writer releases the claim.
    let wtx = resource.begin_write().unwrap();
    drop(wtx);
}

#[test]
fn revert_and_replay_reproduces_keys_and_hashes() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource("revert", ResourceConfig::default())
        .unwrap();
    let resource = db.resource("revert").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("a")).unwrap();
    wtx.commit().unwrap();

    wtx.insert_element_as_first_child(&QName::new("b")).unwrap();
    let b_key = wtx.node_key().unwrap();
    wtx.commit().unwrap();

    let reference = {
        let mut rtx = resource.begin_read_at(2).unwrap();
        assert!(rtx.move_to_document_root().unwrap().has_moved());
        (rtx.hash().unwrap(), rtx.max_node_key())
    };

    // Branch from revision 1 and replay the same edit.
    wtx.revert_to(1).unwrap();
    assert!(wtx.move_to_first_child().unwrap().has_moved());
    wtx.insert_element_as_first_child(&QName::new("b")).unwrap();
    assert_eq!(wtx.node_key().unwrap(), b_key);
    let committed = wtx.commit().unwrap();
    assert_eq!(committed, 3);
    wtx.close().unwrap();

    let mut rtx = resource.begin_read_at(3).unwrap();
    assert!(rtx.move_to_document_root().unwrap().has_moved());
    assert_eq!(rtx.hash().unwrap(), reference.0);
    assert_eq!(rtx.max_node_key(), reference.1);
}

#[test]
fn revert_to_missing_revision_fails() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource("norew", ResourceConfig::default()).unwrap();
    let resource = db.resource("norew").unwrap();
    let mut wtx = resource.begin_write().unwrap();
    assert!(matches!(
        wtx.revert_to(9),
        Err(Error::InvalidRevision(9))
    ));
    wtx.close().unwrap();
}

#[test]
fn interrupted_commit_is_discarded_on_reopen() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource("crash", ResourceConfig::default()).unwrap();

    let resource_dir = {
        let resource = db.resource("crash").unwrap();
        let mut wtx = resource.begin_write().unwrap();
        wtx.insert_element_as_first_child(&QName::new("kept"))
            .unwrap();
        wtx.commit().unwrap();
        wtx.close().unwrap();
        alderdb::storage::resource::resource_dir(db.path(), "crash")
    };
    drop(db);

    // Simulate a crash mid-commit: garbage after the durable region and
    // a leftover commit marker.
    let data = alderdb::storage::store::data_file(&resource_dir);
    let durable = std::fs::metadata(&data).unwrap().len();
    let mut file = std::fs::OpenOptions::new().append(true).open(&data).unwrap();
    file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
    drop(file);
    std::fs::File::create(resource_dir.join("commit-2.tmp")).unwrap();

    let db = Database::open(resource_dir.parent().unwrap().parent().unwrap()).unwrap();
    let resource = db.resource("crash").unwrap();
    assert_eq!(resource.latest_revision(), Some(1));
    assert!(!resource_dir.join("commit-2.tmp").exists());
    assert_eq!(std::fs::metadata(&data).unwrap().len(), durable);

    let mut rtx = resource.begin_read().unwrap();
    assert!(rtx.move_to_first_child().unwrap().has_moved());
    assert_eq!(rtx.kind().unwrap(), NodeKind::Element);
    assert_eq!(rtx.name().unwrap().unwrap().local, "kept");
}

#[test]
fn pending_changes_block_close_but_abort_discards() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    db.create_resource("pending", ResourceConfig::default())
        .unwrap();
    let resource = db.resource("pending").unwrap();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::new("draft"))
        .unwrap();
    assert!(matches!(
        wtx.close(),
        Err(Error::Storage(
            alderdb::storage::Error::PendingModifications
        ))
    ));
    wtx.abort().unwrap();
    wtx.close().unwrap();

    let resource = db.resource("pending").unwrap();
    assert_eq!(resource.latest_revision(), Some(0));
    let mut rtx = resource.begin_read().unwrap();
    assert!(!rtx.move_to_first_child().unwrap().has_moved());
}
