//! Versioned page reconstruction across many committed revisions.

use alderdb_storage::page::UberPage;
use alderdb_storage::read_trx::PageReadTrx;
use alderdb_storage::record::{
    DocumentNode, Node, NodeDelegate, NodeKey, StructNodeDelegate, TextNode, ValueNodeDelegate,
};
use alderdb_storage::reference::TreeKind;
use alderdb_storage::resource::ResourceConfig;
use alderdb_storage::store::{FileReader, FileWriter, Reader};
use alderdb_storage::versioning::Versioning;
use alderdb_storage::write_trx::PageWriteTrx;
use alderdb_storage::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn document() -> Node {
    Node::Document(DocumentNode {
        del: NodeDelegate::new(DOCUMENT_NODE_KEY, NULL_NODE_KEY),
        structure: StructNodeDelegate::empty(),
    })
}

fn text(key: NodeKey, value: &str) -> Node {
    Node::Text(TextNode {
        del: NodeDelegate::new(key, DOCUMENT_NODE_KEY),
        structure: StructNodeDelegate::leaf(NULL_NODE_KEY, NULL_NODE_KEY),
        value: ValueNodeDelegate::raw(value.as_bytes().to_vec()),
    })
}

fn open_writer(dir: &Path, config: &ResourceConfig) -> PageWriteTrx {
    let writer = Box::new(FileWriter::open(dir).unwrap());
    let mut reader = Box::new(FileReader::open(dir).unwrap());
    let uber = match reader.read_uber_page_ref().unwrap().storage_key() {
        Some(key) => Arc::new(reader.read(key).unwrap().as_uber().unwrap().clone()),
        None => Arc::new(UberPage::new_bootstrap()),
    };
    PageWriteTrx::open(reader, writer, uber, config.clone()).unwrap()
}

fn open_reader(dir: &Path, revision: Option<u32>, config: &ResourceConfig) -> PageReadTrx {
    let mut reader = Box::new(FileReader::open(dir).unwrap());
    let key = reader
        .read_uber_page_ref()
        .unwrap()
        .storage_key()
        .expect("committed store");
    let uber = Arc::new(reader.read(key).unwrap().as_uber().unwrap().clone());
    PageReadTrx::open(reader, uber, revision, config.clone()).unwrap()
}

#[test]
fn incremental_reads_bind_to_their_revision() {
    let dir = tempdir().unwrap();
    let config = ResourceConfig {
        versioning: Versioning::Incremental,
        revs_to_restore: 4,
        ..ResourceConfig::default()
    };

    let mut trx = open_writer(dir.path(), &config);
    trx.create_entry(document(), TreeKind::Document).unwrap();
    let key = trx.allocate_key(TreeKind::Document);
    trx.create_entry(text(key, "v0"), TreeKind::Document).unwrap();
    trx.commit().unwrap();

    for i in 1..=10u32 {
        let mut node = trx.prepare(key, TreeKind::Document).unwrap();
        node.set_value(format!("v{i}").into_bytes());
        trx.put(node, TreeKind::Document).unwrap();
        trx.commit().unwrap();
    }
    trx.close().unwrap();

    for revision in [0u32, 3, 7, 10] {
        let mut rtx = open_reader(dir.path(), Some(revision), &config);
        let node = rtx.record(key, TreeKind::Document).unwrap().unwrap();
        assert_eq!(
            node.value(),
            Some(format!("v{revision}").as_bytes()),
            "revision {revision}"
        );
    }

    // A cold read of revision 7 walks the chain 7 -> 6 -> 5 -> 4 (full).
    let mut rtx = open_reader(dir.path(), Some(7), &config);
    let fragments = rtx.fragments(TreeKind::Document, 0).unwrap();
    assert_eq!(fragments.len(), 4);
    assert!(fragments.last().unwrap().1.as_record().unwrap().full);
}

#[test]
fn sliding_snapshot_window_stays_bounded() {
    let dir = tempdir().unwrap();
    let config = ResourceConfig {
        versioning: Versioning::SlidingSnapshot,
        revs_to_restore: 3,
        ..ResourceConfig::default()
    };

    let mut trx = open_writer(dir.path(), &config);
    trx.create_entry(document(), TreeKind::Document).unwrap();
    let mut keys = Vec::new();
    for i in 0..6u32 {
        let key = trx.allocate_key(TreeKind::Document);
        keys.push(key);
        trx.create_entry(text(key, &format!("slot{i}")), TreeKind::Document)
            .unwrap();
        trx.commit().unwrap();
    }
    trx.close().unwrap();

    let mut rtx = open_reader(dir.path(), None, &config);
    let fragments = rtx.fragments(TreeKind::Document, 0).unwrap();
    assert!(
        fragments.len() <= 3,
        "window must bound the chain, got {}",
        fragments.len()
    );
    // The carried-forward slots keep every record reachable.
    for (i, key) in keys.iter().enumerate() {
        let node = rtx.record(*key, TreeKind::Document).unwrap().unwrap();
        assert_eq!(node.value(), Some(format!("slot{i}").as_bytes()));
    }
}

#[test]
fn differential_chains_have_at_most_two_fragments() {
    let dir = tempdir().unwrap();
    let config = ResourceConfig {
        versioning: Versioning::Differential,
        revs_to_restore: 4,
        ..ResourceConfig::default()
    };

    let mut trx = open_writer(dir.path(), &config);
    trx.create_entry(document(), TreeKind::Document).unwrap();
    let key = trx.allocate_key(TreeKind::Document);
    trx.create_entry(text(key, "base"), TreeKind::Document)
        .unwrap();
    trx.commit().unwrap();

    for i in 1..=6u32 {
        let mut node = trx.prepare(key, TreeKind::Document).unwrap();
        node.set_value(format!("d{i}").into_bytes());
        trx.put(node, TreeKind::Document).unwrap();
        trx.commit().unwrap();
    }
    trx.close().unwrap();

    for revision in 0..=6u32 {
        let mut rtx = open_reader(dir.path(), Some(revision), &config);
        let fragments = rtx.fragments(TreeKind::Document, 0).unwrap();
        assert!(fragments.len() <= 2, "revision {revision}");
        let expected = if revision == 0 {
            "base".to_string()
        } else {
            format!("d{revision}")
        };
        let node = rtx.record(key, TreeKind::Document).unwrap().unwrap();
        assert_eq!(node.value(), Some(expected.as_bytes()));
    }
}
