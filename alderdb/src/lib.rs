//! # AlderDB
//!
//! An embedded, versioned tree store. Documents are trees of element,
//! text, attribute, namespace, comment and processing-instruction
//! records persisted as a sequence of immutable revisions: a commit
//! never rewrites a committed page, it installs a new uber page whose
//! indirect tree shares everything unchanged with the previous
//! revision. Readers bind to any committed revision and navigate the
//! tree as it existed then; one writer per resource evolves the next
//! revision.
//!
//! ```rust,no_run
//! use alderdb::{Database, QName, ResourceConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let db = Database::create("books.alder")?;
//!     db.create_resource("shelf", ResourceConfig::default())?;
//!
//!     let resource = db.resource("shelf")?;
//!     let mut wtx = resource.begin_write()?;
//!     wtx.move_to_document_root()?;
//!     wtx.insert_element_as_first_child(&QName::new("book"))?
//!         .insert_attribute(&QName::new("title"), "Alder", true)?;
//!     wtx.commit()?;
//!     wtx.close()?;
//!
//!     let mut rtx = resource.begin_read()?;
//!     assert!(rtx.move_to_first_child()?.has_moved());
//!     assert_eq!(rtx.name()?.unwrap().local, "book");
//!     Ok(())
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`Database`] — directory of resources, shared per path within the
//!   process.
//! - [`Resource`] — one versioned tree; opens read and write
//!   transactions and holds the on-disk lock.
//! - [`NodeReadTrx`] — cursor over one revision.
//! - [`NodeWriteTrx`] — the single writer: structural edits, rolling
//!   ancestor hashes, path-summary maintenance, auto-commit.
//!
//! Storage internals (pages, versioning policies, the page-level
//! transactions) live in the `alderdb-storage` crate, re-exported here
//! as [`storage`].

mod cursor;
mod error;
pub mod event;
mod hash;
pub mod hooks;
mod node_read_trx;
mod node_write_trx;
mod path_summary;
mod resource;

pub use crate::cursor::Move;
pub use crate::error::{Error, Result};
pub use crate::event::SubtreeEvent;
pub use crate::hash::{HASH_PRIME, content_hash};
pub use crate::hooks::{ChangeListener, ChangeType, CommitView, PostCommitHook, PreCommitHook};
pub use crate::node_read_trx::NodeReadTrx;
pub use crate::node_write_trx::{NodeWriteTrx, WriteOptions};
pub use crate::resource::{Database, Resource};

pub use alderdb_storage as storage;
pub use alderdb_storage::dewey::DeweyId;
pub use alderdb_storage::name::NameKind;
pub use alderdb_storage::record::{Node, NodeKey, NodeKind};
pub use alderdb_storage::resource::{HashKind, ResourceConfig};
pub use alderdb_storage::versioning::Versioning;
pub use alderdb_storage::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};

/// Qualified name of an element, attribute, namespace or processing
/// instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
    pub uri: Option<String>,
}

impl QName {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
            uri: None,
        }
    }

    pub fn prefixed(prefix: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            local: local.into(),
            uri: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.prefix {
            Some(p) => write!(f, "{p}:{}", self.local),
            None => write!(f, "{}", self.local),
        }
    }
}
