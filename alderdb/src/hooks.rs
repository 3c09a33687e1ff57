//! Commit hooks and the change-listener seam for secondary indexes.

use crate::Result;
use alderdb_storage::record::Node;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Inserted,
    Removed,
    Updated,
}

/// Notified for every record mutation, inside the writer lock. Secondary
/// index maintenance attaches here.
pub trait ChangeListener: Send {
    fn on_change(&mut self, change: ChangeType, node: &Node, path_node_key: i64);
}

/// Read-only view of the committing transaction handed to hooks.
pub trait CommitView {
    /// Revision the commit will produce (pre) or has produced (post).
    fn revision(&self) -> u32;
    fn max_node_key(&self) -> i64;
}

/// Runs before the page commit; a failure aborts the commit atomically,
/// no uber page is installed.
pub trait PreCommitHook: Send {
    fn pre_commit(&mut self, view: &dyn CommitView) -> Result<()>;
}

/// Runs after the revision is published; a failure is reported to the
/// caller but the revision stays.
pub trait PostCommitHook: Send {
    fn post_commit(&mut self, view: &dyn CommitView) -> Result<()>;
}
