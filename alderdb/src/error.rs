use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] alderdb_storage::Error),

    #[error("another write transaction is open on this resource")]
    WriterBusy,

    #[error("attribute with the same name and value already exists")]
    DuplicateAttribute,

    #[error("namespace with the same prefix already exists")]
    DuplicateNamespace,

    #[error("cannot move a subtree into one of its descendants")]
    MoveIntoDescendant,

    #[error("invalid move: {0}")]
    InvalidMove(&'static str),

    #[error("revision {0} does not exist")]
    InvalidRevision(u32),

    #[error("invalid content: {0}")]
    InvalidContent(&'static str),

    #[error("background commit failed, transaction must be aborted")]
    AutoCommitFailed,

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("record {0} not found")]
    NotFound(i64),

    #[error("{0}")]
    Usage(&'static str),
}

impl Error {
    /// Closed-transaction checks surface the same kind regardless of the
    /// layer that noticed.
    pub(crate) fn from_storage(e: alderdb_storage::Error) -> Self {
        match e {
            alderdb_storage::Error::TransactionClosed => Error::TransactionClosed,
            other => Error::Storage(other),
        }
    }
}
