use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file magic")]
    InvalidMagic,

    #[error("unsupported storage format {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("page checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("storage corrupted: {0}")]
    Corrupted(&'static str),

    #[error("versioning error: {0}")]
    Versioning(&'static str),

    #[error("node key {key} exceeds maximum addressable key {max}")]
    NodeKeyTooLarge { key: u64, max: u64 },

    #[error("record {0} not found")]
    RecordNotFound(i64),

    #[error("revision {0} does not exist")]
    RevisionNotFound(u32),

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("transaction has pending modifications, commit or abort first")]
    PendingModifications,

    #[error("resource is locked by another process")]
    ResourceLocked,

    #[error("resource {0} already exists")]
    ResourceExists(String),

    #[error("resource {0} not found")]
    ResourceNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
