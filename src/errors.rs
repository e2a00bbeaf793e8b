use thiserror::Error;

/// Crate-wide error type. One variant per error kind named in the design's
/// error handling section; cheap to clone the message, not the backtrace.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("bad insert: {0}")]
    BadInsert(String),
    #[error("bad schema: {0}")]
    BadSchema(String),
    #[error("bad record: {0}")]
    BadRecord(String),
    #[error("partition migrated")]
    PartitionMigrated,
    #[error("query compile error: {0}")]
    QueryCompile(String),
    #[error("query runtime error: {0}")]
    QueryRuntime(String),
    #[error("timeout")]
    Timeout,
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::BadInsert(e.to_string())
    }
}
