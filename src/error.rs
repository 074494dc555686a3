//! Error kinds shared by the storage, connection, and server layers.

use crate::record::Oid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Load of an oid with no record.
    #[error("no record for oid {0}")]
    KeyNotFound(Oid),

    /// An object read this transaction is known to be stale; the
    /// transaction must be aborted before further reads.
    #[error("read conflict: {}", format_oids(.0))]
    ReadConflict(Vec<Oid>),

    /// The commit was rejected because another committer invalidated
    /// objects accessed this transaction.
    #[error("write conflict: {}", format_oids(.0))]
    WriteConflict(Vec<Oid>),

    /// Bad command code or framing on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Could not read the expected number of bytes.
    #[error("short read")]
    ShortRead,

    /// The storage file is malformed beyond what repair mode handles.
    #[error("corrupt storage: {0}")]
    Corrupt(String),

    /// Another process holds the exclusive write lock.
    #[error("storage file is locked by another process")]
    LockHeld,

    /// A serializer saw a reference to an object owned by a different
    /// connection.
    #[error("reference to an object owned by a different connection")]
    InvalidObjectReference,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the conflict kinds that unwind a transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ReadConflict(_) | Error::WriteConflict(_))
    }
}

fn format_oids(oids: &[Oid]) -> String {
    match oids.len() {
        0 => "oids=[]".to_string(),
        1 => format!("oids=[{}]", oids[0]),
        _ => format!("oids=[{} ...]", oids[0]),
    }
}
