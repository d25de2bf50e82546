use thiserror::Error;

/// Error surface for the storage core.
///
/// This mirrors the taxonomy the engine is built around: `OutOfMemory` and
/// `Io` are fatal to the transaction in flight, the rest are ordinary
/// caller-visible failures that leave the snapshot untouched.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("database not found")]
    DatabaseNotFound,

    #[error("database file already exists")]
    DatabaseAlreadyExists,

    #[error("no snapshot has been committed yet")]
    NoSnapshot,

    #[error("table not found: {0}")]
    NoSuchTable(u64),

    #[error("row already exists: {0}")]
    KeyInUse(u64),

    #[error("row not found: {0}")]
    NotFound(u64),

    #[error("field {0} is not defined on this table")]
    UndefinedField(u16),

    #[error("field {field} has type '{actual}', expected '{expected}'")]
    WrongFieldType { field: u16, actual: char, expected: char },

    #[error("field handle is stale: table schema changed since the handle was obtained")]
    StaleField,

    #[error("logic error: {0}")]
    Logic(String),

    #[error("corrupt on-disk header: {0}")]
    CorruptHeader(String),
}

pub type DbResult<T> = Result<T, DbError>;
