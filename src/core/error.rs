use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Transaction engine not initialized")]
    NotInitialized,

    #[error("An old transaction with the same id is still open: {0}")]
    TransactionStillOpen(u32),

    #[error("Transaction {0} was concurrently rolled back")]
    ConcurrentlyRolledBack(u32),

    #[error("Transaction corrupt: {0}")]
    TransactionCorrupt(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Map '{0}' not found")]
    MapNotFound(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/0 error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;


impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
