//! Error types for avbuffer.

use thiserror::Error;

/// Result type alias using avbuffer's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer and memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Backing storage could not be acquired.
    #[error("no memory: {0}")]
    NoMemory(String),

    /// A caller-supplied argument is out of range or missing.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Serialized data is malformed or inconsistent.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The operation is not possible for this object in its current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The operation is declared but not implemented.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
