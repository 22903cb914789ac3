//! Error types for qail-ch.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Server error codes the retry policy treats as transient.
pub mod codes {
    pub const TIMEOUT_EXCEEDED: i32 = 159;
    pub const TOO_SLOW: i32 = 160;
    pub const TOO_MANY_SIMULTANEOUS_QUERIES: i32 = 202;
    pub const MEMORY_LIMIT_EXCEEDED: i32 = 241;
    pub const CANNOT_DECOMPRESS: i32 = 271;
}

/// ClickHouse driver error types.
#[derive(Debug, Error)]
pub enum ChError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

/// Dial, socket and timeout failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Dial {addr} failed: {message}")]
    Dial { addr: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Connection is closed")]
    Closed,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Malformed or unexpected bytes on the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unexpected packet {packet} while {context}")]
    UnexpectedPacket { packet: u64, context: &'static str },

    #[error("Column has empty name")]
    EmptyColumnName,

    #[error("Column {0} has empty type")]
    EmptyColumnType(String),

    #[error("Unsupported column type: {0}")]
    UnsupportedType(String),

    #[error("Unsupported compression method: {0:#04x}")]
    UnsupportedCompression(u8),

    #[error("Checksum mismatch in compressed block")]
    ChecksumMismatch,

    #[error("Invalid compressed block: {0}")]
    Decompress(String),

    #[error("Reader was released with {0} unread bytes")]
    UnreadData(usize),

    #[error("UUID requires 16 bytes, got {0}")]
    InvalidUuidLength(usize),

    #[error("Column {column} has {actual} rows, block has {expected}")]
    RowCountMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid value for column {column}: {message}")]
    InvalidValue { column: String, message: String },

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Server hello was already received")]
    DuplicateHello,
}

/// Exception sent by the server.
///
/// `nested` carries the cause chain exactly as the server reported it.
#[derive(Debug, Clone, Error)]
#[error("{name}: {message} ({code})")]
pub struct ServerError {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    #[source]
    pub nested: Option<Box<ServerError>>,
}

impl ServerError {
    /// Iterate this error followed by every nested cause.
    pub fn chain(&self) -> impl Iterator<Item = &ServerError> {
        std::iter::successors(Some(self), |err| err.nested.as_deref())
    }

    /// Number of nested causes below this error.
    pub fn depth(&self) -> usize {
        self.chain().count() - 1
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            codes::TIMEOUT_EXCEEDED
                | codes::TOO_SLOW
                | codes::TOO_MANY_SIMULTANEOUS_QUERIES
                | codes::MEMORY_LIMIT_EXCEEDED
                | codes::CANNOT_DECOMPRESS
        )
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Timed out waiting for connection ({0:?})")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid DSN: {0}")]
    InvalidDsn(String),

    #[error("Invalid scheme: {0}")]
    UnsupportedScheme(String),

    #[error("sslmode '{0}' is not supported")]
    UnsupportedSslMode(String),

    #[error("Invalid duration for {key}: {value}")]
    InvalidDuration { key: String, value: String },

    #[error("Invalid option: {0}")]
    Invalid(String),
}

impl From<io::Error> for ChError {
    fn from(err: io::Error) -> Self {
        ChError::Transport(TransportError::Io(err))
    }
}

impl ChError {
    /// Server error code, if the server rejected the request.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            ChError::Server(err) => Some(err.code),
            _ => None,
        }
    }

    /// The connection that produced this error must not be reused.
    pub fn is_bad_conn(&self) -> bool {
        matches!(
            self,
            ChError::Transport(_)
                | ChError::Protocol(_)
                | ChError::Cancelled
                | ChError::DeadlineExceeded
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ChError::Transport(TransportError::Timeout(_)) | ChError::DeadlineExceeded
        )
    }

    /// Whether the execution engine may retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChError::Transport(_) => true,
            ChError::Server(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for ClickHouse operations.
pub type ChResult<T> = Result<T, ChError>;
