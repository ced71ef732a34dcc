//! Error types for MODI container operations

use thiserror::Error;

/// Result type alias for MODI operations
pub type Result<T> = std::result::Result<T, ModiError>;

/// Errors that can occur while opening or reading a MODI container
#[derive(Error, Debug)]
pub enum ModiError {
    /// Caller-side misuse: null, empty, or out-of-range inputs
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A second `open` was attempted on a Handle that is already open
    #[error("handle is already open")]
    AlreadyOpen,

    /// An operation requiring an open Handle was attempted before open
    #[error("handle is not open")]
    NotOpen,

    /// I/O error from the underlying source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Signature mismatch or structural violation in a fixed-layout header
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Invariant violation in a variable-length table (band table, mish block table)
    #[error("malformed table: {0}")]
    MalformedTable(String),

    /// A feature of the format is recognized but not supported by this build
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Decompression or compression codec failure
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// A numeric value or table index fell outside its valid range
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Allocation failure for a table, cache entry, or codec workspace
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The operation observed the Handle's abort flag
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid plist structure
    #[error("invalid plist: {0}")]
    InvalidPlist(String),
}

/// Errors raised by an individual codec (C3)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// The compressed stream is malformed or internally inconsistent
    #[error("malformed compressed data: {0}")]
    Data(String),

    /// The caller-provided output buffer is smaller than the decoded data
    #[error("output buffer too small: need at least {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The codec is recognized but not compiled into this build
    #[error("codec not available: {0}")]
    Unsupported(String),
}
