//! Error types for the cstor-chunked library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, ChunkedError>`.
//!
//! # Error Categories
//!
//! - **Untrusted input**: [`Format`], [`DigestMismatch`]. The blob, its
//!   manifest and its annotations come from a registry; any inconsistency is
//!   fatal and never retried.
//! - **Remote data**: [`RemoteFetch`]. A range that could not be fetched, a
//!   stream that closed early or delivered the wrong number of bytes.
//! - **Security boundary**: [`UnsafePath`]. Raised by the materializer when a
//!   path would resolve outside the destination root.
//! - **Platform**: [`Unsupported`].
//! - **Cache**: [`CacheCorrupt`]. Produced while reading a layer's cache file;
//!   the differ logs it and skips that layer instead of failing.
//! - **System errors**: [`Io`], [`JsonParse`], [`Config`].
//!
//! [`Format`]: ChunkedError::Format
//! [`DigestMismatch`]: ChunkedError::DigestMismatch
//! [`RemoteFetch`]: ChunkedError::RemoteFetch
//! [`UnsafePath`]: ChunkedError::UnsafePath
//! [`Unsupported`]: ChunkedError::Unsupported
//! [`CacheCorrupt`]: ChunkedError::CacheCorrupt
//! [`Io`]: ChunkedError::Io
//! [`JsonParse`]: ChunkedError::JsonParse
//! [`Config`]: ChunkedError::Config
//!
//! # Conversion Traits
//!
//! - `std::io::Error` → `ChunkedError::Io`
//! - `rustix::io::Errno` → `ChunkedError::Io`
//! - `serde_json::Error` → `ChunkedError::JsonParse`
//! - `toml::de::Error` → `ChunkedError::Config`

/// Result type alias for operations that may return a ChunkedError.
pub type Result<T> = std::result::Result<T, ChunkedError>;

/// Error types for chunked layer operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkedError {
    /// Malformed manifest, footer, tar stream or annotation.
    #[error("invalid chunked format: {0}")]
    Format(String),

    /// Content did not hash to the digest it was advertised with.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest recorded in the manifest or annotation.
        expected: String,
        /// Digest computed over the received bytes.
        actual: String,
    },

    /// A layer's cache file could not be decoded.
    #[error("corrupt cache file: {0}")]
    CacheCorrupt(String),

    /// Fetching a byte range from the blob source failed.
    #[error("fetching remote ranges: {0}")]
    RemoteFetch(String),

    /// A path would escape the destination root.
    #[error("unsafe path {path:?}: {reason}")]
    UnsafePath {
        /// The offending entry name or link target.
        path: String,
        /// What made it unsafe.
        reason: String,
    },

    /// The requested feature is not available on this platform.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// The requested layer is not known to the store.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// storage.conf could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl From<rustix::io::Errno> for ChunkedError {
    fn from(e: rustix::io::Errno) -> Self {
        ChunkedError::Io(e.into())
    }
}

impl ChunkedError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ChunkedError::Format(msg.into())
    }

    pub(crate) fn unsafe_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ChunkedError::UnsafePath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns the raw OS error if this wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ChunkedError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
