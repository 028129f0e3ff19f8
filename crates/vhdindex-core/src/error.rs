//! Error taxonomy shared by every `vhdindex-*` crate.

use thiserror::Error;

/// The error kinds a VHD-index core can produce.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying I/O failure (short read/write surfaces as `ShortIo` instead).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write returned fewer bytes than requested.
    #[error("short I/O: expected {expected} bytes, got {actual}")]
    ShortIo { expected: usize, actual: usize },

    /// Virtual sector past end, wrong block size, bad magic, malformed path, and
    /// similar failures that are never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored path field's declared length reached or exceeded its capacity.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// `file_id` not present in the file table, or a referenced file is missing.
    #[error("no such entity: {0}")]
    NoSuchEntity(String),

    /// The request, cache, or fd pool is fully committed; caller should retry later.
    #[error("resource busy, try again: {0}")]
    BusyExhaustion(String),

    /// Footer or header checksum validation failed (after legacy-compat fallbacks).
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// A file-table entry's stored uuid or mtime does not match the current file.
    #[error("uuid or timestamp mismatch: {0}")]
    UuidOrTimestampMismatch(String),

    /// Write attempted against the read-only indexed view.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed UTF-16 in a parent-locator name.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Resource already exists (e.g. index file, duplicate file-table path).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Escape hatch for contextual messages that don't fit another kind.
    #[error("{0}")]
    Custom(String),
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn name_too_long(msg: impl Into<String>) -> Self {
        Error::NameTooLong(msg.into())
    }

    pub fn no_such_entity(msg: impl Into<String>) -> Self {
        Error::NoSuchEntity(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Error::BusyExhaustion(msg.into())
    }

    pub fn checksum_mismatch(msg: impl Into<String>) -> Self {
        Error::ChecksumMismatch(msg.into())
    }

    pub fn uuid_or_timestamp_mismatch(msg: impl Into<String>) -> Self {
        Error::UuidOrTimestampMismatch(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Error::Encoding(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn custom(msg: impl Into<String>) -> Self {
        Error::Custom(msg.into())
    }

    pub fn short_io(expected: usize, actual: usize) -> Self {
        Error::ShortIo { expected, actual }
    }
}
