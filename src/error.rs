//! Error types for volume views and the stores behind them

use thiserror::Error;

/// Error reported by a volume store, with its native code and message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub code: i32,
    pub message: String,
}

impl StoreError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Main error type for VDS operations
#[derive(Error, Debug)]
pub enum VdsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Index out of range on axis {axis}: {begin}..{end} not within 0..{len}")]
    OutOfRange {
        axis: usize,
        begin: i64,
        end: i64,
        len: usize,
    },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Failed to open '{path}': {message} (code {code})")]
    StoreOpen {
        path: String,
        code: i32,
        message: String,
    },

    #[error("Subset read {begin:?}..{end:?} failed: {message} (code {code})")]
    Read {
        begin: Vec<usize>,
        end: Vec<usize>,
        code: i32,
        message: String,
    },

    #[error("Write of chunk {chunk} failed: {message} (code {code})")]
    Write {
        chunk: usize,
        code: i32,
        message: String,
    },

    #[error("Chunk {0} was already released")]
    DoubleRelease(usize),

    #[error("Accessor was not initialized for channel {0}")]
    AccessorNotInitialized(usize),

    #[error("Cannot create page {0}: page already exists")]
    PageExists(usize),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid VDS format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported VDS version: {0}")]
    UnsupportedVersion(u32),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl VdsError {
    /// Numeric code used when the error crosses the store boundary
    pub fn code(&self) -> i32 {
        match self {
            VdsError::Io(e) => e.raw_os_error().unwrap_or(-1),
            VdsError::NotFound(_) => 2,
            VdsError::PageExists(_) | VdsError::InvalidOperation(_) => 3,
            VdsError::InvalidFormat(_) | VdsError::UnsupportedVersion(_) => 4,
            VdsError::Compression(_) | VdsError::Decompression(_) => 5,
            VdsError::Serialization(_) | VdsError::Metadata(_) => 6,
            VdsError::InvalidUrl(_) | VdsError::Configuration(_) => 7,
            _ => -1,
        }
    }

    /// Convert into the code/message pair a store reports
    pub fn to_store_error(&self) -> StoreError {
        StoreError::new(self.code(), self.to_string())
    }
}

/// Specialized Result type for VDS operations
pub type Result<T> = std::result::Result<T, VdsError>;

impl From<bincode::Error> for VdsError {
    fn from(err: bincode::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdsError {
    fn from(err: serde_json::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}
