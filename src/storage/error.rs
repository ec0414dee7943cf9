//! Storage layer error types
//!
//! Defines all errors that can occur in the storage and recovery layers.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, bad lengths, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Data file format error (wrong magic, unsupported version)
    #[error("Invalid data file: {0}")]
    InvalidFile(String),

    /// Replay unit with an unrecognized leading flag byte
    #[error("Unknown replay unit flag: {0:#04x}")]
    UnknownUnitFlag(u8),

    /// Writer misuse (chunk appended outside a group, sealed twice, ...)
    #[error("Writer state error: {0}")]
    WriterState(String),

    /// One or more files could not be recovered at engine startup
    #[error("Recovery failed for {failed} of {total} data files")]
    Recovery { failed: usize, total: usize },
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::UnknownUnitFlag(0x7f);
        assert_eq!(err.to_string(), "Unknown replay unit flag: 0x7f");

        let err = StorageError::Recovery { failed: 2, total: 5 };
        assert_eq!(err.to_string(), "Recovery failed for 2 of 5 data files");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
