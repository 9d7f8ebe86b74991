//! Error types for mapkv
//!
//! Provides a unified error type for all operations.

use std::time::Duration;

use thiserror::Error;

use crate::codec::DecodeError;

/// Result type alias using MapKvError
pub type Result<T> = std::result::Result<T, MapKvError>;

/// Unified error type for mapkv operations
#[derive(Debug, Error)]
pub enum MapKvError {
    // -------------------------------------------------------------------------
    // Open Errors
    // -------------------------------------------------------------------------
    #[error("Open error: {0}")]
    Open(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mapping error: {0}")]
    Mapping(std::io::Error),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Log corruption detected: {0}")]
    Corruption(String),

    #[error("Log would grow to {requested} bytes (limit {limit})")]
    CapacityExceeded { requested: usize, limit: usize },

    // -------------------------------------------------------------------------
    // Lock Errors
    // -------------------------------------------------------------------------
    #[error("Timed out after {waited:?} waiting for {mode} file lock")]
    LockTimeout { mode: &'static str, waited: Duration },

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MapKvError {
    /// Errors after which the store handle must be reopened
    pub fn is_fatal(&self) -> bool {
        matches!(self, MapKvError::Io(_) | MapKvError::Mapping(_))
    }
}
