//! Error types for cadenza-player
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use crate::engine::ErrorCode;
use crate::instance::protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cadenza-player
#[derive(Error, Debug)]
pub enum Error {
    /// Shared configuration/IO errors from cadenza-common
    #[error(transparent)]
    Common(#[from] cadenza_common::Error),

    /// A native engine call failed
    #[error("{operation} failed: {code}")]
    Engine {
        operation: &'static str,
        code: ErrorCode,
    },

    /// The engine shared library could not be loaded or lacks a symbol
    #[error("Failed to load engine library {path}: {source}")]
    EngineLibrary {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed or rejected instance protocol exchange
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Instance lock / mutex / server errors
    #[error("Instance error: {0}")]
    Instance(String),

    /// The player task has shut down
    #[error("Player is not running")]
    PlayerStopped,

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::Engine`] for a failed native call
    pub fn engine(operation: &'static str, code: ErrorCode) -> Self {
        Error::Engine { operation, code }
    }

    /// Engine error code carried by this error, if any
    pub fn engine_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Convenience Result type using cadenza-player Error
pub type Result<T> = std::result::Result<T, Error>;
