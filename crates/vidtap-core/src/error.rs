//! Error types for vidtap

use thiserror::Error;

/// Main error type for vidtap operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shared memory error: {0}")]
    Shm(String),

    #[error("Shared memory layout mismatch: {0}")]
    HeaderValidation(String),

    #[error("X11 connection error: {0}")]
    X11Connection(String),

    #[error("X11 extension not available: {0}")]
    X11ExtensionMissing(String),

    #[error("Screen capture failed: {0}")]
    CaptureError(String),

    #[error("OpenGL error: {0}")]
    Gl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using vidtap's Error
pub type Result<T> = std::result::Result<T, Error>;
