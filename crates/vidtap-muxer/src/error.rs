//! Muxer errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("Output format not found: {0}")]
    FormatNotFound(String),

    #[error("Can't open output file: {0}")]
    Open(std::io::Error),

    #[error("Can't write header: {0}")]
    WriteHeader(std::io::Error),

    #[error("Can't write packet: {0}")]
    WritePacket(std::io::Error),

    #[error("Can't write trailer: {0}")]
    WriteTrailer(std::io::Error),

    #[error("Invalid stream index {0}")]
    InvalidStream(usize),

    #[error("Stream setup error: {0}")]
    StreamSetup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for muxer operations
pub type MuxerResult<T> = Result<T, MuxerError>;
