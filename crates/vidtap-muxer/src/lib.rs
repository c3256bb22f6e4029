//! vidtap muxer - encoder packet interleaving and container output
//!
//! Encoders push [`PacketEnvelope`]s into per-stream queues; one worker
//! thread drains the queues in presentation-time order, rescales timestamps
//! into the container's time-base and hands the packets to a
//! [`ContainerWriter`]. The built-in writer produces fragmented MP4; anything
//! else can slot in behind the trait.

pub mod error;
pub mod fmp4;
pub mod muxer;
pub mod packet;
pub mod queue;
pub mod writer;

pub use error::{MuxerError, MuxerResult};
pub use fmp4::Fmp4Writer;
pub use muxer::{Encoder, MuxerCore};
pub use packet::PacketEnvelope;
pub use writer::{CodecKind, ContainerWriter, Rational, StreamParams};

use std::path::Path;

/// Resolve a container format name to a writer opened on `path`
///
/// The counterpart of a format-guessing call in a codec library: an unknown
/// name fails synchronously, before any thread is spawned or byte written.
pub fn open_container(
    format_name: &str,
    path: impl AsRef<Path>,
) -> MuxerResult<Box<dyn ContainerWriter + Send>> {
    match format_name {
        "mp4" | "mov" | "fmp4" => Ok(Box::new(Fmp4Writer::create(path)?)),
        other => Err(MuxerError::FormatNotFound(other.to_string())),
    }
}
