//! Frame representation for captured screen data

use std::sync::Arc;

/// Round a row of `width` BGRA pixels up to the 16-byte pack stride
pub fn stride_for_width(width: u32) -> u32 {
    (width * 4 + 15) & !15
}

/// A captured frame copied out of the shared-memory ring
///
/// Pixel data is BGRA with rows stored bottom-first, the native orientation
/// of the GL readback that produced it.
#[derive(Clone)]
pub struct Frame {
    /// Raw pixel data, `stride * height` bytes
    data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    /// Capture timestamp in monotonic microseconds
    pub timestamp: i64,
    /// Consumer-side sequence number
    pub sequence: u64,
}

impl Frame {
    /// Create a new frame from raw BGRA data
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp: i64, sequence: u64) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            stride: stride_for_width(width),
            timestamp,
            sequence,
        }
    }

    /// Get the raw pixel data as a slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get total size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if the frame holds at least `stride * height` bytes
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= (self.stride * self.height) as usize
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .field("size", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_16_byte_aligned() {
        assert_eq!(stride_for_width(4), 16);
        assert_eq!(stride_for_width(5), 32);
        assert_eq!(stride_for_width(640), 2560);
        assert_eq!(stride_for_width(641), 2576);
    }

    #[test]
    fn frame_validity() {
        let frame = Frame::new(vec![0u8; 16 * 4], 4, 4, 0, 0);
        assert!(frame.is_valid());

        let short = Frame::new(vec![0u8; 8], 4, 4, 0, 0);
        assert!(!short.is_valid());
    }
}
