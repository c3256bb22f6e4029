//! Capture configuration

use serde::{Deserialize, Serialize};

/// Hotkey the consumer asks the grabber side to watch for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotkeyBinding {
    /// X11 keycode
    pub keycode: u32,
    /// X11 modifier mask
    pub modifiers: u32,
}

/// Configuration for a capture session
///
/// The consumer creates the shared-memory ring from these values; the grabber
/// reads them back out of the shared header after attaching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Number of slots in the frame ring
    pub ring_size: u32,
    /// Upper bound on a single frame's byte length (stride * height)
    pub max_frame_bytes: u32,
    /// Target frame rate, 0 = unthrottled
    pub target_fps: u32,
    /// Throttle (sleep) instead of dropping frames to hit the target rate
    pub limit_fps: bool,
    /// Read the front buffer instead of the back buffer
    pub capture_front: bool,
    /// Composite the cursor into captured frames
    pub record_cursor: bool,
    /// Hotkey the grabber side should report, if any
    pub hotkey: Option<HotkeyBinding>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ring_size: 5,
            // 1920x1080 BGRA with the 16-byte stride fits comfortably
            max_frame_bytes: 16 * 1024 * 1024,
            target_fps: 30,
            limit_fps: false,
            capture_front: false,
            record_cursor: true,
            hotkey: None,
        }
    }
}

impl CaptureConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set ring size
    pub fn with_ring_size(mut self, ring_size: u32) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Builder pattern: set the per-frame byte bound
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Builder pattern: set target frame rate
    pub fn with_target_fps(mut self, target_fps: u32) -> Self {
        self.target_fps = target_fps;
        self
    }

    /// Builder pattern: throttle instead of dropping
    pub fn with_limit_fps(mut self, limit_fps: bool) -> Self {
        self.limit_fps = limit_fps;
        self
    }

    /// Builder pattern: capture the front buffer
    pub fn with_capture_front(mut self, capture_front: bool) -> Self {
        self.capture_front = capture_front;
        self
    }

    /// Builder pattern: record the cursor
    pub fn with_record_cursor(mut self, record_cursor: bool) -> Self {
        self.record_cursor = record_cursor;
        self
    }

    /// Builder pattern: set the hotkey binding
    pub fn with_hotkey(mut self, hotkey: HotkeyBinding) -> Self {
        self.hotkey = Some(hotkey);
        self
    }
}
