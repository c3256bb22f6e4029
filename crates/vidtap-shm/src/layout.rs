//! Byte-exact shared-memory layout
//!
//! Both processes map the same segments, so every struct here is `repr(C)`
//! and the field order is part of the wire contract. Fields touched from both
//! sides after setup are atomics; the atomic types are layout-identical to
//! their plain counterparts. A little-endian host is assumed.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Hard upper bound on the ring slot count
pub const MAX_RING_SIZE: u32 = 1000;
/// Hard upper bound on a single frame's byte length
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024 * 1024;
/// Frames narrower or shorter than this are rejected
pub const MIN_DIMENSION: u32 = 2;
/// Frames wider or taller than this are rejected
pub const MAX_DIMENSION: u32 = 10000;

/// Read the front buffer instead of the back buffer
pub const FLAG_CAPTURE_FRONT: u32 = 1 << 0;
/// Throttle (sleep) rather than drop to hit the target frame rate
pub const FLAG_LIMIT_FPS: u32 = 1 << 1;
/// Composite the cursor overlay into captured frames
pub const FLAG_RECORD_CURSOR: u32 = 1 << 2;

/// Header at offset 0 of the main segment
///
/// `ring_buffer_size`, `max_bytes`, `target_fps` and `flags` are written once
/// by the consumer before the grabber attaches and are read-only afterwards.
/// `read_pos`/`write_pos` wrap at twice the ring size, which distinguishes a
/// full ring from an empty one without an auxiliary flag.
#[repr(C)]
pub struct ShmHeader {
    pub ring_buffer_size: u32,
    pub max_bytes: u32,
    pub target_fps: u32,
    pub flags: u32,
    pub current_width: AtomicU32,
    pub current_height: AtomicU32,
    pub frame_counter: AtomicU64,
    pub read_pos: AtomicU32,
    pub write_pos: AtomicU32,
    pub hotkey_enabled: AtomicU32,
    pub hotkey_keycode: AtomicU32,
    pub hotkey_modifiers: AtomicU32,
    pub hotkey_counter: AtomicU64,
}

/// Per-slot descriptor following the header in the main segment
///
/// `shm_id` is written by the consumer at setup; the grabber fills the rest
/// before publishing the slot.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    pub shm_id: i32,
    pub width: u32,
    pub height: u32,
    pub timestamp: i64,
}

// The C-compatible padding is part of the contract; catch drift at compile time.
const _: () = assert!(std::mem::size_of::<ShmHeader>() == 64);
const _: () = assert!(std::mem::size_of::<FrameDescriptor>() == 24);
const _: () = assert!(std::mem::align_of::<ShmHeader>() == 8);

/// Typed view over a mapped main segment
///
/// Holds the base pointer and slot count; the segment itself is owned
/// elsewhere and must outlive the view.
#[derive(Clone, Copy)]
pub struct MainView {
    base: *mut u8,
    ring_size: u32,
}

// Safety: the view only hands out the atomic header and raw descriptor
// pointers; slot handoff is governed by the ring indices.
unsafe impl Send for MainView {}

impl MainView {
    /// Expected byte length of the main segment for `ring_size` slots
    pub fn expected_size(ring_size: u32) -> usize {
        std::mem::size_of::<ShmHeader>()
            + std::mem::size_of::<FrameDescriptor>() * ring_size as usize
    }

    /// # Safety
    /// `base` must point to a mapped region of at least
    /// `expected_size(ring_size)` bytes that outlives the view.
    pub unsafe fn new(base: *mut u8, ring_size: u32) -> Self {
        Self { base, ring_size }
    }

    /// The shared header
    pub fn header(&self) -> &ShmHeader {
        unsafe { &*(self.base as *const ShmHeader) }
    }

    /// Number of ring slots
    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    /// Raw pointer to the descriptor for `slot`
    ///
    /// Descriptors are plain (non-atomic) data; the ring index protocol
    /// serializes access, so reads and writes go through this pointer.
    pub fn descriptor(&self, slot: u32) -> *mut FrameDescriptor {
        debug_assert!(slot < self.ring_size);
        unsafe {
            let descs = self.base.add(std::mem::size_of::<ShmHeader>()) as *mut FrameDescriptor;
            descs.add(slot as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn header_field_offsets() {
        // Offsets are the cross-process contract, not an implementation detail.
        let header = unsafe { mem::zeroed::<ShmHeader>() };
        let base = &header as *const ShmHeader as usize;
        assert_eq!(&header.ring_buffer_size as *const _ as usize - base, 0);
        assert_eq!(&header.max_bytes as *const _ as usize - base, 4);
        assert_eq!(&header.target_fps as *const _ as usize - base, 8);
        assert_eq!(&header.flags as *const _ as usize - base, 12);
        assert_eq!(&header.current_width as *const _ as usize - base, 16);
        assert_eq!(&header.current_height as *const _ as usize - base, 20);
        assert_eq!(&header.frame_counter as *const _ as usize - base, 24);
        assert_eq!(&header.read_pos as *const _ as usize - base, 32);
        assert_eq!(&header.write_pos as *const _ as usize - base, 36);
        assert_eq!(&header.hotkey_enabled as *const _ as usize - base, 40);
        assert_eq!(&header.hotkey_keycode as *const _ as usize - base, 44);
        assert_eq!(&header.hotkey_modifiers as *const _ as usize - base, 48);
        assert_eq!(&header.hotkey_counter as *const _ as usize - base, 56);
    }

    #[test]
    fn main_segment_size() {
        assert_eq!(MainView::expected_size(4), 64 + 4 * 24);
        assert_eq!(MainView::expected_size(1000), 64 + 1000 * 24);
    }
}
