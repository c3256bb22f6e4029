//! Consumer-side capture session
//!
//! Owns segment creation and destruction: one main segment holding the header
//! and descriptors, plus one payload segment per ring slot. The grabber
//! attaches to these by id and never creates anything. Frames are copied out
//! of the ring; the slot is handed back to the producer immediately after.

use crate::layout::{
    FrameDescriptor, MainView, ShmHeader, FLAG_CAPTURE_FRONT, FLAG_LIMIT_FPS, FLAG_RECORD_CURSOR,
    MAX_FRAME_BYTES, MAX_RING_SIZE,
};
use crate::ring::RingControl;
use crate::segment::OwnedSegment;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use vidtap_core::frame::stride_for_width;
use vidtap_core::{CaptureConfig, Error, Frame, HotkeyBinding, Result};

/// Encode the boolean config switches into the header flag bitfield
fn flags_for(config: &CaptureConfig) -> u32 {
    let mut flags = 0;
    if config.capture_front {
        flags |= FLAG_CAPTURE_FRONT;
    }
    if config.limit_fps {
        flags |= FLAG_LIMIT_FPS;
    }
    if config.record_cursor {
        flags |= FLAG_RECORD_CURSOR;
    }
    flags
}

/// A live capture session: the consumer end of the frame ring
pub struct CaptureSession {
    main: OwnedSegment,
    slots: Vec<OwnedSegment>,
    view: MainView,
    ring: RingControl,
    max_bytes: u32,
    sequence: u64,
    last_hotkey_count: u64,
}

impl CaptureSession {
    /// Create the shared segments and initialize the header from `config`
    pub fn create(config: &CaptureConfig) -> Result<Self> {
        let ring_size = config.ring_size;
        if ring_size == 0 || ring_size > MAX_RING_SIZE {
            return Err(Error::Config(format!(
                "ring size {} out of range 1..={}",
                ring_size, MAX_RING_SIZE
            )));
        }
        if config.max_frame_bytes == 0 || config.max_frame_bytes > MAX_FRAME_BYTES {
            return Err(Error::Config(format!(
                "max frame bytes {} out of range 1..={}",
                config.max_frame_bytes, MAX_FRAME_BYTES
            )));
        }

        let main = OwnedSegment::create(MainView::expected_size(ring_size))?;
        let view = unsafe { MainView::new(main.as_ptr(), ring_size) };

        // Setup-time fields; the grabber has nothing to attach to yet, so
        // plain writes through the raw header pointer are unobserved.
        unsafe {
            let header = main.as_ptr() as *mut ShmHeader;
            (*header).ring_buffer_size = ring_size;
            (*header).max_bytes = config.max_frame_bytes;
            (*header).target_fps = config.target_fps;
            (*header).flags = flags_for(config);
        }

        let mut slots = Vec::with_capacity(ring_size as usize);
        for i in 0..ring_size {
            let slot = OwnedSegment::create(config.max_frame_bytes as usize)?;
            unsafe {
                (*view.descriptor(i)).shm_id = slot.id();
            }
            slots.push(slot);
        }

        let session = Self {
            main,
            slots,
            view,
            ring: RingControl::new(ring_size),
            max_bytes: config.max_frame_bytes,
            sequence: 0,
            last_hotkey_count: 0,
        };
        session.set_hotkey(config.hotkey);

        info!(
            "Capture session created: {} slots of {} bytes, main shm id {}",
            ring_size,
            config.max_frame_bytes,
            session.main_id()
        );
        Ok(session)
    }

    /// Id of the main segment; hand this to the grabber via `GRABBER_SHM`
    pub fn main_id(&self) -> i32 {
        self.main.id()
    }

    pub fn header(&self) -> &ShmHeader {
        self.view.header()
    }

    pub fn ring(&self) -> &RingControl {
        &self.ring
    }

    /// Number of frames currently waiting in the ring
    pub fn queued_frames(&self) -> u32 {
        self.ring.occupancy(self.header())
    }

    /// Total grab calls the producer has made, dropped frames included
    pub fn frame_counter(&self) -> u64 {
        self.header().frame_counter.load(Ordering::Acquire)
    }

    /// Last surface size the producer observed
    pub fn current_size(&self) -> (u32, u32) {
        let header = self.header();
        (
            header.current_width.load(Ordering::Acquire),
            header.current_height.load(Ordering::Acquire),
        )
    }

    /// Publish or clear the hotkey the grabber side should watch
    pub fn set_hotkey(&self, binding: Option<HotkeyBinding>) {
        let header = self.header();
        match binding {
            Some(hk) => {
                header.hotkey_keycode.store(hk.keycode, Ordering::Release);
                header.hotkey_modifiers.store(hk.modifiers, Ordering::Release);
                header.hotkey_enabled.store(1, Ordering::Release);
            }
            None => header.hotkey_enabled.store(0, Ordering::Release),
        }
    }

    /// Number of hotkey triggers since the previous call
    ///
    /// The counter is a free-running edge count, not a level; comparing
    /// against the last observed value tolerates any number of triggers
    /// between polls.
    pub fn take_hotkey_triggers(&mut self) -> u64 {
        let count = self.header().hotkey_counter.load(Ordering::Acquire);
        let edges = count.wrapping_sub(self.last_hotkey_count);
        self.last_hotkey_count = count;
        edges
    }

    /// Copy the next frame out of the ring, if one is ready
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        let header = self.header();
        let slot = self.ring.try_reserve_read(header)?;

        let desc: FrameDescriptor = unsafe { std::ptr::read(self.view.descriptor(slot)) };
        let stride = stride_for_width(desc.width);
        let len = stride as usize * desc.height as usize;

        // A descriptor the producer itself would have refused to publish
        // means the slot is corrupt; skip it rather than read out of bounds.
        if desc.width == 0 || desc.height == 0 || len > self.max_bytes as usize {
            debug!(
                "Discarding corrupt slot {}: {}x{}",
                slot, desc.width, desc.height
            );
            self.ring.commit_read(header);
            return None;
        }

        let payload = unsafe { &self.slots[slot as usize].as_slice()[..len] };
        let data = payload.to_vec();
        self.ring.commit_read(header);

        self.sequence += 1;
        Some(Frame::new(
            data,
            desc.width,
            desc.height,
            desc.timestamp,
            self.sequence,
        ))
    }
}
