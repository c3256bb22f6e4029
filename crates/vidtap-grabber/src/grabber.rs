//! The per-surface frame grabber
//!
//! One instance per `(display, window, surface)` triple, created when the
//! injected shim first sees the surface. Construction attaches to the
//! consumer's shared memory; any failure there is fatal for the host process,
//! because an injected grabber has no channel to report errors through.
//! Runtime problems (odd surface sizes, missing cursor extension) only skip
//! frames and warn once.

use crate::cursor::composite_cursor;
use crate::gate::FrameRateGate;
use crate::gl::{GlContext, PackState, GL_NO_ERROR};
use crate::window::WindowProbe;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};
use vidtap_core::frame::stride_for_width;
use vidtap_core::{monotonic_micros, Error, Result};
use vidtap_shm::layout::{
    ShmHeader, FLAG_CAPTURE_FRONT, FLAG_LIMIT_FPS, FLAG_RECORD_CURSOR, MAX_DIMENSION,
    MAX_FRAME_BYTES, MAX_RING_SIZE, MIN_DIMENSION,
};
use vidtap_shm::{AttachedSegment, MainView, RingControl};

/// Environment variable carrying the decimal id of the main shared segment
pub const ENV_SHM: &str = "GRABBER_SHM";
/// Environment variable enabling per-call GL error checking when `> 0`
pub const ENV_DEBUG: &str = "GRABBER_DEBUG";

// EX_CONFIG from sysexits; the host cannot continue without the ring
const CONFIG_FATAL_EXIT: i32 = 78;

/// Hotkey the consumer asked the injected side to watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeyInfo {
    pub enabled: bool,
    pub keycode: u32,
    pub modifiers: u32,
}

/// In-process frame grabber bound to one GL surface
pub struct GrabberCore {
    gl: Box<dyn GlContext>,
    probe: Box<dyn WindowProbe>,
    main: AttachedSegment,
    slots: Vec<AttachedSegment>,
    view: MainView,
    ring: RingControl,
    gate: FrameRateGate,
    max_bytes: u32,
    flags: u32,
    width: u32,
    height: u32,
    debug: bool,
    cursor_available: bool,
    version_logged: bool,
    warned_too_small: bool,
    warned_too_large: bool,
}

impl GrabberCore {
    /// Attach using the injection environment
    ///
    /// Terminates the host process on any configuration error; see the
    /// module docs for why there is no softer option.
    pub fn from_env(gl: Box<dyn GlContext>, probe: Box<dyn WindowProbe>) -> Self {
        let debug = std::env::var(ENV_DEBUG)
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|v| v > 0)
            .unwrap_or(false);
        let shm_id = match std::env::var(ENV_SHM) {
            Ok(v) => v.trim().parse::<i32>().ok(),
            Err(_) => None,
        };
        let Some(shm_id) = shm_id else {
            eprintln!("[vidtap-grabber] Error: {ENV_SHM} is missing or not a shared memory id!");
            std::process::exit(CONFIG_FATAL_EXIT);
        };
        match Self::attach(shm_id, debug, gl, probe) {
            Ok(grabber) => grabber,
            Err(e) => {
                eprintln!("[vidtap-grabber] Error: {e}");
                std::process::exit(CONFIG_FATAL_EXIT);
            }
        }
    }

    /// Attach to the main segment with `shm_id` and every per-slot segment
    /// it describes, validating the whole layout
    pub fn attach(
        shm_id: i32,
        debug: bool,
        gl: Box<dyn GlContext>,
        probe: Box<dyn WindowProbe>,
    ) -> Result<Self> {
        if debug {
            debug!("Debug mode enabled");
        }

        let main = AttachedSegment::attach(shm_id)?;
        if main.size() < std::mem::size_of::<ShmHeader>() {
            return Err(Error::HeaderValidation(
                "main shared memory is too small for the header".to_string(),
            ));
        }

        std::sync::atomic::fence(Ordering::Acquire);
        let header = unsafe { &*(main.as_ptr() as *const ShmHeader) };
        let ring_size = header.ring_buffer_size;
        let max_bytes = header.max_bytes;
        let target_fps = header.target_fps;
        let flags = header.flags;

        if ring_size == 0 || ring_size > MAX_RING_SIZE {
            return Err(Error::HeaderValidation(format!(
                "ring buffer size {} is invalid",
                ring_size
            )));
        }
        if max_bytes > MAX_FRAME_BYTES {
            return Err(Error::HeaderValidation(format!(
                "maximum byte count {} is invalid",
                max_bytes
            )));
        }
        if main.size() != MainView::expected_size(ring_size) {
            return Err(Error::HeaderValidation(format!(
                "main shared memory is not the correct size for {} slots",
                ring_size
            )));
        }

        let view = unsafe { MainView::new(main.as_ptr(), ring_size) };
        let mut slots = Vec::with_capacity(ring_size as usize);
        for i in 0..ring_size {
            let desc = unsafe { std::ptr::read(view.descriptor(i)) };
            let slot = AttachedSegment::attach(desc.shm_id)?;
            if slot.size() != max_bytes as usize {
                return Err(Error::HeaderValidation(format!(
                    "frame shared memory {} is not the correct size",
                    desc.shm_id
                )));
            }
            slots.push(slot);
        }

        let cursor_available = probe.has_cursor_extension();
        if !cursor_available {
            warn!("Cursor extension is not supported by the server, the cursor has been hidden");
        }

        info!(
            "Grabber attached: {} slots of {} bytes, target {} fps",
            ring_size, max_bytes, target_fps
        );

        Ok(Self {
            gl,
            probe,
            main,
            slots,
            view,
            ring: RingControl::new(ring_size),
            gate: FrameRateGate::new(target_fps, flags & FLAG_LIMIT_FPS != 0),
            max_bytes,
            flags,
            width: 0,
            height: 0,
            debug,
            cursor_available,
            version_logged: false,
            warned_too_small: false,
            warned_too_large: false,
        })
    }

    /// Capture the current surface into the ring
    ///
    /// Call near buffer-swap time on the thread owning the GL context. Every
    /// call increments the shared frame counter whether or not a frame is
    /// published. The host's pixel-pack state is restored on every path out
    /// of the capture window.
    pub fn grab_frame(&mut self) {
        if !self.version_logged {
            self.version_logged = true;
            match self.gl.version_string() {
                Some(version) => info!("OpenGL version: {}", version),
                None => warn!("Could not query the OpenGL version string"),
            }
        }

        let view = self.view;
        let header = view.header();

        let (width, height) = self.probe.geometry().unwrap_or((0, 0));
        if (width, height) != (self.width, self.height) {
            info!("Surface size changed to {}x{}", width, height);
            self.width = width;
            self.height = height;
        }
        header.current_width.store(width, Ordering::Release);
        header.current_height.store(height, Ordering::Release);
        header.frame_counter.fetch_add(1, Ordering::AcqRel);

        let stride = stride_for_width(width);
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            if !self.warned_too_small {
                self.warned_too_small = true;
                warn!("Frame of size {}x{} is too small to capture", width, height);
            }
            return;
        }
        if width > MAX_DIMENSION
            || height > MAX_DIMENSION
            || stride as u64 * height as u64 > self.max_bytes as u64
        {
            if !self.warned_too_large {
                self.warned_too_large = true;
                warn!("Frame of size {}x{} is too large to capture", width, height);
            }
            return;
        }

        // Ring full: the consumer is behind, drop silently
        let Some(slot) = self.ring.try_reserve_write(header) else {
            return;
        };

        // May sleep in limit mode; deliberately before the state save
        let Some(timestamp) = self.gate.admit(monotonic_micros()) else {
            return;
        };

        self.debug_check("host code");

        let saved = PackState::save(&*self.gl);
        PackState::apply_capture(
            &*self.gl,
            (stride / 4) as i32,
            self.flags & FLAG_CAPTURE_FRONT != 0,
        );
        self.debug_check("pack state setup");

        // Descriptor first, payload second; both precede the index release
        unsafe {
            let desc = view.descriptor(slot);
            (*desc).timestamp = timestamp;
            (*desc).width = width;
            (*desc).height = height;
        }

        let len = stride as usize * height as usize;
        let dest = unsafe { &mut self.slots[slot as usize].as_mut_slice()[..len] };
        self.gl.read_pixels_bgra(width, height, dest);
        self.debug_check("read pixels");

        if self.flags & FLAG_RECORD_CURSOR != 0 && self.cursor_available {
            if let Some((origin_x, origin_y)) = self.probe.translate_to_root() {
                if let Some(cursor) = self.probe.cursor_image() {
                    composite_cursor(
                        dest,
                        stride as usize,
                        width,
                        height,
                        &cursor,
                        origin_x,
                        origin_y,
                    );
                }
            }
        }

        self.ring.commit_write(header);

        saved.restore(&*self.gl);
        self.debug_check("pack state restore");
    }

    /// The hotkey the consumer currently asks us to watch
    pub fn hotkey_info(&self) -> HotkeyInfo {
        let header = self.view.header();
        HotkeyInfo {
            enabled: header.hotkey_enabled.load(Ordering::Acquire) != 0,
            keycode: header.hotkey_keycode.load(Ordering::Acquire),
            modifiers: header.hotkey_modifiers.load(Ordering::Acquire),
        }
    }

    /// Report one hotkey press to the consumer
    ///
    /// The shared counter is an edge count; the consumer diffs successive
    /// values rather than reading a level.
    pub fn trigger_hotkey(&self) {
        self.view
            .header()
            .hotkey_counter
            .fetch_add(1, Ordering::AcqRel);
    }

    fn debug_check(&self, at: &str) {
        if !self.debug {
            return;
        }
        let error = self.gl.take_error();
        if error != GL_NO_ERROR {
            warn!("OpenGL error 0x{:04x} after {}", error, at);
        }
    }
}

impl Drop for GrabberCore {
    fn drop(&mut self) {
        debug!("Grabber for shm id {} detached", self.main.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::{
        GL_DRAW_FRAMEBUFFER, GL_DRAW_FRAMEBUFFER_BINDING, GL_FRAMEBUFFER, GL_FRONT,
        GL_PACK_ALIGNMENT, GL_PACK_IMAGE_HEIGHT, GL_PACK_ROW_LENGTH, GL_PACK_SKIP_IMAGES,
        GL_PACK_SKIP_PIXELS, GL_PACK_SKIP_ROWS, GL_PACK_SWAP_BYTES, GL_PIXEL_PACK_BUFFER_BINDING,
        GL_READ_BUFFER, GL_READ_FRAMEBUFFER, GL_READ_FRAMEBUFFER_BINDING,
    };
    use crate::window::CursorImage;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use vidtap_core::CaptureConfig;
    use vidtap_shm::CaptureSession;

    /// A host context with deliberately hostile pack settings
    fn host_state() -> PackState {
        PackState {
            pixel_pack_buffer: 7,
            draw_framebuffer: 3,
            read_framebuffer: 4,
            swap_bytes: 1,
            row_length: 99,
            image_height: 5,
            skip_pixels: 1,
            skip_rows: 2,
            skip_images: 3,
            alignment: 4,
            read_buffer: GL_FRONT as i32,
        }
    }

    /// GL double tracking the pack state like a real context; clones share
    /// their innards so tests can inspect state after handing one over
    #[derive(Clone)]
    struct MockGl {
        state: Rc<RefCell<PackState>>,
        fill: u8,
        readback_row_length: Rc<Cell<i32>>,
        readback_alignment: Rc<Cell<i32>>,
        next_error: Rc<Cell<u32>>,
    }

    impl MockGl {
        fn new(fill: u8) -> Self {
            Self {
                state: Rc::new(RefCell::new(host_state())),
                fill,
                readback_row_length: Rc::new(Cell::new(-1)),
                readback_alignment: Rc::new(Cell::new(-1)),
                next_error: Rc::new(Cell::new(GL_NO_ERROR)),
            }
        }
    }

    impl GlContext for MockGl {
        fn version_string(&self) -> Option<String> {
            Some("3.3 Mock".to_string())
        }

        fn get_integer(&self, pname: u32) -> i32 {
            let s = self.state.borrow();
            match pname {
                GL_PIXEL_PACK_BUFFER_BINDING => s.pixel_pack_buffer,
                GL_DRAW_FRAMEBUFFER_BINDING => s.draw_framebuffer,
                GL_READ_FRAMEBUFFER_BINDING => s.read_framebuffer,
                GL_PACK_SWAP_BYTES => s.swap_bytes,
                GL_PACK_ROW_LENGTH => s.row_length,
                GL_PACK_IMAGE_HEIGHT => s.image_height,
                GL_PACK_SKIP_PIXELS => s.skip_pixels,
                GL_PACK_SKIP_ROWS => s.skip_rows,
                GL_PACK_SKIP_IMAGES => s.skip_images,
                GL_PACK_ALIGNMENT => s.alignment,
                GL_READ_BUFFER => s.read_buffer,
                _ => panic!("unexpected glGetIntegerv 0x{:04x}", pname),
            }
        }

        fn bind_pack_buffer(&self, buffer: u32) {
            self.state.borrow_mut().pixel_pack_buffer = buffer as i32;
        }

        fn bind_framebuffer(&self, target: u32, fbo: u32) {
            let mut s = self.state.borrow_mut();
            match target {
                GL_FRAMEBUFFER => {
                    s.draw_framebuffer = fbo as i32;
                    s.read_framebuffer = fbo as i32;
                }
                GL_DRAW_FRAMEBUFFER => s.draw_framebuffer = fbo as i32,
                GL_READ_FRAMEBUFFER => s.read_framebuffer = fbo as i32,
                _ => panic!("unexpected glBindFramebuffer target 0x{:04x}", target),
            }
        }

        fn pixel_store(&self, pname: u32, value: i32) {
            let mut s = self.state.borrow_mut();
            match pname {
                GL_PACK_SWAP_BYTES => s.swap_bytes = value,
                GL_PACK_ROW_LENGTH => s.row_length = value,
                GL_PACK_IMAGE_HEIGHT => s.image_height = value,
                GL_PACK_SKIP_PIXELS => s.skip_pixels = value,
                GL_PACK_SKIP_ROWS => s.skip_rows = value,
                GL_PACK_SKIP_IMAGES => s.skip_images = value,
                GL_PACK_ALIGNMENT => s.alignment = value,
                _ => panic!("unexpected glPixelStorei 0x{:04x}", pname),
            }
        }

        fn set_read_buffer(&self, mode: u32) {
            self.state.borrow_mut().read_buffer = mode as i32;
        }

        fn read_pixels_bgra(&self, width: u32, height: u32, dest: &mut [u8]) {
            let s = self.state.borrow();
            self.readback_row_length.set(s.row_length);
            self.readback_alignment.set(s.alignment);
            assert_eq!(s.pixel_pack_buffer, 0, "readback with a PBO bound");
            assert_eq!(s.read_framebuffer, 0, "readback from a bound FBO");
            let stride = s.row_length as usize * 4;
            for row in 0..height as usize {
                for byte in 0..width as usize * 4 {
                    dest[row * stride + byte] = self.fill;
                }
            }
        }

        fn take_error(&self) -> u32 {
            self.next_error.replace(GL_NO_ERROR)
        }
    }

    #[derive(Clone)]
    struct MockProbe {
        size: Rc<Cell<(u32, u32)>>,
        origin: (i32, i32),
        cursor: Option<CursorImage>,
        has_extension: bool,
    }

    impl MockProbe {
        fn sized(width: u32, height: u32) -> Self {
            Self {
                size: Rc::new(Cell::new((width, height))),
                origin: (0, 0),
                cursor: None,
                has_extension: true,
            }
        }
    }

    impl WindowProbe for MockProbe {
        fn geometry(&self) -> vidtap_core::Result<(u32, u32)> {
            Ok(self.size.get())
        }

        fn translate_to_root(&self) -> Option<(i32, i32)> {
            Some(self.origin)
        }

        fn has_cursor_extension(&self) -> bool {
            self.has_extension
        }

        fn cursor_image(&self) -> Option<CursorImage> {
            self.cursor.clone()
        }
    }

    fn session_with(ring_size: u32, record_cursor: bool) -> CaptureSession {
        CaptureSession::create(
            &CaptureConfig::new()
                .with_ring_size(ring_size)
                .with_max_frame_bytes(4096)
                .with_target_fps(0)
                .with_record_cursor(record_cursor),
        )
        .unwrap()
    }

    fn grabber_for(session: &CaptureSession, gl: &MockGl, probe: &MockProbe) -> GrabberCore {
        GrabberCore::attach(
            session.main_id(),
            false,
            Box::new(gl.clone()),
            Box::new(probe.clone()),
        )
        .unwrap()
    }

    #[test]
    fn attach_to_unknown_id_fails() {
        let result = GrabberCore::attach(
            -7,
            false,
            Box::new(MockGl::new(0)),
            Box::new(MockProbe::sized(4, 4)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn publish_roundtrip_restores_pack_state() {
        let mut session = session_with(4, false);
        let gl = MockGl::new(0x5A);
        let probe = MockProbe::sized(4, 4);
        let mut grabber = grabber_for(&session, &gl, &probe);

        grabber.grab_frame();

        let frame = session.try_next_frame().expect("frame published");
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 4);
        assert!(frame.data()[..16].iter().all(|&b| b == 0x5A));
        assert_eq!(session.frame_counter(), 1);
        assert_eq!(session.current_size(), (4, 4));

        assert_eq!(*gl.state.borrow(), host_state());
        // 4 px * 4 bytes rounds to a 16-byte stride, 4 pixels per row
        assert_eq!(gl.readback_row_length.get(), 4);
        assert_eq!(gl.readback_alignment.get(), 8);
    }

    #[test]
    fn counter_counts_dropped_frames_too() {
        let session = session_with(4, false);
        let gl = MockGl::new(0);
        let probe = MockProbe::sized(1, 1);
        let mut grabber = grabber_for(&session, &gl, &probe);

        for _ in 0..3 {
            grabber.grab_frame();
        }
        assert_eq!(session.frame_counter(), 3);
        assert_eq!(session.queued_frames(), 0);
    }

    #[test]
    fn full_ring_drops_writes() {
        let session = session_with(2, false);
        let gl = MockGl::new(1);
        let probe = MockProbe::sized(4, 4);
        let mut grabber = grabber_for(&session, &gl, &probe);

        for _ in 0..5 {
            grabber.grab_frame();
        }
        let header = session.header();
        assert_eq!(session.frame_counter(), 5);
        assert_eq!(session.queued_frames(), 2);
        assert_eq!(header.write_pos.load(Ordering::Relaxed), 2);
        assert_eq!(header.read_pos.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn oversized_frame_skips_capture_and_leaves_state_alone() {
        let session = session_with(2, false);
        let gl = MockGl::new(1);
        // 100x100 needs 40000 bytes, the slots hold 4096
        let probe = MockProbe::sized(100, 100);
        let mut grabber = grabber_for(&session, &gl, &probe);

        grabber.grab_frame();
        grabber.grab_frame();

        assert_eq!(session.frame_counter(), 2);
        assert_eq!(session.queued_frames(), 0);
        assert_eq!(*gl.state.borrow(), host_state());
        assert_eq!(gl.readback_row_length.get(), -1);
    }

    #[test]
    fn resize_between_grabs_is_tracked() {
        let mut session = session_with(4, false);
        let gl = MockGl::new(2);
        let probe = MockProbe::sized(4, 4);
        let mut grabber = grabber_for(&session, &gl, &probe);

        grabber.grab_frame();
        probe.size.set((8, 8));
        grabber.grab_frame();

        assert_eq!(session.try_next_frame().unwrap().width, 4);
        assert_eq!(session.try_next_frame().unwrap().width, 8);
        assert_eq!(session.current_size(), (8, 8));
    }

    #[test]
    fn cursor_overlay_lands_in_published_frame() {
        let mut session = session_with(2, true);
        let gl = MockGl::new(0);
        let mut probe = MockProbe::sized(4, 4);
        probe.cursor = Some(CursorImage {
            width: 1,
            height: 1,
            xhot: 0,
            yhot: 0,
            x: 1,
            y: 1,
            pixels: vec![0xFF01_0203],
        });
        let mut grabber = grabber_for(&session, &gl, &probe);

        grabber.grab_frame();
        let frame = session.try_next_frame().unwrap();

        // Frame pixel (1, 1) sits in stored row height-1-1 = 2
        let stride = frame.stride as usize;
        assert_eq!(&frame.data()[stride * 2 + 4..stride * 2 + 8], &[3, 2, 1, 0]);
    }

    #[test]
    fn missing_cursor_extension_skips_overlay() {
        let mut session = session_with(2, true);
        let gl = MockGl::new(0);
        let mut probe = MockProbe::sized(4, 4);
        probe.has_extension = false;
        probe.cursor = Some(CursorImage {
            width: 1,
            height: 1,
            xhot: 0,
            yhot: 0,
            x: 1,
            y: 1,
            pixels: vec![0xFFFF_FFFF],
        });
        let mut grabber = grabber_for(&session, &gl, &probe);

        grabber.grab_frame();
        let frame = session.try_next_frame().unwrap();
        assert!(frame.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn hotkeys_flow_both_ways() {
        let mut session = session_with(2, false);
        session.set_hotkey(Some(vidtap_core::HotkeyBinding {
            keycode: 107,
            modifiers: 0x40,
        }));
        let gl = MockGl::new(0);
        let probe = MockProbe::sized(4, 4);
        let grabber = grabber_for(&session, &gl, &probe);

        let info = grabber.hotkey_info();
        assert!(info.enabled);
        assert_eq!(info.keycode, 107);
        assert_eq!(info.modifiers, 0x40);

        grabber.trigger_hotkey();
        grabber.trigger_hotkey();
        assert_eq!(session.take_hotkey_triggers(), 2);
        assert_eq!(session.take_hotkey_triggers(), 0);
    }

    #[test]
    fn gl_errors_in_debug_mode_are_not_fatal() {
        let mut session = session_with(2, false);
        let gl = MockGl::new(9);
        gl.next_error.set(0x0502); // GL_INVALID_OPERATION
        let probe = MockProbe::sized(4, 4);
        let mut grabber = GrabberCore::attach(
            session.main_id(),
            true,
            Box::new(gl.clone()),
            Box::new(probe),
        )
        .unwrap();

        grabber.grab_frame();

        let frame = session.try_next_frame().expect("frame still published");
        assert!(frame.is_valid());
        assert_eq!(*gl.state.borrow(), host_state());
    }
}
