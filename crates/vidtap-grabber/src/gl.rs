//! GL seam: the handful of operations frame readback needs
//!
//! The host process already owns a GL context; we only borrow it. The real
//! implementation resolves entry points at runtime with `dlsym`, so the crate
//! links against nothing and works with whatever libGL the host loaded.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use vidtap_core::{Error, Result};

pub const GL_NO_ERROR: u32 = 0;
pub const GL_VERSION: u32 = 0x1F02;
pub const GL_FRONT: u32 = 0x0404;
pub const GL_BACK: u32 = 0x0405;
pub const GL_READ_BUFFER: u32 = 0x0C02;
pub const GL_PACK_SWAP_BYTES: u32 = 0x0D00;
pub const GL_PACK_ROW_LENGTH: u32 = 0x0D02;
pub const GL_PACK_SKIP_ROWS: u32 = 0x0D03;
pub const GL_PACK_SKIP_PIXELS: u32 = 0x0D04;
pub const GL_PACK_ALIGNMENT: u32 = 0x0D05;
pub const GL_PACK_SKIP_IMAGES: u32 = 0x806B;
pub const GL_PACK_IMAGE_HEIGHT: u32 = 0x806C;
pub const GL_BGRA: u32 = 0x80E1;
pub const GL_UNSIGNED_INT_8_8_8_8_REV: u32 = 0x8367;
pub const GL_PIXEL_PACK_BUFFER: u32 = 0x88EB;
pub const GL_PIXEL_PACK_BUFFER_BINDING: u32 = 0x88ED;
pub const GL_READ_FRAMEBUFFER: u32 = 0x8CA8;
pub const GL_DRAW_FRAMEBUFFER: u32 = 0x8CA9;
pub const GL_DRAW_FRAMEBUFFER_BINDING: u32 = 0x8CA6;
pub const GL_READ_FRAMEBUFFER_BINDING: u32 = 0x8CAA;
pub const GL_FRAMEBUFFER: u32 = 0x8D40;

/// The GL operations [`crate::GrabberCore`] performs
pub trait GlContext {
    /// `glGetString(GL_VERSION)`, captured once for diagnostics
    fn version_string(&self) -> Option<String>;
    fn get_integer(&self, pname: u32) -> i32;
    fn bind_pack_buffer(&self, buffer: u32);
    fn bind_framebuffer(&self, target: u32, fbo: u32);
    fn pixel_store(&self, pname: u32, value: i32);
    fn set_read_buffer(&self, mode: u32);
    /// `glReadPixels` of the full surface as BGRA bytes
    ///
    /// Row layout is governed by the pack state configured beforehand; `dest`
    /// must hold at least `row_stride * height` bytes.
    fn read_pixels_bgra(&self, width: u32, height: u32, dest: &mut [u8]);
    /// `glGetError`, draining one error flag
    fn take_error(&self) -> u32;
}

/// Everything `glReadPixels` observes, snapshotted before capture and put
/// back on every exit path so the host never sees our pack settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackState {
    pub pixel_pack_buffer: i32,
    pub draw_framebuffer: i32,
    pub read_framebuffer: i32,
    pub swap_bytes: i32,
    pub row_length: i32,
    pub image_height: i32,
    pub skip_pixels: i32,
    pub skip_rows: i32,
    pub skip_images: i32,
    pub alignment: i32,
    pub read_buffer: i32,
}

impl PackState {
    /// Snapshot the host's pack state
    pub fn save(gl: &dyn GlContext) -> Self {
        Self {
            pixel_pack_buffer: gl.get_integer(GL_PIXEL_PACK_BUFFER_BINDING),
            draw_framebuffer: gl.get_integer(GL_DRAW_FRAMEBUFFER_BINDING),
            read_framebuffer: gl.get_integer(GL_READ_FRAMEBUFFER_BINDING),
            swap_bytes: gl.get_integer(GL_PACK_SWAP_BYTES),
            row_length: gl.get_integer(GL_PACK_ROW_LENGTH),
            image_height: gl.get_integer(GL_PACK_IMAGE_HEIGHT),
            skip_pixels: gl.get_integer(GL_PACK_SKIP_PIXELS),
            skip_rows: gl.get_integer(GL_PACK_SKIP_ROWS),
            skip_images: gl.get_integer(GL_PACK_SKIP_IMAGES),
            alignment: gl.get_integer(GL_PACK_ALIGNMENT),
            read_buffer: gl.get_integer(GL_READ_BUFFER),
        }
    }

    /// Neutralise the pack state for a readback with `row_length` pixels per
    /// row, reading the front or back buffer
    pub fn apply_capture(gl: &dyn GlContext, row_length: i32, capture_front: bool) {
        gl.bind_pack_buffer(0);
        gl.bind_framebuffer(GL_FRAMEBUFFER, 0);
        gl.pixel_store(GL_PACK_SWAP_BYTES, 0);
        gl.pixel_store(GL_PACK_ROW_LENGTH, row_length);
        gl.pixel_store(GL_PACK_IMAGE_HEIGHT, 0);
        gl.pixel_store(GL_PACK_SKIP_PIXELS, 0);
        gl.pixel_store(GL_PACK_SKIP_ROWS, 0);
        gl.pixel_store(GL_PACK_SKIP_IMAGES, 0);
        gl.pixel_store(GL_PACK_ALIGNMENT, 8);
        gl.set_read_buffer(if capture_front { GL_FRONT } else { GL_BACK });
    }

    /// Restore the snapshot
    pub fn restore(&self, gl: &dyn GlContext) {
        gl.bind_pack_buffer(self.pixel_pack_buffer as u32);
        gl.bind_framebuffer(GL_DRAW_FRAMEBUFFER, self.draw_framebuffer as u32);
        gl.bind_framebuffer(GL_READ_FRAMEBUFFER, self.read_framebuffer as u32);
        gl.pixel_store(GL_PACK_SWAP_BYTES, self.swap_bytes);
        gl.pixel_store(GL_PACK_ROW_LENGTH, self.row_length);
        gl.pixel_store(GL_PACK_IMAGE_HEIGHT, self.image_height);
        gl.pixel_store(GL_PACK_SKIP_PIXELS, self.skip_pixels);
        gl.pixel_store(GL_PACK_SKIP_ROWS, self.skip_rows);
        gl.pixel_store(GL_PACK_SKIP_IMAGES, self.skip_images);
        gl.pixel_store(GL_PACK_ALIGNMENT, self.alignment);
        gl.set_read_buffer(self.read_buffer as u32);
    }
}

type GetStringFn = unsafe extern "C" fn(u32) -> *const c_char;
type GetErrorFn = unsafe extern "C" fn() -> u32;
type GetIntegervFn = unsafe extern "C" fn(u32, *mut i32);
type BindBufferFn = unsafe extern "C" fn(u32, u32);
type BindFramebufferFn = unsafe extern "C" fn(u32, u32);
type PixelStoreiFn = unsafe extern "C" fn(u32, i32);
type ReadBufferFn = unsafe extern "C" fn(u32);
type ReadPixelsFn = unsafe extern "C" fn(i32, i32, i32, i32, u32, u32, *mut c_void);

/// GL entry points resolved from the host process at runtime
pub struct DlGl {
    get_string: GetStringFn,
    get_error: GetErrorFn,
    get_integerv: GetIntegervFn,
    bind_buffer: BindBufferFn,
    bind_framebuffer: BindFramebufferFn,
    pixel_storei: PixelStoreiFn,
    read_buffer: ReadBufferFn,
    read_pixels: ReadPixelsFn,
}

unsafe fn resolve(handle: *mut c_void, name: &CStr) -> Result<*mut c_void> {
    let sym = libc::dlsym(handle, name.as_ptr());
    if sym.is_null() {
        return Err(Error::Gl(format!(
            "missing GL entry point {}",
            name.to_string_lossy()
        )));
    }
    Ok(sym)
}

impl DlGl {
    /// Resolve the entry points from symbols already loaded into the host,
    /// falling back to `libGL.so.1`
    pub fn load() -> Result<Self> {
        unsafe {
            Self::load_from(libc::RTLD_DEFAULT).or_else(|_| {
                let handle = libc::dlopen(
                    c"libGL.so.1".as_ptr(),
                    libc::RTLD_LAZY | libc::RTLD_GLOBAL,
                );
                if handle.is_null() {
                    return Err(Error::Gl("can't load libGL.so.1".into()));
                }
                Self::load_from(handle)
            })
        }
    }

    unsafe fn load_from(handle: *mut c_void) -> Result<Self> {
        Ok(Self {
            get_string: std::mem::transmute::<*mut c_void, GetStringFn>(resolve(
                handle,
                c"glGetString",
            )?),
            get_error: std::mem::transmute::<*mut c_void, GetErrorFn>(resolve(
                handle,
                c"glGetError",
            )?),
            get_integerv: std::mem::transmute::<*mut c_void, GetIntegervFn>(resolve(
                handle,
                c"glGetIntegerv",
            )?),
            bind_buffer: std::mem::transmute::<*mut c_void, BindBufferFn>(resolve(
                handle,
                c"glBindBuffer",
            )?),
            bind_framebuffer: std::mem::transmute::<*mut c_void, BindFramebufferFn>(resolve(
                handle,
                c"glBindFramebuffer",
            )?),
            pixel_storei: std::mem::transmute::<*mut c_void, PixelStoreiFn>(resolve(
                handle,
                c"glPixelStorei",
            )?),
            read_buffer: std::mem::transmute::<*mut c_void, ReadBufferFn>(resolve(
                handle,
                c"glReadBuffer",
            )?),
            read_pixels: std::mem::transmute::<*mut c_void, ReadPixelsFn>(resolve(
                handle,
                c"glReadPixels",
            )?),
        })
    }
}

impl GlContext for DlGl {
    fn version_string(&self) -> Option<String> {
        let ptr = unsafe { (self.get_string)(GL_VERSION) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    fn get_integer(&self, pname: u32) -> i32 {
        let mut value = 0;
        unsafe { (self.get_integerv)(pname, &mut value) };
        value
    }

    fn bind_pack_buffer(&self, buffer: u32) {
        unsafe { (self.bind_buffer)(GL_PIXEL_PACK_BUFFER, buffer) };
    }

    fn bind_framebuffer(&self, target: u32, fbo: u32) {
        unsafe { (self.bind_framebuffer)(target, fbo) };
    }

    fn pixel_store(&self, pname: u32, value: i32) {
        unsafe { (self.pixel_storei)(pname, value) };
    }

    fn set_read_buffer(&self, mode: u32) {
        unsafe { (self.read_buffer)(mode) };
    }

    fn read_pixels_bgra(&self, width: u32, height: u32, dest: &mut [u8]) {
        unsafe {
            (self.read_pixels)(
                0,
                0,
                width as i32,
                height as i32,
                GL_BGRA,
                GL_UNSIGNED_INT_8_8_8_8_REV,
                dest.as_mut_ptr() as *mut c_void,
            )
        };
    }

    fn take_error(&self) -> u32 {
        unsafe { (self.get_error)() }
    }
}
