//! Window seam: surface geometry and cursor queries
//!
//! The real implementation talks to the X server over xcb. The cursor comes
//! from the XFixes extension, which is optional: without it the grabber
//! simply captures no cursor.

use vidtap_core::{Error, Result};
use xcb::{x, xfixes, XidNew};

/// A cursor bitmap as reported by the server
///
/// `x`/`y` are the hotspot position in root coordinates; `pixels` are
/// premultiplied ARGB, row-major, top row first.
#[derive(Debug, Clone)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub xhot: u32,
    pub yhot: u32,
    pub x: i32,
    pub y: i32,
    pub pixels: Vec<u32>,
}

/// What the grabber needs to know about its window
pub trait WindowProbe {
    /// Current surface size in pixels
    fn geometry(&self) -> Result<(u32, u32)>;
    /// Window origin in root coordinates, or `None` if the window is gone
    fn translate_to_root(&self) -> Option<(i32, i32)>;
    /// Whether a cursor-query extension is available at all
    fn has_cursor_extension(&self) -> bool;
    /// Fetch the current cursor; failure is not an error, just no overlay
    fn cursor_image(&self) -> Option<CursorImage>;
}

/// xcb-backed probe for one window
pub struct XcbWindowProbe {
    conn: xcb::Connection,
    window: x::Window,
    root: x::Window,
    has_xfixes: bool,
}

impl XcbWindowProbe {
    /// Connect to the display and wrap the window with X resource id
    /// `window_id`
    pub fn connect(window_id: u32) -> Result<Self> {
        let (conn, screen_num) =
            xcb::Connection::connect_with_extensions(None, &[], &[xcb::Extension::XFixes])
                .map_err(|e| Error::X11Connection(e.to_string()))?;

        let root = {
            let setup = conn.get_setup();
            let screen = setup
                .roots()
                .nth(screen_num as usize)
                .ok_or_else(|| Error::X11Connection("invalid screen".to_string()))?;
            screen.root()
        };
        let window = unsafe { x::Window::new(window_id) };

        // XFixes wants a version handshake before any other request
        let has_xfixes = conn
            .active_extensions()
            .any(|e| e == xcb::Extension::XFixes)
            && conn
                .wait_for_reply(conn.send_request(&xfixes::QueryVersion {
                    client_major_version: 4,
                    client_minor_version: 0,
                }))
                .is_ok();

        Ok(Self {
            conn,
            window,
            root,
            has_xfixes,
        })
    }
}

impl WindowProbe for XcbWindowProbe {
    fn geometry(&self) -> Result<(u32, u32)> {
        let cookie = self.conn.send_request(&x::GetGeometry {
            drawable: x::Drawable::Window(self.window),
        });
        let reply = self
            .conn
            .wait_for_reply(cookie)
            .map_err(|e| Error::CaptureError(format!("GetGeometry failed: {:?}", e)))?;
        Ok((reply.width() as u32, reply.height() as u32))
    }

    fn translate_to_root(&self) -> Option<(i32, i32)> {
        let cookie = self.conn.send_request(&x::TranslateCoordinates {
            src_window: self.window,
            dst_window: self.root,
            src_x: 0,
            src_y: 0,
        });
        let reply = self.conn.wait_for_reply(cookie).ok()?;
        Some((reply.dst_x() as i32, reply.dst_y() as i32))
    }

    fn has_cursor_extension(&self) -> bool {
        self.has_xfixes
    }

    fn cursor_image(&self) -> Option<CursorImage> {
        if !self.has_xfixes {
            return None;
        }
        let cookie = self.conn.send_request(&xfixes::GetCursorImage {});
        let reply = self.conn.wait_for_reply(cookie).ok()?;
        Some(CursorImage {
            width: reply.width() as u32,
            height: reply.height() as u32,
            xhot: reply.xhot() as u32,
            yhot: reply.yhot() as u32,
            x: reply.x() as i32,
            y: reply.y() as i32,
            pixels: reply.cursor_image().to_vec(),
        })
    }
}
