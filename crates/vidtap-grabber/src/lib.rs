//! vidtap grabber - in-process frame capture
//!
//! Runs inside an arbitrary GL host process and publishes readback frames
//! into the shared-memory ring created by the consumer. The grabber owns no
//! thread: everything happens on whichever host thread calls
//! [`GrabberCore::grab_frame`], normally right before a buffer swap.
//!
//! The graphics API and the windowing system sit behind the [`gl::GlContext`]
//! and [`window::WindowProbe`] seams so the capture path can be exercised
//! without a live GL context.

pub mod cursor;
pub mod gate;
pub mod gl;
pub mod grabber;
pub mod window;

pub use gate::FrameRateGate;
pub use gl::{DlGl, GlContext};
pub use grabber::{GrabberCore, HotkeyInfo};
pub use window::{CursorImage, WindowProbe, XcbWindowProbe};
