//! vidtap core - shared types for the capture and muxing crates
//!
//! This crate provides the foundational types used across all vidtap
//! components: the error enum, the capture configuration, the consumer-facing
//! frame type and the monotonic clock.

pub mod config;
pub mod error;
pub mod frame;
pub mod time;

pub use config::{CaptureConfig, HotkeyBinding};
pub use error::{Error, Result};
pub use frame::Frame;
pub use time::monotonic_micros;
