//! vidtap shm - the shared-memory frame ring
//!
//! The consumer process creates one main segment (header + per-slot
//! descriptors) and one payload segment per ring slot; the in-process grabber
//! attaches to all of them by SysV id. Frames flow through a lock-free
//! single-producer/single-consumer ring whose indices live in the header.

pub mod layout;
pub mod ring;
pub mod segment;
pub mod session;

pub use layout::{FrameDescriptor, MainView, ShmHeader};
pub use ring::RingControl;
pub use segment::{AttachedSegment, OwnedSegment};
pub use session::CaptureSession;
