//! Frame-rate admission gate
//!
//! Keeps the grab cadence at the target rate. In limit mode the caller is
//! slept until the next deadline (the host's frame loop slows down to the
//! capture rate); otherwise early frames are dropped. The deadline advances
//! by one period per admitted frame but never falls behind the clock, so a
//! stall does not cause a burst of catch-up frames.

use std::time::Duration;
use vidtap_core::monotonic_micros;

pub struct FrameRateGate {
    target_fps: u32,
    limit_fps: bool,
    next_frame_time: i64,
}

impl FrameRateGate {
    pub fn new(target_fps: u32, limit_fps: bool) -> Self {
        Self {
            target_fps,
            limit_fps,
            next_frame_time: monotonic_micros(),
        }
    }

    /// Decide whether a grab at time `now` (monotonic microseconds) may
    /// proceed; returns the admitted timestamp, which is later than `now`
    /// when the gate slept.
    pub fn admit(&mut self, now: i64) -> Option<i64> {
        if self.target_fps == 0 {
            return Some(now);
        }
        let period = 1_000_000 / self.target_fps as i64;

        let mut timestamp = now;
        if timestamp < self.next_frame_time {
            if !self.limit_fps {
                return None;
            }
            std::thread::sleep(Duration::from_micros(
                (self.next_frame_time - timestamp) as u64,
            ));
            timestamp = monotonic_micros();
        }

        self.next_frame_time = (self.next_frame_time + period).max(timestamp);
        Some(timestamp)
    }
}
