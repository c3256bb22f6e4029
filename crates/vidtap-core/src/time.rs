//! Monotonic clock

/// Current monotonic time in microseconds
///
/// Frame timestamps on both sides of the shared-memory ring come from this
/// clock, so they are comparable across processes on the same machine.
pub fn monotonic_micros() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid timespec pointer
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }

    #[test]
    fn clock_advances() {
        let a = monotonic_micros();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_micros();
        assert!(b - a >= 4_000);
    }
}
