//! Clock helpers shared across the workspace.
//!
//! All durable rows carry microsecond timestamps; components that need
//! testable time take `now_us` as an argument and only fall back to the
//! wall clock at their outermost entry points.

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_us_is_monotonic_enough() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[test]
    fn test_now_us_is_after_2020() {
        // 2020-01-01 in microseconds.
        assert!(now_us() > 1_577_836_800_000_000);
    }
}
