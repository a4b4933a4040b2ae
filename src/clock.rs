//! Millisecond clock for window arithmetic.
//!
//! All statistics are bucketed on a monotonic millisecond timeline anchored
//! at the first use in this process. Window code takes explicit `now_ms`
//! parameters so tests can drive time; production callers read [`now_ms`].

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on the process-wide monotonic timeline.
pub fn now_ms() -> u64 {
    let anchor = *ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_millis() as u64
}

pub(crate) fn sleep_ms(ms: u64) {
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 4);
    }
}
