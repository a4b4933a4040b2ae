//! Process-wide tuning knobs.
//!
//! Keeping these values in one place makes it clear which parts of the
//! pipeline share behaviour (window geometry, the RT drop valve, the
//! priority-occupy deadline) and gives a single knob to turn when limits
//! need tightening.

use std::sync::atomic::{AtomicU64, Ordering};

/// Span of the second-resolution metric used for admission decisions.
pub const SECOND_WINDOW_MS: u64 = 1000;
/// Buckets in the second-resolution metric.
pub const SECOND_SAMPLE_COUNT: usize = 2;
/// Span of the minute-resolution metric used for totals and display.
pub const MINUTE_WINDOW_MS: u64 = 60_000;
/// Buckets in the minute-resolution metric (one per second).
pub const MINUTE_SAMPLE_COUNT: usize = 60;

/// Response times above this are recorded as this value.
pub const RT_DROP_VALVE_MS: u64 = 4900;

/// Hard cap on distinct resources carrying a slot chain; admissions beyond
/// it bypass rule checking entirely.
pub const MAX_CHAIN_COUNT: usize = 6000;
/// Hard cap on distinct named contexts; entering beyond it yields the null
/// context, which short-circuits all checks.
pub const MAX_CONTEXT_COUNT: usize = 2000;

/// Context auto-entered when admission happens outside any named context.
pub const DEFAULT_CONTEXT_NAME: &str = "tollgate_default_context";

/// Cold factor of the warm-up shaping curve.
pub const DEFAULT_COLD_FACTOR: u32 = 3;

static OCCUPY_TIMEOUT_MS: AtomicU64 = AtomicU64::new(500);

/// Longest sleep the priority-occupy path may take before rejecting.
pub fn occupy_timeout_ms() -> u64 {
    OCCUPY_TIMEOUT_MS.load(Ordering::Relaxed)
}

/// Update the priority-occupy deadline. Values beyond the second window
/// would let a borrow reach past the sliding interval, so they are refused.
pub fn set_occupy_timeout_ms(timeout_ms: u64) {
    if timeout_ms > SECOND_WINDOW_MS {
        log::warn!(
            "ignoring occupy timeout {timeout_ms} ms: exceeds the {SECOND_WINDOW_MS} ms window"
        );
        return;
    }
    OCCUPY_TIMEOUT_MS.store(timeout_ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupy_timeout_rejects_values_beyond_window() {
        let before = occupy_timeout_ms();
        set_occupy_timeout_ms(SECOND_WINDOW_MS + 1);
        assert_eq!(occupy_timeout_ms(), before);
    }
}
