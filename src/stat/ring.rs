//! Fixed ring of time buckets rotated in place.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Marks a slot that has never been claimed by any window.
const EMPTY_WINDOW: u64 = u64::MAX;

/// Counter payload stored in a ring slot. `reset` is called only while the
/// owning ring holds its rotation lock.
pub trait RingBucket: Send + Sync {
    fn new_empty() -> Self;
    fn reset(&self);
}

/// A bucket plus the start of the window it currently represents.
#[derive(Debug)]
pub struct WindowBucket<T> {
    window_start: AtomicU64,
    value: T,
}

impl<T: RingBucket> WindowBucket<T> {
    fn with_start(start: u64) -> Self {
        Self {
            window_start: AtomicU64::new(start),
            value: T::new_empty(),
        }
    }

    pub fn window_start(&self) -> u64 {
        self.window_start.load(Ordering::Acquire)
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

/// Ring of `sample_count` buckets covering `interval_ms`, each bucket
/// spanning `interval_ms / sample_count`.
///
/// Rotation contract: claiming an empty slot is a single CAS; resetting a
/// stale slot happens under the ring's rotation lock; a slot whose window
/// start lies in the future of the requested time (the clock went backward)
/// yields a detached bucket that is never written back, so readers cannot
/// observe data from the future.
#[derive(Debug)]
pub struct BucketRing<T> {
    window_ms: u64,
    interval_ms: u64,
    sample_count: usize,
    slots: Vec<Arc<WindowBucket<T>>>,
    rotation_lock: Mutex<()>,
}

impl<T: RingBucket> BucketRing<T> {
    pub fn new(sample_count: usize, interval_ms: u64) -> Self {
        assert!(sample_count > 0, "bucket count must be positive");
        assert!(interval_ms > 0, "window interval must be positive");
        assert!(
            interval_ms % sample_count as u64 == 0,
            "interval must divide evenly into buckets"
        );
        let slots = (0..sample_count)
            .map(|_| Arc::new(WindowBucket::with_start(EMPTY_WINDOW)))
            .collect();
        Self {
            window_ms: interval_ms / sample_count as u64,
            interval_ms,
            sample_count,
            slots,
            rotation_lock: Mutex::new(()),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn interval_sec(&self) -> f64 {
        self.interval_ms as f64 / 1000.0
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn slot_index(&self, time_ms: u64) -> usize {
        ((time_ms / self.window_ms) % self.sample_count as u64) as usize
    }

    pub fn window_start_of(&self, time_ms: u64) -> u64 {
        time_ms - time_ms % self.window_ms
    }

    /// A bucket is stale once it has fallen a full interval behind.
    pub fn is_stale(&self, now_ms: u64, bucket: &WindowBucket<T>) -> bool {
        let start = bucket.window_start();
        start == EMPTY_WINDOW || now_ms.saturating_sub(start) > self.interval_ms
    }

    /// Bucket for the window containing `time_ms`, rotating as needed.
    pub fn current_bucket(&self, time_ms: u64) -> Arc<WindowBucket<T>> {
        self.current_bucket_with(time_ms, |_, _| {})
    }

    /// Like [`Self::current_bucket`], invoking `on_rotate(value, start)`
    /// whenever the returned bucket was freshly claimed, reset, or detached
    /// (i.e. whenever its counters were just zeroed for this window).
    pub fn current_bucket_with(
        &self,
        time_ms: u64,
        on_rotate: impl Fn(&T, u64),
    ) -> Arc<WindowBucket<T>> {
        let idx = self.slot_index(time_ms);
        let expected = self.window_start_of(time_ms);
        loop {
            let bucket = &self.slots[idx];
            let start = bucket.window_start();
            if start == EMPTY_WINDOW {
                if bucket
                    .window_start
                    .compare_exchange(EMPTY_WINDOW, expected, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    on_rotate(&bucket.value, expected);
                    return Arc::clone(bucket);
                }
                std::thread::yield_now();
            } else if start == expected {
                return Arc::clone(bucket);
            } else if start < expected {
                if let Some(_guard) = self.rotation_lock.try_lock() {
                    // Re-check: another thread may have rotated while we
                    // were acquiring the lock.
                    if bucket.window_start() == expected {
                        return Arc::clone(bucket);
                    }
                    bucket.value.reset();
                    bucket.window_start.store(expected, Ordering::Release);
                    on_rotate(&bucket.value, expected);
                    return Arc::clone(bucket);
                }
                std::thread::yield_now();
            } else {
                // Clock went backward past this slot's window.
                let detached = Arc::new(WindowBucket::with_start(expected));
                on_rotate(&detached.value, expected);
                return detached;
            }
        }
    }

    /// Bucket holding data for the window containing `time_ms`, without
    /// rotating. Returns `None` when the slot was recycled for some other
    /// window.
    pub fn bucket_at(&self, time_ms: u64) -> Option<Arc<WindowBucket<T>>> {
        let bucket = &self.slots[self.slot_index(time_ms)];
        if bucket.window_start() == self.window_start_of(time_ms) {
            Some(Arc::clone(bucket))
        } else {
            None
        }
    }

    /// Bucket for the window immediately before the one containing
    /// `now_ms`, if it still holds that window's data.
    pub fn previous_bucket(&self, now_ms: u64) -> Option<Arc<WindowBucket<T>>> {
        let previous = now_ms.checked_sub(self.window_ms)?;
        let bucket = self.bucket_at(previous)?;
        if self.is_stale(now_ms, &bucket) {
            None
        } else {
            Some(bucket)
        }
    }

    /// Visit every non-stale bucket.
    pub fn for_each_valid(&self, now_ms: u64, mut visit: impl FnMut(&T)) {
        for bucket in &self.slots {
            if !self.is_stale(now_ms, bucket) {
                visit(&bucket.value);
            }
        }
    }

    /// Visit every claimed bucket with its window start, stale or not.
    pub fn for_each_present(&self, mut visit: impl FnMut(u64, &T)) {
        for bucket in &self.slots {
            let start = bucket.window_start();
            if start != EMPTY_WINDOW {
                visit(start, &bucket.value);
            }
        }
    }

    /// Number of claimed buckets whose data is stale at `now_ms`. Together
    /// with the valid buckets these account for the covered interval.
    pub fn stale_count(&self, now_ms: u64) -> usize {
        self.slots
            .iter()
            .filter(|bucket| {
                let start = bucket.window_start();
                start != EMPTY_WINDOW && now_ms.saturating_sub(start) > self.interval_ms
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug)]
    struct Counter(AtomicU64);

    impl RingBucket for Counter {
        fn new_empty() -> Self {
            Counter(AtomicU64::new(0))
        }

        fn reset(&self) {
            self.0.store(0, Ordering::Relaxed);
        }
    }

    impl Counter {
        fn add(&self, n: u64) {
            self.0.fetch_add(n, Ordering::Relaxed);
        }

        fn get(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn buckets_rotate_onto_new_windows() {
        let ring: BucketRing<Counter> = BucketRing::new(2, 1000);

        ring.current_bucket(100).value().add(5);
        assert_eq!(ring.current_bucket(200).value().get(), 5);

        // Same slot index two intervals later: the slot is recycled clean.
        ring.current_bucket(2100).value().add(1);
        assert_eq!(ring.current_bucket(2100).value().get(), 1);
    }

    #[test]
    fn backward_clock_yields_detached_bucket() {
        let ring: BucketRing<Counter> = BucketRing::new(2, 1000);
        ring.current_bucket(2100).value().add(9);

        // Same slot, but an earlier window: must not expose future data.
        let detached = ring.current_bucket(100);
        assert_eq!(detached.value().get(), 0);
        detached.value().add(3);
        // And the live slot is untouched.
        assert_eq!(ring.current_bucket(2100).value().get(), 9);
    }

    #[test]
    fn valid_iteration_skips_stale_buckets() {
        let ring: BucketRing<Counter> = BucketRing::new(2, 1000);
        ring.current_bucket(0).value().add(7);
        ring.current_bucket(500).value().add(2);

        let mut sum = 0;
        ring.for_each_valid(600, |c| sum += c.get());
        assert_eq!(sum, 9);

        // 5 seconds later both buckets are stale.
        sum = 0;
        ring.for_each_valid(5600, |c| sum += c.get());
        assert_eq!(sum, 0);
        assert_eq!(ring.stale_count(5600), 2);
    }

    #[test]
    fn previous_bucket_respects_staleness() {
        let ring: BucketRing<Counter> = BucketRing::new(2, 1000);
        ring.current_bucket(400).value().add(4);

        let prev = ring.previous_bucket(900).expect("previous window live");
        assert_eq!(prev.value().get(), 4);
        assert!(ring.previous_bucket(5400).is_none());
    }

    #[test]
    fn concurrent_claims_agree_on_one_bucket() {
        let ring = Arc::new(BucketRing::<Counter>::new(4, 2000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    ring.current_bucket(750).value().add(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.current_bucket(750).value().get(), 8000);
    }
}
