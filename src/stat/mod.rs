//! Sliding-window statistics engine.
//!
//! The primitive is a fixed ring of time buckets ([`ring::BucketRing`])
//! rotated in place with an atomic fast path and a tiny per-ring lock for
//! stale resets. [`metric::SlidingMetric`] composes a main ring with an
//! optional future ring so prioritized admissions can borrow quota from
//! windows that have not arrived yet.

pub mod bucket;
pub mod cache;
pub mod metric;
pub mod ring;

pub use bucket::{MetricBucket, MetricEvent};
pub use cache::LruCounterMap;
pub use metric::{MetricSample, SlidingMetric};
pub use ring::{BucketRing, RingBucket, WindowBucket};
