//! Latest-frame cache shared between the frame reader and HTTP handlers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::capture::Frame;

/// Frames older than this are not served.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

/// A frame and the instant it was captured, published as one unit.
#[derive(Debug)]
pub struct CachedFrame {
    pub frame: Frame,
    pub captured_at: Instant,
}

impl CachedFrame {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    pub fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) < max_age
    }
}

/// Single-slot frame cache. The writer swaps in a new `Arc<CachedFrame>`;
/// readers load it without taking a lock, so they can never observe a frame
/// paired with another frame's timestamp and never stall the writer.
#[derive(Default)]
pub struct FrameCache {
    slot: ArcSwapOption<CachedFrame>,
    published: AtomicU64,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame, captured_at: Instant) {
        self.slot.store(Some(Arc::new(CachedFrame { frame, captured_at })));
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Option<Arc<CachedFrame>> {
        self.slot.load_full()
    }

    /// Snapshot filtered by the staleness rule.
    pub fn fresh_snapshot(&self, now: Instant, max_age: Duration) -> Option<Arc<CachedFrame>> {
        self.snapshot().filter(|cached| cached.is_fresh(now, max_age))
    }

    /// Number of frames published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn empty_cache_has_no_snapshot() {
        let cache = FrameCache::new();
        assert!(cache.snapshot().is_none());
        assert_eq!(cache.published(), 0);
    }

    #[test]
    fn snapshot_returns_last_published_pair() {
        let cache = FrameCache::new();
        let at = Instant::now();
        let frame = Frame::rgb(7, 1, 1, vec![9, 9, 9]);

        cache.publish(frame.clone(), at);

        let cached = cache.snapshot().unwrap();
        assert_eq!(cached.frame, frame);
        assert_eq!(cached.captured_at, at);
    }

    #[test]
    fn staleness_is_judged_by_the_caller() {
        let cache = FrameCache::new();
        let at = Instant::now();
        cache.publish(Frame::rgb(1, 1, 1, vec![0, 0, 0]), at);

        assert!(cache.fresh_snapshot(at + Duration::from_secs(4), STALE_AFTER).is_some());
        assert!(cache.fresh_snapshot(at + Duration::from_secs(6), STALE_AFTER).is_none());
        // exactly STALE_AFTER old is already stale
        assert!(cache.fresh_snapshot(at + STALE_AFTER, STALE_AFTER).is_none());
        assert!(cache
            .fresh_snapshot(at + STALE_AFTER - Duration::from_millis(1), STALE_AFTER)
            .is_some());
        // still there, just stale
        assert!(cache.snapshot().is_some());
    }

    #[test]
    fn concurrent_publishers_never_tear_pairs() {
        let cache = Arc::new(FrameCache::new());
        let base = Instant::now();

        // Each frame's sequence encodes its timestamp offset, so a reader can
        // check that the pair it sees was published together.
        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..2_000u64 {
                        let seq = w * 1_000_000 + i;
                        let byte = (seq % 251) as u8;
                        cache.publish(
                            Frame::rgb(seq, 1, 1, vec![byte; 3]),
                            base + Duration::from_micros(seq),
                        );
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        if let Some(cached) = cache.snapshot() {
                            let seq = cached.frame.meta.sequence;
                            assert_eq!(cached.captured_at, base + Duration::from_micros(seq));
                            assert!(cached.frame.data.iter().all(|&b| b == (seq % 251) as u8));
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(cache.published(), 8_000);
    }
}
