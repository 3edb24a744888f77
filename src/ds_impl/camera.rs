use std::cell::Cell;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

const MIN_BACKOFF: u32 = 1;
const MAX_BACKOFF: u32 = 512;

thread_local! {
    static BACKOFF: Cell<u32> = const { Cell::new(MIN_BACKOFF) };
}

/// Logical clock that stamps node versions and names snapshots.
///
/// A snapshot taken at `ts` sees every version stamped `<= ts`. Taking a
/// snapshot tries to advance the clock so later updates get larger stamps;
/// under contention, threads back off and share a concurrent advance instead
/// of all hammering the same word.
#[derive(Debug, Default)]
pub struct Camera {
    timestamp: CachePadded<AtomicU64>,
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn read(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    pub fn take_snapshot(&self) -> u64 {
        let ts = self.timestamp.load(Ordering::SeqCst);
        let mut amount = BACKOFF.with(Cell::get);
        for _ in 0..amount {
            spin_loop();
        }
        if ts == self.timestamp.load(Ordering::SeqCst) {
            if self
                .timestamp
                .compare_exchange(ts, ts + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                amount /= 2;
            } else {
                amount *= 2;
            }
        }
        BACKOFF.with(|b| b.set(amount.clamp(MIN_BACKOFF, MAX_BACKOFF)));
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::Camera;
    use crossbeam_utils::thread;

    #[test]
    fn snapshot_advances_clock() {
        let camera = Camera::new();
        assert_eq!(camera.read(), 0);
        assert_eq!(camera.take_snapshot(), 0);
        assert_eq!(camera.read(), 1);
        assert_eq!(camera.take_snapshot(), 1);
    }

    #[test]
    fn concurrent_snapshots_are_monotone() {
        let camera = &Camera::new();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(move |_| {
                    let mut last = 0;
                    for _ in 0..10_000 {
                        let ts = camera.take_snapshot();
                        assert!(ts >= last);
                        assert!(camera.read() >= ts);
                        last = ts;
                    }
                });
            }
        })
        .unwrap();
        assert!(camera.read() > 0);
    }
}
