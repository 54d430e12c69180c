//! Tick sources.
//!
//! The cache orders idle buffers for eviction by the time they were last released. It does not
//! care about wall-clock time, only about a monotonically nondecreasing counter to compare release
//! stamps with; this module defines the trait providing that counter and two implementations of
//! it.

use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};
use std::time::Instant;

/// The atomic ordering used throughout the module.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;

/// A clock tick count.
///
/// Ticks are roughly used as a measure for the time passed. The actual unit is irrelevant: ticks
/// are only ever compared against each other, so any monotone source works.
pub type Tick = u64;

/// A monotone tick source.
///
/// `now` shall be nondecreasing across calls, including calls from different threads.
pub trait Clock {
    /// The current tick.
    fn now(&self) -> Tick;
}

// Smart pointers to a clock are themselves clocks. This allows e.g. keeping an `Arc<Ticker>`
// handle on a clock which was moved into a cache.
impl<'a, T: Clock + ?Sized> Clock for &'a T {
    fn now(&self) -> Tick {
        (**self).now()
    }
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now(&self) -> Tick {
        (**self).now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Tick {
        (**self).now()
    }
}

/// A hand-driven tick counter.
///
/// The counter only moves when `tick` is called, which makes the order of releases fully
/// deterministic. This is the clock of choice for tests, and for systems which already have a
/// periodic timer to drive it from.
///
/// # Example
///
/// ```rust
/// use bcache::{Clock, Ticker};
///
/// let ticker = Ticker::new();
/// assert_eq!(ticker.now(), 0);
///
/// ticker.tick();
/// ticker.tick();
/// assert_eq!(ticker.now(), 2);
/// ```
#[derive(Default)]
pub struct Ticker {
    /// The number of ticks so far.
    ticks: AtomicU64,
}

impl Ticker {
    /// Create a new counter starting at tick zero.
    pub fn new() -> Ticker {
        Ticker {
            ticks: AtomicU64::new(0),
        }
    }

    /// Advance the clock by one tick.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, ORDERING);
    }
}

impl Clock for Ticker {
    fn now(&self) -> Tick {
        self.ticks.load(ORDERING)
    }
}

/// A tick source counting milliseconds since its creation.
///
/// This derives ticks from `std::time::Instant`, which is monotone, so the clock satisfies the
/// `Clock` contract without anyone driving it.
pub struct Uptime {
    /// The instant the clock was created.
    epoch: Instant,
}

impl Uptime {
    /// Create a clock whose tick zero is now.
    pub fn new() -> Uptime {
        Uptime {
            epoch: Instant::now(),
        }
    }
}

impl Default for Uptime {
    fn default() -> Uptime {
        Uptime::new()
    }
}

impl Clock for Uptime {
    fn now(&self) -> Tick {
        let elapsed = self.epoch.elapsed();

        elapsed.as_secs() * 1000 + elapsed.subsec_millis() as Tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_counts() {
        let ticker = Ticker::new();
        assert_eq!(ticker.now(), 0);

        for n in 1..100 {
            ticker.tick();
            assert_eq!(ticker.now(), n);
        }
    }

    #[test]
    fn ticker_through_arc() {
        let ticker = Arc::new(Ticker::new());
        let clock: Arc<Ticker> = ticker.clone();

        ticker.tick();
        assert_eq!(clock.now(), 1);
    }

    #[test]
    fn uptime_is_monotone() {
        let clock = Uptime::new();

        let mut last = clock.now();
        for _ in 0..100 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }
}
