//! Wall-clock sources
//!
//! Freshness windows are the only values in the engine that depend on the
//! time at which a response is produced, so every read of "now" goes through
//! a [`Clock`]. Production uses [`SystemClock`]; tests pin time with
//! [`ManualClock`].

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// A clock source that guarantees monotonically increasing timestamps.
///
/// A wall clock stepping backwards (NTP adjustment) would otherwise shorten
/// a `valid_until` already handed to a cache for the same data.
#[derive(Debug, Default)]
pub struct SystemClock {
    /// High-water mark: the largest timestamp we've ever returned (nanos)
    high_water_ns: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock has gone backward, returns the previous
    /// high-water mark + 1ns instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ns: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now_ns
            .store(now.timestamp_nanos_opt().unwrap_or(0), Ordering::Release);
    }

    pub fn advance(&self, by: chrono::Duration) {
        let delta = by.num_nanoseconds().unwrap_or(i64::MAX);
        self.now_ns.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_ns.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_monotonic_increasing() {
        let clock = SystemClock::new();
        let mut prev = 0i64;
        for _ in 0..100 {
            let ts = clock.now_nanos();
            assert!(ts > prev, "timestamps must be strictly increasing");
            prev = ts;
        }
    }

    #[test]
    fn test_now_returns_valid_datetime() {
        let clock = SystemClock::new();
        // Should be a reasonable time (after 2020)
        assert!(clock.now().timestamp() > 1_577_836_800);
    }

    #[test]
    fn test_concurrent_monotonicity() {
        use std::sync::Arc;
        let clock = Arc::new(SystemClock::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let c = clock.clone();
            handles.push(std::thread::spawn(move || {
                let mut prev = 0i64;
                for _ in 0..1000 {
                    let ts = c.now_nanos();
                    assert!(ts > prev);
                    prev = ts;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
