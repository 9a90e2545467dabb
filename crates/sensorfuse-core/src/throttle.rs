//! Rate limiting for bursty value streams.
//!
//! A [`Throttle`] passes at most one value per interval. Values submitted
//! inside the interval replace a single pending slot that the caller can
//! [`flush`](Throttle::flush) later, so the most recent value is never lost.
//! Callers that want the trailing value without waiting for the next
//! submission sleep until [`Throttle::next_due`] and call
//! [`Throttle::flush_due`].
//!
//! # Thread Safety
//!
//! The whole state sits behind one `Mutex`, so the check of the emission
//! clock and its update happen atomically. Two concurrent submissions can
//! never both be treated as the first past the interval.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Counters reported by [`Throttle::statistics`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleStats {
    /// Values passed to `submit`.
    pub submissions: u64,
    /// Values returned by `submit` or `flush`.
    pub emissions: u64,
    /// `1 - emissions / submissions`, or `0.0` before any submission.
    pub drop_rate: f64,
}

#[derive(Debug)]
struct ThrottleInner<T> {
    last_emission: Option<Instant>,
    pending: Option<T>,
    submissions: u64,
    emissions: u64,
}

impl<T> Default for ThrottleInner<T> {
    fn default() -> Self {
        Self {
            last_emission: None,
            pending: None,
            submissions: 0,
            emissions: 0,
        }
    }
}

/// Minimum-interval rate limiter.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sensorfuse_core::Throttle;
///
/// let throttle = Throttle::new(Duration::from_millis(100));
/// assert_eq!(throttle.submit(1), Some(1));
/// assert_eq!(throttle.submit(2), None);
/// assert_eq!(throttle.submit(3), None);
/// assert_eq!(throttle.flush(), Some(3));
/// ```
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    inner: Mutex<ThrottleInner<T>>,
}

impl<T> Throttle<T> {
    /// Create a throttle. A zero interval emits every submission.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(ThrottleInner::default()),
        }
    }

    /// Create a throttle emitting at most `per_second` values per second.
    /// Zero disables throttling.
    pub fn per_second(per_second: u32) -> Self {
        if per_second == 0 {
            Self::new(Duration::ZERO)
        } else {
            Self::new(Duration::from_secs(1) / per_second)
        }
    }

    /// Configured minimum interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a value.
    ///
    /// Returns the value if at least one interval has passed since the last
    /// emission; otherwise stores it as pending (replacing any earlier
    /// pending value) and returns `None`.
    pub fn submit(&self, value: T) -> Option<T> {
        self.submit_at(value, Instant::now())
    }

    fn submit_at(&self, value: T, now: Instant) -> Option<T> {
        let mut inner = self.lock();
        inner.submissions += 1;

        let due = inner
            .last_emission
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            inner.last_emission = Some(now);
            inner.pending = None;
            inner.emissions += 1;
            Some(value)
        } else {
            inner.pending = Some(value);
            None
        }
    }

    /// Take the pending value, if any. Does not touch the emission clock.
    pub fn flush(&self) -> Option<T> {
        let mut inner = self.lock();
        let pending = inner.pending.take();
        if pending.is_some() {
            inner.emissions += 1;
        }
        pending
    }

    /// Take the pending value if a full interval has passed since the last
    /// emission. Counts as a regular emission and restarts the interval.
    pub fn flush_due(&self) -> Option<T> {
        self.flush_due_at(Instant::now())
    }

    fn flush_due_at(&self, now: Instant) -> Option<T> {
        let mut inner = self.lock();
        let due = inner
            .last_emission
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        let pending = inner.pending.take()?;
        inner.last_emission = Some(now);
        inner.emissions += 1;
        Some(pending)
    }

    /// When the pending value becomes due, or `None` with nothing pending.
    pub fn next_due(&self) -> Option<Instant> {
        let inner = self.lock();
        inner.pending.as_ref()?;
        Some(
            inner
                .last_emission
                .map_or_else(Instant::now, |last| last + self.interval),
        )
    }

    /// Whether a value is waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Submission and emission counters.
    pub fn statistics(&self) -> ThrottleStats {
        let inner = self.lock();
        let drop_rate = if inner.submissions == 0 {
            0.0
        } else {
            1.0 - inner.emissions as f64 / inner.submissions as f64
        };
        ThrottleStats {
            submissions: inner.submissions,
            emissions: inner.emissions,
            drop_rate,
        }
    }

    /// Clear the pending value and counters. The next submission emits
    /// immediately.
    pub fn reset(&self) {
        *self.lock() = ThrottleInner::default();
    }
}


/// Property-based tests for the emission bound.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Emissions inside any window of length W number at most ceil(W/I) + 1.
        #[test]
        fn emissions_bounded_per_window(
            interval_ms in 1u64..50,
            gaps in proptest::collection::vec(0u64..40, 1..200),
            window_ms in 1u64..500,
            trailing in any::<bool>(),
        ) {
            let throttle = Throttle::new(Duration::from_millis(interval_ms));
            let start = Instant::now();
            let mut offset = 0u64;
            let mut emitted_at = Vec::new();
            for gap in gaps {
                offset += gap;
                let now = start + Duration::from_millis(offset);
                if trailing && throttle.flush_due_at(now).is_some() {
                    emitted_at.push(offset);
                }
                if throttle.submit_at(offset, now).is_some() {
                    emitted_at.push(offset);
                }
            }

            let bound = window_ms.div_ceil(interval_ms) as usize + 1;
            for (i, first) in emitted_at.iter().enumerate() {
                let in_window = emitted_at[i..]
                    .iter()
                    .take_while(|t| **t <= first + window_ms)
                    .count();
                prop_assert!(in_window <= bound);
            }
        }
    }
}
