//! Jittered delay policy.
//!
//! All pacing in the crawl goes through one injected policy, so tests can
//! zero it out and the jitter ranges stay configurable instead of being
//! scattered literals.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Inclusive jitter range in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Draw a duration from the range.
    pub fn sample(&self) -> Duration {
        if self.max_secs <= self.min_secs {
            return Duration::from_secs_f64(self.min_secs.max(0.0));
        }
        let secs = rand::rng().random_range(self.min_secs..=self.max_secs);
        Duration::from_secs_f64(secs)
    }
}

/// Delay ranges per operation class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelayPolicy {
    /// After a listing page renders.
    pub page_load: DelayRange,
    /// After a detail view renders.
    pub detail_load: DelayRange,
    /// Between items on a page.
    pub item: DelayRange,
    /// After advancing the pagination.
    pub pagination: DelayRange,
    /// After scrolling an element into view.
    pub scroll: DelayRange,
    /// After a session reset, before resuming.
    pub session_settle: DelayRange,
    /// Between whole-run retry attempts.
    pub run_retry: DelayRange,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            page_load: DelayRange::new(7.0, 10.0),
            detail_load: DelayRange::new(7.0, 10.0),
            item: DelayRange::new(1.0, 3.0),
            pagination: DelayRange::new(8.0, 12.0),
            scroll: DelayRange::new(1.0, 1.0),
            session_settle: DelayRange::new(2.0, 4.0),
            run_retry: DelayRange::new(10.0, 20.0),
        }
    }
}

impl DelayPolicy {
    /// Policy with every range zeroed, for tests.
    pub fn none() -> Self {
        Self {
            page_load: DelayRange::zero(),
            detail_load: DelayRange::zero(),
            item: DelayRange::zero(),
            pagination: DelayRange::zero(),
            scroll: DelayRange::zero(),
            session_settle: DelayRange::zero(),
            run_retry: DelayRange::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_stays_within_range() {
        let range = DelayRange::new(1.0, 3.0);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn zero_policy_samples_zero() {
        let policy = DelayPolicy::none();
        assert_eq!(policy.item.sample(), Duration::ZERO);
        assert_eq!(policy.pagination.sample(), Duration::ZERO);
    }

    #[test]
    fn degenerate_range_returns_min() {
        let range = DelayRange::new(2.0, 2.0);
        assert_eq!(range.sample(), Duration::from_secs(2));
    }
}
