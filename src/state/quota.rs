//! Remaining-call budget for one credential
//!
//! The tracker is the single owner of quota knowledge. Every partition that
//! shares a credential holds an `Arc<QuotaTracker>`; updates go through a
//! short critical section so concurrent snapshots are applied one at a time.

use crate::state::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Quota signal carried by one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Calls left in the current window
    pub remaining: u32,

    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    pub fn new(remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            remaining,
            reset_at,
        }
    }

    /// Chooses between two snapshots: later reset wins, ties keep the lower count
    fn merge(self, incoming: QuotaSnapshot) -> QuotaSnapshot {
        if incoming.reset_at > self.reset_at {
            incoming
        } else if incoming.reset_at == self.reset_at {
            QuotaSnapshot {
                remaining: self.remaining.min(incoming.remaining),
                reset_at: self.reset_at,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Default)]
struct QuotaState {
    window: Option<QuotaSnapshot>,
    /// Server-requested pause (`retry-after`), independent of the window
    hold_until: Option<DateTime<Utc>>,
}

impl QuotaState {
    fn pause_duration(&self, now: DateTime<Utc>, reserve_threshold: u32) -> Option<Duration> {
        let window_end = self
            .window
            .filter(|w| w.remaining <= reserve_threshold && now < w.reset_at)
            .map(|w| w.reset_at);
        let hold_end = self.hold_until.filter(|until| now < *until);

        let until = match (window_end, hold_end) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        (until - now).to_std().ok()
    }
}

/// Tracks the quota of a single credential
#[derive(Debug)]
pub struct QuotaTracker {
    label: String,
    reserve_threshold: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<QuotaState>,
}

impl QuotaTracker {
    /// Creates a tracker with no quota knowledge yet
    ///
    /// # Arguments
    ///
    /// * `label` - Credential label used in logs
    /// * `reserve_threshold` - Remaining calls at or below which callers pause
    /// * `clock` - Time source compared against the reset instant
    pub fn new(label: impl Into<String>, reserve_threshold: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            label: label.into(),
            reserve_threshold,
            clock,
            state: Mutex::new(QuotaState::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remaining calls, or `None` before the first snapshot
    pub fn remaining(&self) -> Option<u32> {
        self.lock().window.map(|s| s.remaining)
    }

    /// Reset instant, or `None` before the first snapshot
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.lock().window.map(|s| s.reset_at)
    }

    /// Current combined view
    pub fn snapshot(&self) -> Option<QuotaSnapshot> {
        self.lock().window
    }

    /// Applies a snapshot from a response
    ///
    /// A snapshot with an earlier reset than the one held is ignored; for the
    /// same reset the smaller remaining count is kept. Returns the state after
    /// the update.
    pub fn record(&self, snapshot: QuotaSnapshot) -> QuotaSnapshot {
        let mut state = self.lock();
        let merged = match state.window {
            Some(current) => current.merge(snapshot),
            None => snapshot,
        };
        state.window = Some(merged);
        merged
    }

    /// Blocks calls until `until`, whatever the window says
    ///
    /// Used for `retry-after`; a later hold replaces an earlier one.
    pub fn hold_until(&self, until: DateTime<Utc>) {
        let mut state = self.lock();
        if state.hold_until.map_or(true, |current| until > current) {
            state.hold_until = Some(until);
        }
    }


    /// Charges one call if no pause is needed, in a single critical section
    ///
    /// Returns the wait otherwise, so concurrent callers on one credential
    /// cannot both slip past the reserve.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut state = self.lock();

        if let Some(wait) = state.pause_duration(now, self.reserve_threshold) {
            return Err(wait);
        }
        if let Some(window) = state.window.as_mut() {
            window.remaining = window.remaining.saturating_sub(1);
        }
        Ok(())
    }

    /// True when the budget is down to the reserve and the window has not
    /// reset, or a server-requested hold is still running
    pub fn should_pause(&self) -> bool {
        self.pause_duration().is_some()
    }

    /// How long to wait, if a pause is needed right now
    pub fn pause_duration(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock().pause_duration(now, self.reserve_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::clock::SystemClock;
    use chrono::Duration as ChronoDuration;

    fn tracker(reserve: u32) -> QuotaTracker {
        QuotaTracker::new("token-1", reserve, Arc::new(SystemClock))
    }

    #[test]
    fn test_unknown_quota_never_pauses() {
        let t = tracker(5);
        assert_eq!(t.remaining(), None);
        assert!(!t.should_pause());
        assert!(t.try_acquire().is_ok());
        assert_eq!(t.remaining(), None);
    }

    #[test]
    fn test_older_snapshot_is_ignored() {
        let t = tracker(5);
        let now = Utc::now();

        t.record(QuotaSnapshot::new(4000, now + ChronoDuration::minutes(30)));
        t.record(QuotaSnapshot::new(10, now + ChronoDuration::minutes(10)));

        assert_eq!(t.remaining(), Some(4000));
        assert_eq!(t.reset_at(), Some(now + ChronoDuration::minutes(30)));
    }

    #[test]
    fn test_newer_window_replaces_state() {
        let t = tracker(5);
        let now = Utc::now();

        t.record(QuotaSnapshot::new(2, now + ChronoDuration::minutes(1)));
        t.record(QuotaSnapshot::new(5000, now + ChronoDuration::minutes(61)));

        assert_eq!(t.remaining(), Some(5000));
    }

    #[test]
    fn test_same_window_keeps_lower_remaining() {
        let t = tracker(5);
        let reset = Utc::now() + ChronoDuration::minutes(20);

        t.record(QuotaSnapshot::new(300, reset));
        t.record(QuotaSnapshot::new(500, reset));
        assert_eq!(t.remaining(), Some(300));

        t.record(QuotaSnapshot::new(120, reset));
        assert_eq!(t.remaining(), Some(120));
    }

    #[test]
    fn test_acquire_stops_at_empty_window() {
        let t = tracker(0);
        t.record(QuotaSnapshot::new(1, Utc::now() + ChronoDuration::minutes(5)));

        assert!(t.try_acquire().is_ok());
        assert!(t.try_acquire().is_err());
        assert_eq!(t.remaining(), Some(0));
    }

    #[test]
    fn test_acquire_after_reset_saturates() {
        let t = tracker(0);
        t.record(QuotaSnapshot::new(0, Utc::now() - ChronoDuration::minutes(1)));

        assert!(t.try_acquire().is_ok());
        assert_eq!(t.remaining(), Some(0));
    }

    #[test]
    fn test_should_pause_at_reserve_before_reset() {
        let t = tracker(3);
        t.record(QuotaSnapshot::new(4, Utc::now() + ChronoDuration::minutes(5)));
        assert!(!t.should_pause());

        t.try_acquire().unwrap();
        assert!(t.should_pause());
        let wait = t.pause_duration().unwrap();
        assert!(wait <= Duration::from_secs(300));
        assert!(wait > Duration::from_secs(290));
    }

    #[test]
    fn test_no_pause_once_reset_has_passed() {
        let t = tracker(3);
        t.record(QuotaSnapshot::new(0, Utc::now() - ChronoDuration::seconds(1)));
        assert!(!t.should_pause());
    }

    #[test]
    fn test_hold_survives_a_later_window() {
        let t = tracker(5);
        let now = Utc::now();
        t.record(QuotaSnapshot::new(4000, now + ChronoDuration::hours(1)));

        t.hold_until(now + ChronoDuration::seconds(30));

        assert_eq!(t.remaining(), Some(4000));
        let wait = t.pause_duration().unwrap();
        assert!(wait <= Duration::from_secs(30));
        assert!(wait > Duration::from_secs(25));
    }

    #[test]
    fn test_earlier_hold_does_not_shorten_pause() {
        let t = tracker(5);
        let now = Utc::now();

        t.hold_until(now + ChronoDuration::seconds(60));
        t.hold_until(now + ChronoDuration::seconds(10));

        assert!(t.pause_duration().unwrap() > Duration::from_secs(50));
    }

    #[test]
    fn test_expired_hold_is_ignored() {
        let t = tracker(5);
        t.hold_until(Utc::now() - ChronoDuration::seconds(1));
        assert!(!t.should_pause());
        assert_eq!(t.try_acquire(), Ok(()));
    }

    #[test]
    fn test_try_acquire_charges_until_reserve() {
        let t = tracker(5);
        t.record(QuotaSnapshot::new(7, Utc::now() + ChronoDuration::minutes(5)));

        assert_eq!(t.try_acquire(), Ok(()));
        assert_eq!(t.try_acquire(), Ok(()));
        assert_eq!(t.remaining(), Some(5));

        assert!(t.try_acquire().is_err());
        assert_eq!(t.remaining(), Some(5));
    }

    #[test]
    fn test_concurrent_acquires_never_pass_reserve() {
        let t = Arc::new(tracker(5));
        t.record(QuotaSnapshot::new(6, Utc::now() + ChronoDuration::minutes(5)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || t.try_acquire().is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 1);
        assert_eq!(t.remaining(), Some(5));
    }

    #[test]
    fn test_concurrent_records_converge() {
        let t = Arc::new(tracker(5));
        let reset = Utc::now() + ChronoDuration::minutes(10);

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    t.record(QuotaSnapshot::new(100 + i, reset));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(t.remaining(), Some(100));
    }
}
