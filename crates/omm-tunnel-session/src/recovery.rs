//! Fixed-interval recovery timer

use std::time::{Duration, Instant};
use tracing::debug;

/// Decides when a closed consumer session may try to reopen
///
/// Time is supplied by the caller once per dispatch; the timer never
/// sleeps. Attempts are spaced by a constant interval.
#[derive(Debug, Clone)]
pub struct RecoveryTimer {
    interval: Duration,
    next_attempt: Option<Instant>,
    suspended: bool,
    attempt: usize,
}

impl RecoveryTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_attempt: None,
            suspended: false,
            attempt: 0,
        }
    }

    /// Record an attempt made at `now`; the next one is due an interval later
    pub fn schedule(&mut self, now: Instant) {
        self.attempt += 1;
        self.next_attempt = Some(now + self.interval);

        debug!(
            "Next recovery attempt in {}s (attempt {})",
            self.interval.as_secs(),
            self.attempt
        );
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.suspended && self.next_attempt.map_or(true, |at| now >= at)
    }

    /// Make an attempt due immediately
    pub fn make_due(&mut self) {
        self.next_attempt = None;
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Reset after a successful open
    pub fn reset(&mut self) {
        self.next_attempt = None;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval() {
        let start = Instant::now();
        let mut timer = RecoveryTimer::new(Duration::from_secs(5));

        assert!(timer.is_due(start));

        timer.schedule(start);
        assert!(!timer.is_due(start + Duration::from_secs(4)));
        assert!(timer.is_due(start + Duration::from_secs(5)));

        let later = start + Duration::from_secs(5);
        timer.schedule(later);
        assert_eq!(timer.next_attempt(), Some(later + Duration::from_secs(5)));
        assert_eq!(timer.attempt(), 2);
    }

    #[test]
    fn test_suspend_and_resume() {
        let start = Instant::now();
        let mut timer = RecoveryTimer::new(Duration::from_secs(1));

        timer.schedule(start);
        timer.suspend();
        assert!(!timer.is_due(start + Duration::from_secs(10)));

        timer.resume();
        timer.make_due();
        assert!(timer.is_due(start));
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let mut timer = RecoveryTimer::new(Duration::from_secs(1));

        timer.schedule(start);
        timer.reset();
        assert_eq!(timer.attempt(), 0);
        assert!(timer.is_due(start));
    }
}
