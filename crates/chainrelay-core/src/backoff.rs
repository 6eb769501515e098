//! Exponential reconnect backoff.
//!
//! Starts at `initial` and doubles after every failed attempt. Growth is
//! unbounded unless a ceiling is configured.

use std::time::Duration;

/// Reconnect backoff state, owned by a channel.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Option<Duration>,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Option<Duration>) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Returns the delay before the next attempt and doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        let doubled = self.current.saturating_mul(2);
        self.current = match self.max {
            Some(max) => doubled.min(max),
            None => doubled,
        };
        delay
    }

    /// Back to `initial` after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// The delay the next call to [`next_delay`](Self::next_delay) returns.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_one_unit() {
        let mut b = Backoff::new(Duration::from_millis(1), None);
        assert_eq!(b.next_delay().as_millis(), 1);
        assert_eq!(b.next_delay().as_millis(), 2);
        assert_eq!(b.next_delay().as_millis(), 4);
        assert_eq!(b.next_delay().as_millis(), 8);
        assert_eq!(b.attempts(), 4);
    }

    #[test]
    fn unbounded_by_default() {
        let mut b = Backoff::new(Duration::from_millis(1), None);
        for _ in 0..30 {
            b.next_delay();
        }
        assert!(b.current() > Duration::from_secs(3600));
    }

    #[test]
    fn ceiling_caps_growth() {
        let mut b = Backoff::new(Duration::from_millis(100), Some(Duration::from_millis(500)));
        for _ in 0..10 {
            assert!(b.next_delay() <= Duration::from_millis(500));
        }
    }

    #[test]
    fn reset_restores_initial() {
        let mut b = Backoff::new(Duration::from_millis(10), None);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.current(), Duration::from_millis(10));
        assert_eq!(b.attempts(), 0);
    }
}
