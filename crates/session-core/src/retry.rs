//! Bounded exponential backoff shared by signaling reconnects and segment
//! uploads.

use std::time::Duration;

/// Initial delay before the first signaling reconnect.
pub const SIGNALING_INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum delay between signaling reconnects.
pub const SIGNALING_MAX_BACKOFF_MS: u64 = 30_000;

/// Maximum delay between upload retries.
pub const UPLOAD_MAX_BACKOFF_MS: u64 = 8000;

/// Doubling delay, capped, with a bounded number of retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    retries: u32,
    max_retries: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            current: initial,
            retries: 0,
            max_retries,
        }
    }

    /// 1s, 2s, 4s, ... capped at 30s.
    #[must_use]
    pub fn signaling(max_retries: u32) -> Self {
        Self::new(
            Duration::from_millis(SIGNALING_INITIAL_BACKOFF_MS),
            Duration::from_millis(SIGNALING_MAX_BACKOFF_MS),
            max_retries,
        )
    }

    /// `initial`, doubled per retry, capped at 8s. `max_attempts` includes the
    /// first try.
    #[must_use]
    pub fn upload(initial: Duration, max_attempts: u32) -> Self {
        Self::new(
            initial,
            Duration::from_millis(UPLOAD_MAX_BACKOFF_MS),
            max_attempts.saturating_sub(1),
        )
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Retries handed out so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.retries = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_schedule_doubles_and_caps() {
        let mut backoff = Backoff::signaling(7);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.retries(), 7);
    }

    #[test]
    fn test_upload_schedule_counts_first_attempt() {
        let mut backoff = Backoff::upload(Duration::from_millis(500), 3);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_upload_cap() {
        let mut backoff = Backoff::upload(Duration::from_secs(3), 5);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(8),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::signaling(2);
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut backoff = Backoff::upload(Duration::from_millis(500), 1);
        assert!(backoff.next_delay().is_none());
    }
}
