//! Backoff timing for restarted watch streams and retried registry calls.
use std::time::Duration;

use rand::Rng;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// Exponential backoff with jitter on the first step.
///
/// The initial delay lands between `base` and `2 * base` so that a crowd of
/// watchers dropped by the same apiserver restart does not reconnect in
/// lockstep; each following delay doubles until hitting the cap.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// The watch-stream defaults: 100-200 ms initial, capped at 5 s.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl ExponentialBackoffStrategy {
    /// A strategy starting at `base` (with jitter) and capped at `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base_duration: base,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration.mul_f64(rand::thread_rng().gen_range(1.0..2.0))
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_backoff_is_within_jitter_window() {
        let mut backoff = ExponentialBackoffStrategy::default();
        let first = backoff.next_duration();
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(200));
    }

    #[test]
    fn backoff_doubles_each_time() {
        let mut backoff = ExponentialBackoffStrategy::default();
        let first = backoff.next_duration();
        assert_eq!(backoff.next_duration(), first * 2);
        assert_eq!(backoff.next_duration(), first * 4);
    }

    #[test]
    fn backoff_is_capped_at_5_seconds() {
        let mut backoff = ExponentialBackoffStrategy::default();
        for _ in 0..16 {
            backoff.next_duration();
        }
        assert_eq!(backoff.next_duration(), Duration::from_secs(5));
    }

    #[test]
    fn after_reset_backoff_starts_over() {
        let mut backoff = ExponentialBackoffStrategy::default();
        for _ in 0..8 {
            backoff.next_duration();
        }
        backoff.reset();
        assert!(backoff.next_duration() <= Duration::from_millis(200));
    }
}
