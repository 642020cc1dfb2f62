//! Retry delays with exponential backoff

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after every wait
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Exponential backoff between retries of a failing operation
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next attempt
    ///
    /// Returns `false` without waiting out the delay if `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        self.attempt += 1;

        debug!(
            "Waiting {:?} before retry attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = sleep(self.current_backoff) => {}
        }

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        true
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(config());

        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));

        for expected in [20, 40, 80, 100, 100] {
            assert!(backoff.wait(&cancel).await);
            assert_eq!(backoff.current_backoff(), Duration::from_millis(expected));
        }
        assert_eq!(backoff.attempt(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(config());

        backoff.wait(&cancel).await;
        backoff.wait(&cancel).await;
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut backoff = Backoff::new(BackoffConfig {
            initial_backoff: Duration::from_secs(3600),
            ..Default::default()
        });

        let waited = tokio::time::timeout(Duration::from_secs(1), backoff.wait(&cancel))
            .await
            .unwrap();
        assert!(!waited);
        // The delay does not grow on a cancelled wait
        assert_eq!(backoff.current_backoff(), Duration::from_secs(3600));
    }
}
