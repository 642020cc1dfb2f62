//! Background refresher publishing the DAU snapshot

use agentgate_proto::GetDausResponse;
use agentgate_relay_db::Store;
use arc_swap::ArcSwapOption;
use chrono::{TimeDelta, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::{Backoff, BackoffConfig};
use crate::fill::fill_empty_dau_days;
use crate::CacheError;

/// Overrides the refresh interval, in milliseconds
pub const METRICS_CACHE_INTERVAL_ENV: &str = "AGENTGATE_METRICS_CACHE_INTERVAL_MS";

/// Refresh scheduling
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Time between successful refreshes
    pub interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Stat rows older than this are deleted before every refresh
    pub retention: TimeDelta,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            retention: TimeDelta::days(30),
        }
    }
}

impl CacheOptions {
    /// Apply [`METRICS_CACHE_INTERVAL_ENV`] if it is set
    pub fn with_env_overrides(self) -> Self {
        match std::env::var(METRICS_CACHE_INTERVAL_ENV) {
            Ok(value) => self.with_interval_override(&value),
            Err(_) => self,
        }
    }

    fn with_interval_override(mut self, value: &str) -> Self {
        match parse_interval_millis(value) {
            Some(interval) => self.interval = interval,
            None => error!(
                "Invalid {} value {:?}, keeping {:?}",
                METRICS_CACHE_INTERVAL_ENV, value, self.interval
            ),
        }
        self
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            ..Default::default()
        }
    }
}

fn parse_interval_millis(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

struct CacheInner {
    store: Arc<dyn Store>,
    options: CacheOptions,
    daus: ArcSwapOption<GetDausResponse>,
    done: CancellationToken,
}

/// Periodically recomputed daily active users
///
/// Readers load the last published snapshot without waiting on a refresh.
pub struct Cache {
    inner: Arc<CacheInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(store: Arc<dyn Store>, options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                options,
                daus: ArcSwapOption::empty(),
                done: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the refresh loop; later calls are no-ops
    pub fn start(&self) {
        let Ok(mut handle) = self.handle.lock() else {
            return;
        };
        if handle.is_some() {
            return;
        }

        info!(interval = ?self.inner.options.interval, "Starting metrics cache");
        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Run a single refresh cycle and publish its result
    pub async fn refresh(&self) -> Result<(), CacheError> {
        self.inner.refresh().await
    }

    /// Latest snapshot, empty until the first refresh succeeds
    pub fn get_daus(&self) -> GetDausResponse {
        self.inner
            .daus
            .load_full()
            .map(|daus| (*daus).clone())
            .unwrap_or_default()
    }

    /// Stop the loop and wait for it to exit
    ///
    /// A refresh already talking to the store runs to completion first.
    pub async fn close(&self) {
        self.inner.done.cancel();

        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Metrics cache task failed: {}", e);
            }
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.inner.done.cancel();
    }
}

impl CacheInner {
    async fn run(&self) {
        let period = self.options.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new(self.options.backoff());

        loop {
            loop {
                match self.refresh().await {
                    Ok(()) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) => {
                        error!(attempt = backoff.attempt() + 1, "Failed to refresh metrics: {}", e);
                        if !backoff.wait(&self.done).await {
                            debug!("Metrics cache stopped during backoff");
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.done.cancelled() => {
                    debug!("Metrics cache stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
        }
    }

    async fn refresh(&self) -> Result<(), CacheError> {
        let cutoff = Utc::now() - self.options.retention;
        let deleted = self
            .store
            .delete_stats_older_than(cutoff)
            .await
            .map_err(CacheError::DeleteOldStats)?;

        let rows = self
            .store
            .get_daus_from_agent_stats()
            .await
            .map_err(CacheError::GetDaus)?;

        let entries = fill_empty_dau_days(&rows);
        debug!(deleted, days = entries.len(), "Metrics refreshed");
        self.daus.store(Some(Arc::new(GetDausResponse { entries })));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CacheOptions::default();
        assert_eq!(options.interval, Duration::from_secs(3600));
        assert_eq!(options.initial_backoff, Duration::from_secs(1));
        assert_eq!(options.max_backoff, Duration::from_secs(60));
        assert_eq!(options.retention, TimeDelta::days(30));
    }

    #[test]
    fn test_interval_override() {
        let options = CacheOptions::default().with_interval_override("250");
        assert_eq!(options.interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_interval_override_keeps_default() {
        for value in ["", "soon", "-5", "0"] {
            let options = CacheOptions::default().with_interval_override(value);
            assert_eq!(options.interval, Duration::from_secs(3600), "value {:?}", value);
        }
    }
}
