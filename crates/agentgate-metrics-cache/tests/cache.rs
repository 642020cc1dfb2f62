//! Metrics cache scheduling tests against a scripted store

use agentgate_metrics_cache::{Cache, CacheError, CacheOptions};
use agentgate_proto::DauEntry;
use agentgate_relay_db::entities::{workspace, workspace_agent, workspace_build, workspace_resource};
use agentgate_relay_db::{
    NewAgentStat, Store, StoreError, StoreResult, UpdateAgentConnection, UpdateAgentNetwork,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Serves fixed DAU rows after failing the first `delete_failures` deletes
/// and any delete whose index is in `failing_deletes`
#[derive(Default)]
struct ScriptedStore {
    rows: Vec<DauEntry>,
    delete_failures: usize,
    failing_deletes: Vec<usize>,
    deletes: AtomicUsize,
    delete_times: Mutex<Vec<tokio::time::Instant>>,
    gets: AtomicUsize,
    cutoffs: Mutex<Vec<DateTime<Utc>>>,
    /// Holds every DAU query for this long
    query_delay: Option<Duration>,
    query_started: Notify,
}

#[async_trait]
impl Store for ScriptedStore {
    async fn get_agent(&self, _: Uuid) -> StoreResult<workspace_agent::Model> {
        unreachable!()
    }
    async fn update_agent_connection(&self, _: UpdateAgentConnection) -> StoreResult<()> {
        unreachable!()
    }
    async fn update_agent_network(&self, _: UpdateAgentNetwork) -> StoreResult<()> {
        unreachable!()
    }
    async fn get_resource(&self, _: Uuid) -> StoreResult<workspace_resource::Model> {
        unreachable!()
    }
    async fn get_build_by_job(&self, _: Uuid) -> StoreResult<workspace_build::Model> {
        unreachable!()
    }
    async fn get_latest_build(&self, _: Uuid) -> StoreResult<workspace_build::Model> {
        unreachable!()
    }
    async fn get_workspace(&self, _: Uuid) -> StoreResult<workspace::Model> {
        unreachable!()
    }
    async fn insert_stat(&self, _: NewAgentStat) -> StoreResult<()> {
        unreachable!()
    }

    async fn delete_stats_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.cutoffs.lock().unwrap().push(cutoff);
        self.delete_times.lock().unwrap().push(tokio::time::Instant::now());
        let attempt = self.deletes.fetch_add(1, Ordering::SeqCst);
        if attempt < self.delete_failures || self.failing_deletes.contains(&attempt) {
            return Err(StoreError::InvalidData("database is locked".to_string()));
        }
        Ok(0)
    }

    async fn get_daus_from_agent_stats(&self) -> StoreResult<Vec<DauEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.query_delay {
            self.query_started.notify_one();
            tokio::time::sleep(delay).await;
        }
        Ok(self.rows.clone())
    }
}

fn day(d: u32, daus: i64) -> DauEntry {
    DauEntry {
        date: Utc.with_ymd_and_hms(2022, 1, d, 0, 0, 0).unwrap(),
        daus,
    }
}

#[tokio::test]
async fn test_empty_before_first_refresh() {
    let store = Arc::new(ScriptedStore {
        rows: vec![day(1, 1)],
        ..Default::default()
    });
    let cache = Cache::new(store.clone(), CacheOptions::default());

    assert!(cache.get_daus().entries.is_empty());
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_refresh_publishes_gap_filled_series() {
    let store = Arc::new(ScriptedStore {
        rows: vec![day(1, 3), day(4, 1)],
        ..Default::default()
    });
    let cache = Cache::new(store, CacheOptions::default());

    cache.refresh().await.unwrap();

    assert_eq!(
        cache.get_daus().entries,
        vec![day(1, 3), day(2, 0), day(3, 0), day(4, 1)]
    );
}

#[tokio::test]
async fn test_failed_refresh_publishes_nothing() {
    let store = Arc::new(ScriptedStore {
        rows: vec![day(1, 3)],
        delete_failures: 1,
        ..Default::default()
    });
    let cache = Cache::new(store.clone(), CacheOptions::default());

    let result = cache.refresh().await;

    assert!(matches!(result, Err(CacheError::DeleteOldStats(_))));
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
    assert!(cache.get_daus().entries.is_empty());
}

#[tokio::test]
async fn test_retention_cutoff() {
    let store = Arc::new(ScriptedStore::default());
    let cache = Cache::new(store.clone(), CacheOptions::default());

    let before = Utc::now();
    cache.refresh().await.unwrap();
    let after = Utc::now();

    let cutoff = store.cutoffs.lock().unwrap()[0];
    assert!(cutoff >= before - TimeDelta::days(30));
    assert!(cutoff <= after - TimeDelta::days(30));
}

#[tokio::test(start_paused = true)]
async fn test_retries_with_backoff_until_refresh_succeeds() {
    let store = Arc::new(ScriptedStore {
        rows: vec![day(5, 2)],
        delete_failures: 3,
        ..Default::default()
    });
    let cache = Cache::new(store.clone(), CacheOptions::default());
    let started = tokio::time::Instant::now();

    cache.start();
    while cache.get_daus().entries.is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Backoff waits of 1s, 2s and 4s precede the fourth attempt
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(store.deletes.load(Ordering::SeqCst), 4);
    assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_daus().entries, vec![day(5, 2)]);

    cache.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_starts_over_after_a_success() {
    // Three failures, a success, then one failure on the next interval
    let store = Arc::new(ScriptedStore {
        failing_deletes: vec![0, 1, 2, 4],
        ..Default::default()
    });
    let options = CacheOptions {
        interval: Duration::from_secs(100),
        ..Default::default()
    };
    let cache = Cache::new(store.clone(), options);

    cache.start();
    while store.deletes.load(Ordering::SeqCst) < 6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cache.close().await;

    let times = store.delete_times.lock().unwrap().clone();
    let gap = |i: usize| times[i] - times[i - 1];
    assert_eq!(gap(1), Duration::from_secs(1));
    assert_eq!(gap(2), Duration::from_secs(2));
    assert_eq!(gap(3), Duration::from_secs(4));
    // The retry after the interval's failure waits the initial delay again
    assert_eq!(gap(5), Duration::from_secs(1));
    assert_eq!(store.gets.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refreshes_on_every_interval() {
    let store = Arc::new(ScriptedStore::default());
    let options = CacheOptions {
        interval: Duration::from_secs(10),
        ..Default::default()
    };
    let cache = Cache::new(store.clone(), options);

    cache.start();
    // Starting twice does not spawn a second loop
    cache.start();
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(store.gets.load(Ordering::SeqCst), 3);
    cache.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_lets_in_flight_refresh_finish() {
    let store = Arc::new(ScriptedStore {
        rows: vec![day(2, 7)],
        query_delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let cache = Cache::new(store.clone(), CacheOptions::default());

    cache.start();
    store.query_started.notified().await;
    cache.close().await;

    assert_eq!(cache.get_daus().entries, vec![day(2, 7)]);
    assert_eq!(store.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_backoff_wait() {
    let store = Arc::new(ScriptedStore {
        delete_failures: usize::MAX,
        ..Default::default()
    });
    let options = CacheOptions {
        initial_backoff: Duration::from_secs(3600),
        max_backoff: Duration::from_secs(3600),
        ..Default::default()
    };
    let cache = Cache::new(store.clone(), options);
    let started = tokio::time::Instant::now();

    cache.start();
    while store.deletes.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cache.close().await;

    assert!(started.elapsed() < Duration::from_secs(3600));
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
}
