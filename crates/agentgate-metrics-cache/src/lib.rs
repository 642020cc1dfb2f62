//! Daily active users cache
//!
//! Aggregating agent stats is too expensive to do per request, so a
//! background task recomputes the series periodically and publishes it as an
//! immutable snapshot. Readers never block on the refresher.

pub mod backoff;
pub mod cache;
pub mod fill;

pub use backoff::{Backoff, BackoffConfig};
pub use cache::{Cache, CacheOptions, METRICS_CACHE_INTERVAL_ENV};
pub use fill::fill_empty_dau_days;

use agentgate_relay_db::StoreError;
use thiserror::Error;

/// Errors aborting a refresh cycle
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Delete old stats: {0}")]
    DeleteOldStats(#[source] StoreError),

    #[error("Get DAUs: {0}")]
    GetDaus(#[source] StoreError),
}
