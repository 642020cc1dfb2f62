//! Task tracking for tunnel-related background tasks
//!
//! Every task that keeps a tunnel or an upgraded socket alive is counted
//! here so shutdown can wait for all of them to finish.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, trace};

/// Tracks background tasks associated with tunnels
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    tracker: tokio_util::task::TaskTracker,
}

impl TaskTracker {
    /// Create a new task tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task
    ///
    /// Returns `None` once the tracker is closed.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            debug!(task = name, "Refusing task after shutdown started");
            return None;
        }
        trace!(task = name, "Spawning tracked task");
        Some(self.tracker.spawn(future))
    }

    /// Count work that runs outside a spawned task (e.g. an upgraded socket)
    ///
    /// The work is tracked until the returned token is dropped.
    pub fn enter(&self) -> Option<TaskTrackerToken> {
        if self.tracker.is_closed() {
            return None;
        }
        Some(self.tracker.token())
    }

    /// Stop accepting new work
    pub fn close(&self) {
        self.tracker.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Number of tasks and tokens still alive
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Close the tracker and wait for every tracked task to finish
    pub async fn drain(&self) {
        self.tracker.close();
        debug!(tasks = self.tracker.len(), "Draining tracked tasks");
        self.tracker.wait().await;
    }
}
