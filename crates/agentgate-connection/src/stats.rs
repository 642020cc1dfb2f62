//! Per-protocol connection statistics
//!
//! Every stream handed out by a tunnel is wrapped in a [`StatsStream`] that
//! feeds atomic counters shared with the owning [`Stats`]. Counters are only
//! ever touched with atomic operations; the protocol map lock is held just
//! long enough to look up or clone the counter handles.

use agentgate_proto::{AgentStatsReportResponse, ProtocolStatsReport};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Point-in-time copy of one protocol's counters
pub type ProtocolStatsSnapshot = ProtocolStatsReport;

/// Live counters for a single protocol
#[derive(Debug, Default)]
pub struct ProtocolStats {
    num_conns: AtomicI64,
    rx_bytes: AtomicI64,
    tx_bytes: AtomicI64,
}

impl ProtocolStats {
    pub fn snapshot(&self) -> ProtocolStatsSnapshot {
        ProtocolStatsSnapshot {
            num_conns: self.num_conns.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.num_conns.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
    }

    fn conn_opened(&self) {
        self.num_conns.fetch_add(1, Ordering::Relaxed);
    }

    fn conn_closed(&self) {
        // A reset while connections are open must not drive the count negative
        let _ = self
            .num_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n > 0).then(|| n - 1)
            });
    }
}

/// Immutable copy of every protocol's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "conn_stats")]
    pub protocols: HashMap<String, ProtocolStatsSnapshot>,
}

impl StatsSnapshot {
    pub fn get(&self, protocol: &str) -> Option<&ProtocolStatsSnapshot> {
        self.protocols.get(protocol)
    }

    /// Sum of open connections across protocols
    pub fn num_conns(&self) -> i64 {
        self.protocols.values().map(|p| p.num_conns).sum()
    }
}

/// Network statistics aggregator, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct Stats {
    protocols: Arc<RwLock<HashMap<String, Arc<ProtocolStats>>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter handle for `protocol`, created on first use
    pub fn protocol(&self, protocol: &str) -> Arc<ProtocolStats> {
        if let Ok(protocols) = self.protocols.read() {
            if let Some(stats) = protocols.get(protocol) {
                return stats.clone();
            }
        }

        match self.protocols.write() {
            Ok(mut protocols) => protocols
                .entry(protocol.to_string())
                .or_default()
                .clone(),
            // A poisoned map still yields a working, if unreported, counter
            Err(_) => Arc::new(ProtocolStats::default()),
        }
    }

    /// Wrap `io` so its traffic is accounted under `protocol`
    ///
    /// The connection count is incremented now and decremented exactly once
    /// when the returned stream is dropped.
    pub fn track<T>(&self, io: T, protocol: &str) -> StatsStream<T> {
        let stats = self.protocol(protocol);
        stats.conn_opened();
        StatsStream { inner: io, stats }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let handles: Vec<(String, Arc<ProtocolStats>)> = match self.protocols.read() {
            Ok(protocols) => protocols
                .iter()
                .map(|(name, stats)| (name.clone(), stats.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };

        StatsSnapshot {
            protocols: handles
                .into_iter()
                .map(|(name, stats)| (name, stats.snapshot()))
                .collect(),
        }
    }

    /// Zero every counter, keeping the protocol keys
    pub fn reset(&self) {
        if let Ok(protocols) = self.protocols.read() {
            for stats in protocols.values() {
                stats.reset();
            }
        }
    }

    /// Build the response to a stats report request
    pub fn report(&self) -> AgentStatsReportResponse {
        let snapshot = self.snapshot();
        AgentStatsReportResponse {
            num_comms: snapshot.num_conns(),
            protocol_stats: snapshot.protocols,
        }
    }
}

/// Duplex whose traffic is counted in a [`ProtocolStats`]
#[derive(Debug)]
pub struct StatsStream<T> {
    inner: T,
    stats: Arc<ProtocolStats>,
}

impl<T> StatsStream<T> {
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for StatsStream<T> {
    fn drop(&mut self) {
        self.stats.conn_closed();
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for StatsStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        let n = buf.filled().len() - before;
        if n > 0 {
            this.stats.rx_bytes.fetch_add(n as i64, Ordering::Relaxed);
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for StatsStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.stats.tx_bytes.fetch_add(*n as i64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
