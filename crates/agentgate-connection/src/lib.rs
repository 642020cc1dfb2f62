//! Connection plumbing shared by both ends of an agent tunnel
//!
//! - [`Stats`] counts connections and bytes per protocol for every stream
//!   handed out by the tunnel.
//! - [`CancelOnError`] ties the lifetime of a context to the health of a
//!   transport.
//! - [`bridge`] copies bytes between two duplexes until either side ends.

pub mod bridge;
pub mod cancel;
pub mod stats;

pub use bridge::{bridge, BridgeStats};
pub use cancel::CancelOnError;
pub use stats::{ProtocolStats, ProtocolStatsSnapshot, Stats, StatsSnapshot, StatsStream};
