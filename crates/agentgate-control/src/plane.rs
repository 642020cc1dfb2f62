//! Shared control plane state and the client-side tunnel opener

use agentgate_broker::{dial, proxy_listen, DialOptions, PipeRelayDialer, Pubsub, RelayServer};
use agentgate_connection::Stats;
use agentgate_proto::{AgentStatus, StreamKind};
use agentgate_relay_db::Store;
use agentgate_transport::{memory_pipe, MuxSession};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent_conn::AgentConn;
use crate::config::ControlConfig;
use crate::liveness::{agent_status, FencedBuilds};
use crate::task_tracker::TaskTracker;
use crate::{TunnelError, TunnelResult};

/// Everything the agent-facing and client-facing endpoints share
pub struct ControlPlane {
    store: Arc<dyn Store>,
    bus: Arc<dyn Pubsub>,
    relay: RelayServer,
    config: ControlConfig,
    tracker: TaskTracker,
    stats: Stats,
    fenced: FencedBuilds,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn Pubsub>,
        relay: RelayServer,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            bus,
            relay,
            config,
            tracker: TaskTracker::new(),
            stats: Stats::new(),
            fenced: FencedBuilds::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn Pubsub> {
        &self.bus
    }

    pub fn relay(&self) -> &RelayServer {
        &self.relay
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Statistics of every stream opened through this control plane
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn fenced(&self) -> &FencedBuilds {
        &self.fenced
    }

    /// Cancelled when the control plane starts shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Open a tunnel to a connected agent
    ///
    /// Signaling runs over an in-process pipe: one half is served by
    /// [`proxy_listen`] like any client connection, the other is dialed with
    /// a relay fallback into the colocated [`RelayServer`]. The tunnel's
    /// close cancels the signaling relay.
    pub async fn open_agent_tunnel(
        &self,
        agent_id: Uuid,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> TunnelResult<AgentConn> {
        let agent = self.store.get_agent(agent_id).await?;
        let status = agent_status(
            &agent,
            Utc::now(),
            self.config.agent_inactive_disconnect_timeout,
        );
        if status != AgentStatus::Connected {
            return Err(TunnelError::AgentNotConnected(status));
        }

        let context = self.shutdown.child_token();
        // Unwinds the signaling relay if the caller stops waiting
        let cancel_on_drop = context.clone().drop_guard();
        let (client_io, server_io) = memory_pipe();

        let listen = proxy_listen(
            agent_id,
            self.bus.clone(),
            MuxSession::server(server_io),
            context.clone(),
        );
        self.tracker
            .spawn("proxy-listen", async move {
                if let Err(e) = listen.await {
                    debug!(agent_id = %agent_id, "Signaling relay ended: {}", e);
                }
            })
            .ok_or(TunnelError::Closed)?;

        let signaling = MuxSession::client(client_io);
        let negotiated = async {
            let stream = signaling
                .open_stream(StreamKind::Negotiate.encode()?)
                .await?;
            let options = DialOptions {
                acceptance_wait: self.config.relay_acceptance_wait,
                negotiation_timeout: self.config.negotiation_timeout,
                relay_dialer: Some(Arc::new(PipeRelayDialer::new(self.relay.clone()))),
                remote_addr,
                local_addr,
                listen_address: None,
                context: context.clone(),
            };
            dial(stream, self.config.ice_servers.clone(), options)
                .await
                .map_err(TunnelError::Negotiation)
        };

        let peer = match negotiated.await {
            Ok(peer) => peer,
            Err(e) => {
                context.cancel();
                signaling.close();
                return Err(e);
            }
        };

        cancel_on_drop.disarm();

        // The signaling session lives as long as the tunnel
        let token = peer.cancel_token();
        self.tracker.spawn("tunnel-signaling", async move {
            token.cancelled().await;
            signaling.close();
        });

        info!(agent_id = %agent_id, selected = ?peer.selected(), "Opened agent tunnel");
        Ok(AgentConn::new(peer, self.stats.clone()))
    }

    /// Stop accepting work, close every tunnel and wait for tracked tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.drain().await;
    }
}
