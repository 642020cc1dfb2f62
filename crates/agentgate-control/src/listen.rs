//! Agent-facing listen connection
//!
//! An agent keeps one listen connection open for as long as it runs. The
//! control plane multiplexes signaling streams onto it (see
//! [`agentgate_broker::proxy_dial`]) and records a heartbeat on every tick.
//! The same tick re-checks that the agent still belongs to the latest build
//! of its workspace; an agent from a superseded build is disconnected.

use agentgate_broker::proxy_dial;
use agentgate_connection::CancelOnError;
use agentgate_relay_db::entities::{workspace_agent, workspace_build};
use agentgate_relay_db::{Store, UpdateAgentConnection};
use agentgate_transport::{MuxSession, Role};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::plane::ControlPlane;
use crate::{CloseStatus, ControlError, ControlResult};

/// An agent cleared to open its listen connection
#[derive(Debug, Clone)]
pub struct ListenTarget {
    pub agent: workspace_agent::Model,
    pub build: workspace_build::Model,
}

/// Fail unless `build` is the latest build of its workspace
async fn ensure_latest_build(
    store: &dyn Store,
    agent_id: Uuid,
    build: &workspace_build::Model,
) -> ControlResult<()> {
    let latest = store.get_latest_build(build.workspace_id).await?;
    if latest.id != build.id {
        return Err(ControlError::OutdatedBuild {
            agent_id,
            build_id: build.id,
        });
    }
    Ok(())
}

/// Look up the agent's build and refuse agents from superseded builds
///
/// Runs before the connection is accepted so a refusal can be reported as a
/// plain HTTP error.
pub async fn prepare_agent_listen(
    plane: &ControlPlane,
    agent_id: Uuid,
) -> ControlResult<ListenTarget> {
    let store = plane.store().as_ref();
    let agent = store.get_agent(agent_id).await?;
    let resource = store.get_resource(agent.resource_id).await?;
    let build = store.get_build_by_job(resource.job_id).await?;

    if plane.fenced().is_fenced(agent_id, build.id) {
        debug!(agent_id = %agent_id, build_id = %build.id, "Refusing fenced agent");
        return Err(ControlError::OutdatedBuild {
            agent_id,
            build_id: build.id,
        });
    }

    if let Err(e) = ensure_latest_build(store, agent_id, &build).await {
        debug!(
            agent_id = %agent_id,
            resource_id = %resource.id,
            "Agent tried to connect from non-latest build"
        );
        return Err(e);
    }

    Ok(ListenTarget { agent, build })
}

/// Connection timestamps written on every heartbeat
struct ConnectionTimes {
    agent_id: Uuid,
    first_connected_at: DateTime<Utc>,
    last_connected_at: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
}

impl ConnectionTimes {
    async fn persist(&self, store: &dyn Store) -> ControlResult<()> {
        store
            .update_agent_connection(UpdateAgentConnection {
                id: self.agent_id,
                first_connected_at: Some(self.first_connected_at),
                last_connected_at: Some(self.last_connected_at),
                disconnected_at: self.disconnected_at,
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Serve an accepted listen connection until it closes
///
/// Returns how the connection should be closed: normally when the agent
/// goes away, `GoingAway` when its build was superseded, `Abnormal` when a
/// heartbeat could not be persisted.
pub async fn serve_agent_listen<T>(plane: &ControlPlane, target: ListenTarget, io: T) -> CloseStatus
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ListenTarget { agent, build } = target;
    let agent_id = agent.id;
    let store = plane.store().as_ref();

    let context = plane.shutdown_token().child_token();
    let session = MuxSession::new(
        CancelOnError::new(io, context.clone()),
        Role::Server,
        context.clone(),
    );

    let _proxy = match proxy_dial(agent_id, plane.bus().clone(), session.clone()).await {
        Ok(proxy) => proxy,
        Err(e) => {
            session.close();
            return CloseStatus::abnormal(e.to_string());
        }
    };

    let now = Utc::now();
    let mut times = ConnectionTimes {
        agent_id,
        first_connected_at: agent.first_connected_at.unwrap_or(now),
        last_connected_at: now,
        disconnected_at: None,
    };

    let status = match times.persist(store).await {
        Ok(()) => {
            info!(agent_id = %agent_id, build_id = %build.id, "Accepting agent");
            heartbeat(plane, &build, &mut times, &context).await
        }
        Err(e) => CloseStatus::abnormal(e.to_string()),
    };

    session.close();

    times.disconnected_at = Some(Utc::now());
    if let Err(e) = times.persist(store).await {
        warn!(agent_id = %agent_id, "Failed to record agent disconnect: {}", e);
    }

    status
}

async fn heartbeat(
    plane: &ControlPlane,
    build: &workspace_build::Model,
    times: &mut ConnectionTimes,
    context: &CancellationToken,
) -> CloseStatus {
    let store = plane.store().as_ref();
    let frequency = plane
        .config()
        .agent_connection_update_frequency
        .max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + frequency, frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = context.cancelled() => {
                if plane.shutdown_token().is_cancelled() {
                    return CloseStatus::going_away();
                }
                debug!(agent_id = %times.agent_id, "Agent connection closed");
                return CloseStatus::normal();
            }
            _ = ticker.tick() => {}
        }

        times.last_connected_at = Utc::now();
        if let Err(e) = times.persist(store).await {
            warn!(agent_id = %times.agent_id, "Failed to record heartbeat: {}", e);
            return CloseStatus::abnormal(e.to_string());
        }

        match ensure_latest_build(store, times.agent_id, build).await {
            Ok(()) => {}
            Err(ControlError::OutdatedBuild { agent_id, build_id }) => {
                debug!(agent_id = %agent_id, build_id = %build_id, "Disconnecting agent from superseded build");
                plane.fenced().fence(agent_id, build_id);
                return CloseStatus::going_away();
            }
            Err(e) => {
                warn!(agent_id = %times.agent_id, "Failed to check latest build: {}", e);
                return CloseStatus::abnormal(e.to_string());
            }
        }
    }
}
