//! Statistics reporting
//!
//! The control plane drives the exchange: it sends an
//! [`AgentStatsReportRequest`], waits for the agent's
//! [`AgentStatsReportResponse`], stores it, then sleeps for the interval.
//! There is never more than one request in flight per agent. Reports with no
//! protocol activity are not stored.

use agentgate_connection::Stats;
use agentgate_proto::{AgentStatsReportRequest, AgentStatsReportResponse};
use agentgate_relay_db::{NewAgentStat, Store};
use agentgate_transport::{recv_json, send_json, MessageTransport, TransportError, TransportResult};
use chrono::Utc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CloseStatus, ControlResult};

/// Identity stored with every report of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportTarget {
    pub agent_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
}

/// Resolve the workspace and owner an agent reports for
pub async fn resolve_report_target(store: &dyn Store, agent_id: Uuid) -> ControlResult<ReportTarget> {
    let agent = store.get_agent(agent_id).await?;
    let resource = store.get_resource(agent.resource_id).await?;
    let build = store.get_build_by_job(resource.job_id).await?;
    let workspace = store.get_workspace(build.workspace_id).await?;

    Ok(ReportTarget {
        agent_id,
        workspace_id: workspace.id,
        user_id: workspace.owner_id,
    })
}

/// Collect reports from an agent every `interval` until `cancel` fires
///
/// Reports without any protocol are not stored.
pub async fn serve_stats_reports<M>(
    store: &dyn Store,
    target: ReportTarget,
    transport: &mut M,
    interval: Duration,
    cancel: CancellationToken,
) -> CloseStatus
where
    M: MessageTransport + ?Sized,
{
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return CloseStatus::normal(),
            _ = ticker.tick() => {}
        }

        if let Err(e) = send_json(&mut *transport, &AgentStatsReportRequest {}).await {
            return CloseStatus::abnormal(format!("write report request: {}", e));
        }

        let report = tokio::select! {
            _ = cancel.cancelled() => return CloseStatus::normal(),
            report = recv_json::<_, AgentStatsReportResponse>(&mut *transport) => report,
        };
        let report = match report {
            Ok(report) => report,
            Err(TransportError::ConnectionClosed) => {
                debug!(agent_id = %target.agent_id, "Agent closed the stats connection");
                return CloseStatus::normal();
            }
            Err(e) => return CloseStatus::abnormal(format!("read report response: {}", e)),
        };

        debug!(
            agent_id = %target.agent_id,
            workspace_id = %target.workspace_id,
            num_comms = report.num_comms,
            "Read stats report"
        );

        if !report.has_activity() {
            continue;
        }

        let payload = match serde_json::to_value(&report) {
            Ok(payload) => payload,
            Err(e) => return CloseStatus::internal(format!("encode report: {}", e)),
        };
        let stat = NewAgentStat {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            agent_id: target.agent_id,
            workspace_id: target.workspace_id,
            user_id: target.user_id,
            payload,
        };
        if let Err(e) = store.insert_stat(stat).await {
            warn!(agent_id = %target.agent_id, "Failed to insert agent stat: {}", e);
            return CloseStatus::abnormal(format!("insert agent stat: {}", e));
        }
    }
}

/// Answer report requests with the current counters until the peer closes
///
/// Counters are reset after every answered request.
pub async fn respond_stats_reports<M>(transport: &mut M, stats: &Stats) -> TransportResult<()>
where
    M: MessageTransport + ?Sized,
{
    loop {
        match recv_json::<_, AgentStatsReportRequest>(&mut *transport).await {
            Ok(_) => {}
            Err(TransportError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        }

        send_json(&mut *transport, &stats.report()).await?;
        stats.reset();
    }
}
