use agentgate_broker::proxy_listen;
use agentgate_connection::{bridge, CancelOnError};
use agentgate_control::liveness::agent_status;
use agentgate_control::{
    post_agent_node, prepare_agent_listen, resolve_report_target, serve_agent_listen,
    serve_agent_node, serve_stats_reports, AgentView, CloseStatus, TunnelError,
};
use agentgate_proto::{AgentStatus, GetDausResponse, Node};
use agentgate_relay_db::entities::workspace_agent;
use agentgate_transport::{CloseCode, MessageTransport, MuxSession, Role};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response as AxumResponse},
    Json,
};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{parse_uuid, ApiError, ApiResult};
use crate::models::{AgentQuery, PtyQuery, Response};
use crate::websocket::{serve_with_close_status, WebSocketIo, WebSocketMessages};
use crate::{ConnectionAddrs, ServerState};

async fn load_agent(state: &ServerState, agent_id: Uuid) -> ApiResult<workspace_agent::Model> {
    Ok(state.plane.store().get_agent(agent_id).await?)
}

fn status_of(state: &ServerState, agent: &workspace_agent::Model) -> AgentStatus {
    agent_status(
        agent,
        Utc::now(),
        state.plane.config().agent_inactive_disconnect_timeout,
    )
}

/// Get a workspace agent with its derived status
pub async fn workspace_agent(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentView>> {
    let agent_id = parse_uuid("id", Some(&id))?;
    let agent = load_agent(&state, agent_id).await?;

    let view = AgentView::from_model(
        agent,
        Utc::now(),
        state.plane.config().agent_inactive_disconnect_timeout,
    )?;
    Ok(Json(view))
}

/// Client side of signaling: negotiations opened on this socket are relayed
/// to the agent over the bus
pub async fn workspace_agent_dial(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<AxumResponse> {
    let agent_id = parse_uuid("id", Some(&id))?;
    let agent = load_agent(&state, agent_id).await?;
    let status = status_of(&state, &agent);
    if status != AgentStatus::Connected {
        return Err(TunnelError::AgentNotConnected(status).into());
    }

    let token = state.plane.tracker().enter().ok_or_else(ApiError::shutting_down)?;
    let plane = state.plane.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let _token = token;
        serve_with_close_status(socket, move |io| async move {
            let context = plane.shutdown_token().child_token();
            let session = MuxSession::new(
                CancelOnError::new(io, context.clone()),
                Role::Server,
                context.clone(),
            );
            let result = proxy_listen(agent_id, plane.bus().clone(), session.clone(), context).await;
            session.close();

            match result {
                Ok(()) => CloseStatus::normal(),
                Err(e) => CloseStatus::internal(format!("serve: {}", e)),
            }
        })
        .await;
    }))
}

/// The agent's long-lived connection: heartbeats and incoming negotiations
pub async fn workspace_agent_listen(
    State(state): State<ServerState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<AxumResponse> {
    let agent_id = parse_uuid("agent_id", query.agent_id.as_deref())?;
    let target = prepare_agent_listen(&state.plane, agent_id).await?;

    let token = state.plane.tracker().enter().ok_or_else(ApiError::shutting_down)?;
    let plane = state.plane.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let _token = token;
        serve_with_close_status(socket, move |io| async move {
            serve_agent_listen(&plane, target, io).await
        })
        .await;
    }))
}

/// Web terminal: pipes a reconnecting PTY on the agent over the socket
pub async fn workspace_agent_pty(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<PtyQuery>,
    ConnectInfo(addrs): ConnectInfo<ConnectionAddrs>,
    ws: WebSocketUpgrade,
) -> ApiResult<AxumResponse> {
    let agent_id = parse_uuid("id", Some(&id))?;
    let agent = load_agent(&state, agent_id).await?;
    let status = status_of(&state, &agent);
    if status != AgentStatus::Connected {
        return Err(ApiError::new(
            StatusCode::PRECONDITION_REQUIRED,
            format!(
                "Agent state is \"{}\", it must be in the \"{}\" state.",
                status,
                AgentStatus::Connected
            ),
        ));
    }

    let reconnect = parse_uuid("reconnect", query.reconnect.as_deref())?;
    let (height, width) = (query.height(), query.width());
    let command = query.command().to_string();

    let token = state.plane.tracker().enter().ok_or_else(ApiError::shutting_down)?;
    let plane = state.plane.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let _token = token;
        let mut io = WebSocketIo::new(socket);

        // Setup stops as soon as the client goes away
        let tunnel = plane.open_agent_tunnel(agent_id, addrs.remote, addrs.local);
        let conn = match io.until_closed(tunnel).await {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => {
                let reason = format!("dial workspace agent: {}", e);
                io.close(CloseCode::InternalError, &reason).await;
                return;
            }
            None => {
                debug!(agent_id = %agent_id, "Client left while dialing agent");
                return;
            }
        };

        let pty = conn.reconnecting_pty(reconnect, height, width, &command);
        match io.until_closed(pty).await {
            Some(Ok(pty)) => {
                let stats = bridge(io, pty).await;
                debug!(
                    agent_id = %agent_id,
                    to_agent = stats.a_to_b,
                    from_agent = stats.b_to_a,
                    "Terminal closed"
                );
            }
            Some(Err(e)) => {
                let reason = format!("dial: {}", e);
                io.close(CloseCode::InternalError, &reason).await;
            }
            None => debug!(agent_id = %agent_id, "Client left while opening terminal"),
        }

        conn.close();
    }))
}

/// Network identity exchange for an agent
pub async fn workspace_agent_node(
    State(state): State<ServerState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<AxumResponse> {
    let agent_id = parse_uuid("agent_id", query.agent_id.as_deref())?;
    load_agent(&state, agent_id).await?;

    let token = state.plane.tracker().enter().ok_or_else(ApiError::shutting_down)?;
    let plane = state.plane.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let _token = token;
        let mut transport = WebSocketMessages::new(socket);
        let status = serve_agent_node(&plane, agent_id, &mut transport).await;
        transport.close(status.code, &status.reason).await;
    }))
}

/// Send networking information to an agent's node connection
pub async fn post_workspace_agent_node(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Response>> {
    let agent_id = parse_uuid("id", Some(&id))?;
    load_agent(&state, agent_id).await?;

    let node: Node = serde_json::from_slice(&body).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, "Request body must be valid JSON.").with_detail(e)
    })?;

    post_agent_node(&state.plane, agent_id, &node)
        .await
        .map_err(|e| {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Publish node data.").with_detail(e)
        })?;

    Ok(Json(Response::new("Published!")))
}

/// Periodic statistics collection from an agent
pub async fn workspace_agent_report_stats(
    State(state): State<ServerState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<AxumResponse> {
    let agent_id = parse_uuid("agent_id", query.agent_id.as_deref())?;
    let target = resolve_report_target(state.plane.store().as_ref(), agent_id).await?;
    let interval = state.plane.config().agent_stat_interval;

    let token = state.plane.tracker().enter().ok_or_else(ApiError::shutting_down)?;
    let plane = state.plane.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let _token = token;
        let mut transport = WebSocketMessages::new(socket);
        let status = serve_stats_reports(
            plane.store().as_ref(),
            target,
            &mut transport,
            interval,
            plane.shutdown_token().child_token(),
        )
        .await;
        transport.close(status.code, &status.reason).await;
    }))
}

/// Daily active users, as last computed by the metrics cache
pub async fn daus(State(state): State<ServerState>) -> Json<GetDausResponse> {
    Json(state.cache.get_daus())
}

/// Relay fallback carried over a WebSocket
pub async fn workspace_agent_turn(
    State(state): State<ServerState>,
    ConnectInfo(addrs): ConnectInfo<ConnectionAddrs>,
    ws: WebSocketUpgrade,
) -> ApiResult<AxumResponse> {
    let token = state.plane.tracker().enter().ok_or_else(ApiError::shutting_down)?;
    let relay = state.plane.relay().clone();
    let shutdown = state.plane.shutdown_token();

    Ok(ws.on_upgrade(move |socket| async move {
        let _token = token;
        debug!(remote = %addrs.remote, local = %addrs.local, "Accepting relay connection");

        tokio::select! {
            result = relay.accept(WebSocketIo::new(socket), addrs.remote, addrs.local) => {
                if let Err(e) = result {
                    debug!(remote = %addrs.remote, "Relay connection ended: {}", e);
                }
            }
            _ = shutdown.cancelled() => {}
        }

        debug!(remote = %addrs.remote, "Completed relay connection");
    }))
}

/// Catch-all for unknown API routes
pub async fn not_found() -> impl IntoResponse {
    ApiError::not_found()
}
