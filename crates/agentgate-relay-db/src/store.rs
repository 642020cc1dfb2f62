//! Row store consumed by the control plane and the metrics cache
//!
//! The store is treated as externally transactional: callers never hold
//! locks across a call, and every method is a single statement.

use agentgate_proto::DauEntry;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Unchanged, ColumnTrait, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, DbErr, EntityTrait, FromQueryResult, QueryFilter, QueryOrder, Set,
    Statement,
};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::{
    agent_stat, workspace, workspace_agent, workspace_build, workspace_resource,
};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Invalid stored value: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidData(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Connection timestamps written on every heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAgentConnection {
    pub id: Uuid,
    pub first_connected_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Network identity reported by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAgentNetwork {
    pub id: Uuid,
    pub node_public_key: String,
    pub disco_public_key: String,
    pub relay_latency: HashMap<String, f64>,
    pub preferred_relay: i32,
    pub updated_at: DateTime<Utc>,
}

/// Raw stats row
#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentStat {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub agent_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_agent(&self, id: Uuid) -> StoreResult<workspace_agent::Model>;

    async fn update_agent_connection(&self, params: UpdateAgentConnection) -> StoreResult<()>;

    async fn update_agent_network(&self, params: UpdateAgentNetwork) -> StoreResult<()>;

    async fn get_resource(&self, id: Uuid) -> StoreResult<workspace_resource::Model>;

    async fn get_build_by_job(&self, job_id: Uuid) -> StoreResult<workspace_build::Model>;

    /// Build with the highest build number for the workspace
    async fn get_latest_build(&self, workspace_id: Uuid) -> StoreResult<workspace_build::Model>;

    async fn get_workspace(&self, id: Uuid) -> StoreResult<workspace::Model>;

    async fn insert_stat(&self, stat: NewAgentStat) -> StoreResult<()>;

    /// Delete stats created before `cutoff`, returning the number removed
    async fn delete_stats_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Distinct users per day among reports with at least one connection
    async fn get_daus_from_agent_stats(&self) -> StoreResult<Vec<DauEntry>>;
}

/// [`Store`] backed by a sea-orm connection
#[derive(Debug, Clone)]
pub struct DbStore {
    db: DatabaseConnection,
}

#[derive(Debug, FromQueryResult)]
struct DauRow {
    date: String,
    daus: i64,
}

impl DbStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn daus_query(backend: DatabaseBackend) -> &'static str {
        match backend {
            DatabaseBackend::Postgres => {
                "SELECT (created_at AT TIME ZONE 'UTC')::date::text AS date, \
                 COUNT(DISTINCT user_id) AS daus \
                 FROM agent_stats \
                 WHERE (payload::json->>'num_comms')::bigint > 0 \
                 GROUP BY 1 ORDER BY 1 ASC"
            }
            _ => {
                "SELECT date(created_at) AS date, \
                 COUNT(DISTINCT user_id) AS daus \
                 FROM agent_stats \
                 WHERE CAST(json_extract(payload, '$.num_comms') AS INTEGER) > 0 \
                 GROUP BY date(created_at) ORDER BY date ASC"
            }
        }
    }
}

fn not_found(what: &str, id: Uuid) -> StoreError {
    StoreError::NotFound(format!("{} {}", what, id))
}

fn map_update_error(err: DbErr, what: &str, id: Uuid) -> StoreError {
    match err {
        DbErr::RecordNotUpdated | DbErr::RecordNotFound(_) => not_found(what, id),
        e => e.into(),
    }
}

#[async_trait]
impl Store for DbStore {
    async fn get_agent(&self, id: Uuid) -> StoreResult<workspace_agent::Model> {
        workspace_agent::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| not_found("agent", id))
    }

    async fn update_agent_connection(&self, params: UpdateAgentConnection) -> StoreResult<()> {
        let agent = workspace_agent::ActiveModel {
            id: Unchanged(params.id),
            first_connected_at: Set(params.first_connected_at),
            last_connected_at: Set(params.last_connected_at),
            disconnected_at: Set(params.disconnected_at),
            updated_at: Set(params.updated_at),
            ..Default::default()
        };
        agent
            .update(&self.db)
            .await
            .map_err(|e| map_update_error(e, "agent", params.id))?;
        Ok(())
    }

    async fn update_agent_network(&self, params: UpdateAgentNetwork) -> StoreResult<()> {
        let agent = workspace_agent::ActiveModel {
            id: Unchanged(params.id),
            node_public_key: Set(Some(params.node_public_key)),
            disco_public_key: Set(Some(params.disco_public_key)),
            relay_latency: Set(Some(serde_json::to_string(&params.relay_latency)?)),
            preferred_relay: Set(params.preferred_relay),
            updated_at: Set(params.updated_at),
            ..Default::default()
        };
        agent
            .update(&self.db)
            .await
            .map_err(|e| map_update_error(e, "agent", params.id))?;
        Ok(())
    }

    async fn get_resource(&self, id: Uuid) -> StoreResult<workspace_resource::Model> {
        workspace_resource::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| not_found("resource", id))
    }

    async fn get_build_by_job(&self, job_id: Uuid) -> StoreResult<workspace_build::Model> {
        workspace_build::Entity::find()
            .filter(workspace_build::Column::JobId.eq(job_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| not_found("build for job", job_id))
    }

    async fn get_latest_build(&self, workspace_id: Uuid) -> StoreResult<workspace_build::Model> {
        workspace_build::Entity::find()
            .filter(workspace_build::Column::WorkspaceId.eq(workspace_id))
            .order_by_desc(workspace_build::Column::BuildNumber)
            .one(&self.db)
            .await?
            .ok_or_else(|| not_found("build for workspace", workspace_id))
    }

    async fn get_workspace(&self, id: Uuid) -> StoreResult<workspace::Model> {
        workspace::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| not_found("workspace", id))
    }

    async fn insert_stat(&self, stat: NewAgentStat) -> StoreResult<()> {
        let row = agent_stat::ActiveModel {
            id: Set(stat.id),
            created_at: Set(stat.created_at),
            agent_id: Set(stat.agent_id),
            workspace_id: Set(stat.workspace_id),
            user_id: Set(stat.user_id),
            payload: Set(serde_json::to_string(&stat.payload)?),
        };
        agent_stat::Entity::insert(row).exec(&self.db).await?;
        Ok(())
    }

    async fn delete_stats_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = agent_stat::Entity::delete_many()
            .filter(agent_stat::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn get_daus_from_agent_stats(&self) -> StoreResult<Vec<DauEntry>> {
        let backend = self.db.get_database_backend();
        let rows = DauRow::find_by_statement(Statement::from_string(
            backend,
            Self::daus_query(backend),
        ))
        .all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
                    .map_err(|e| StoreError::InvalidData(format!("{}: {}", row.date, e)))?;
                let midnight = date
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| StoreError::InvalidData(row.date.clone()))?;
                Ok(DauEntry {
                    date: midnight.and_utc(),
                    daus: row.daus,
                })
            })
            .collect()
    }
}
