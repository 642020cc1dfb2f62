//! WorkspaceAgent entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "workspace_agents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub resource_id: Uuid,
    pub name: String,
    pub architecture: String,
    pub operating_system: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub startup_script: Option<String>,

    /// JSON-encoded map of environment variables
    #[sea_orm(column_type = "Text", nullable)]
    pub environment_variables: Option<String>,

    pub directory: String,

    /// Set once, on the first successful tunnel
    pub first_connected_at: Option<ChronoDateTimeUtc>,
    pub last_connected_at: Option<ChronoDateTimeUtc>,
    pub disconnected_at: Option<ChronoDateTimeUtc>,

    pub node_public_key: Option<String>,
    pub disco_public_key: Option<String>,
    pub preferred_relay: i32,

    /// JSON-encoded map of relay region to measured latency
    #[sea_orm(column_type = "Text", nullable)]
    pub relay_latency: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::workspace_resource::Entity",
        from = "Column::ResourceId",
        to = "super::workspace_resource::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Resource,
}

impl Related<super::workspace_resource::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Resource.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
