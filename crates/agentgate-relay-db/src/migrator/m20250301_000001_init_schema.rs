//! Workspaces, builds, resources and agents

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Create workspaces table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Workspaces::Table)
                    .if_not_exists()
                    .col(uuid(Workspaces::Id).primary_key())
                    .col(uuid(Workspaces::OwnerId).not_null())
                    .col(string_len(Workspaces::Name, 255).not_null())
                    .col(
                        timestamp_with_time_zone(Workspaces::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Workspaces::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Create workspace_builds table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WorkspaceBuilds::Table)
                    .if_not_exists()
                    .col(uuid(WorkspaceBuilds::Id).primary_key())
                    .col(uuid(WorkspaceBuilds::WorkspaceId).not_null())
                    .col(integer(WorkspaceBuilds::BuildNumber).not_null())
                    .col(uuid(WorkspaceBuilds::JobId).not_null().unique_key())
                    .col(
                        timestamp_with_time_zone(WorkspaceBuilds::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(WorkspaceBuilds::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_workspace_builds_workspace_id")
                            .from(WorkspaceBuilds::Table, WorkspaceBuilds::WorkspaceId)
                            .to(Workspaces::Table, Workspaces::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Latest build lookup
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_workspace_builds_workspace_number")
                    .table(WorkspaceBuilds::Table)
                    .col(WorkspaceBuilds::WorkspaceId)
                    .col(WorkspaceBuilds::BuildNumber)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Create workspace_resources table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WorkspaceResources::Table)
                    .if_not_exists()
                    .col(uuid(WorkspaceResources::Id).primary_key())
                    .col(uuid(WorkspaceResources::JobId).not_null())
                    .col(string_len(WorkspaceResources::Type, 192).not_null())
                    .col(string_len(WorkspaceResources::Name, 255).not_null())
                    .col(
                        timestamp_with_time_zone(WorkspaceResources::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_workspace_resources_job_id")
                    .table(WorkspaceResources::Table)
                    .col(WorkspaceResources::JobId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Create workspace_agents table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WorkspaceAgents::Table)
                    .if_not_exists()
                    .col(uuid(WorkspaceAgents::Id).primary_key())
                    .col(uuid(WorkspaceAgents::ResourceId).not_null())
                    .col(string_len(WorkspaceAgents::Name, 64).not_null())
                    .col(string_len(WorkspaceAgents::Architecture, 64).not_null())
                    .col(string_len(WorkspaceAgents::OperatingSystem, 64).not_null())
                    .col(text_null(WorkspaceAgents::StartupScript))
                    .col(text_null(WorkspaceAgents::EnvironmentVariables))
                    .col(text(WorkspaceAgents::Directory).not_null().default(""))
                    .col(timestamp_with_time_zone_null(WorkspaceAgents::FirstConnectedAt))
                    .col(timestamp_with_time_zone_null(WorkspaceAgents::LastConnectedAt))
                    .col(timestamp_with_time_zone_null(WorkspaceAgents::DisconnectedAt))
                    .col(string_len_null(WorkspaceAgents::NodePublicKey, 128))
                    .col(string_len_null(WorkspaceAgents::DiscoPublicKey, 128))
                    .col(integer(WorkspaceAgents::PreferredRelay).not_null().default(0))
                    .col(text_null(WorkspaceAgents::RelayLatency))
                    .col(
                        timestamp_with_time_zone(WorkspaceAgents::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(WorkspaceAgents::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_workspace_agents_resource_id")
                            .from(WorkspaceAgents::Table, WorkspaceAgents::ResourceId)
                            .to(WorkspaceResources::Table, WorkspaceResources::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_workspace_agents_resource_id")
                    .table(WorkspaceAgents::Table)
                    .col(WorkspaceAgents::ResourceId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WorkspaceAgents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceResources::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceBuilds::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Workspaces::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Workspaces {
    Table,
    Id,
    OwnerId,
    Name,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceBuilds {
    Table,
    Id,
    WorkspaceId,
    BuildNumber,
    JobId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceResources {
    Table,
    Id,
    JobId,
    Type,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceAgents {
    Table,
    Id,
    ResourceId,
    Name,
    Architecture,
    OperatingSystem,
    StartupScript,
    EnvironmentVariables,
    Directory,
    FirstConnectedAt,
    LastConnectedAt,
    DisconnectedAt,
    NodePublicKey,
    DiscoPublicKey,
    PreferredRelay,
    RelayLatency,
    CreatedAt,
    UpdatedAt,
}
