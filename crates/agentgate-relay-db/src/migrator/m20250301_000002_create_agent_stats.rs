//! Raw agent connection statistics, aggregated into daily active users

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AgentStats::Table)
                    .if_not_exists()
                    .col(uuid(AgentStats::Id).primary_key())
                    .col(
                        timestamp_with_time_zone(AgentStats::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(uuid(AgentStats::AgentId).not_null())
                    .col(uuid(AgentStats::WorkspaceId).not_null())
                    .col(uuid(AgentStats::UserId).not_null())
                    .col(text(AgentStats::Payload).not_null())
                    .to_owned(),
            )
            .await?;

        // Retention deletes and per-day aggregation both scan by time
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agent_stats_created_at")
                    .table(AgentStats::Table)
                    .col(AgentStats::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agent_stats_user_id")
                    .table(AgentStats::Table)
                    .col(AgentStats::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AgentStats::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AgentStats {
    Table,
    Id,
    CreatedAt,
    AgentId,
    WorkspaceId,
    UserId,
    Payload,
}
