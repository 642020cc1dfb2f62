//! Database entities

pub mod agent_stat;
pub mod workspace;
pub mod workspace_agent;
pub mod workspace_build;
pub mod workspace_resource;

pub use agent_stat::Entity as AgentStat;
pub use workspace::Entity as Workspace;
pub use workspace_agent::Entity as WorkspaceAgent;
pub use workspace_build::Entity as WorkspaceBuild;
pub use workspace_resource::Entity as WorkspaceResource;

pub mod prelude {
    pub use super::agent_stat::Entity as AgentStat;
    pub use super::workspace::Entity as Workspace;
    pub use super::workspace_agent::Entity as WorkspaceAgent;
    pub use super::workspace_build::Entity as WorkspaceBuild;
    pub use super::workspace_resource::Entity as WorkspaceResource;
}
