//! Integration tests for agentgate-relay-db
//!
//! Tests database operations with real SQLite in-memory database

use agentgate_relay_db::entities::{
    agent_stat, workspace, workspace_agent, workspace_build, workspace_resource,
};
use agentgate_relay_db::{
    connect, migrate, DbStore, NewAgentStat, Store, StoreError, UpdateAgentConnection,
    UpdateAgentNetwork,
};
use chrono::{Duration, TimeZone, Utc};
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, PaginatorTrait, Set};
use std::collections::HashMap;
use uuid::Uuid;

/// Helper to create a test database
async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

struct Seeded {
    workspace_id: Uuid,
    owner_id: Uuid,
    job_id: Uuid,
    resource_id: Uuid,
    agent_id: Uuid,
}

async fn seed(db: &sea_orm::DatabaseConnection) -> Seeded {
    let now = Utc::now();
    let owner_id = Uuid::new_v4();
    let workspace_id = Uuid::new_v4();
    let job_id = Uuid::new_v4();
    let resource_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();

    workspace::ActiveModel {
        id: Set(workspace_id),
        owner_id: Set(owner_id),
        name: Set("dev".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    workspace_build::ActiveModel {
        id: Set(Uuid::new_v4()),
        workspace_id: Set(workspace_id),
        build_number: Set(1),
        job_id: Set(job_id),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    workspace_resource::ActiveModel {
        id: Set(resource_id),
        job_id: Set(job_id),
        resource_type: Set("docker_container".to_string()),
        name: Set("main".to_string()),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    workspace_agent::ActiveModel {
        id: Set(agent_id),
        resource_id: Set(resource_id),
        name: Set("agent".to_string()),
        architecture: Set("amd64".to_string()),
        operating_system: Set("linux".to_string()),
        startup_script: Set(None),
        environment_variables: Set(Some(r#"{"EDITOR":"vim"}"#.to_string())),
        directory: Set("/home/coder".to_string()),
        first_connected_at: Set(None),
        last_connected_at: Set(None),
        disconnected_at: Set(None),
        node_public_key: Set(None),
        disco_public_key: Set(None),
        preferred_relay: Set(0),
        relay_latency: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    Seeded {
        workspace_id,
        owner_id,
        job_id,
        resource_id,
        agent_id,
    }
}

fn stat(user_id: Uuid, created_at: chrono::DateTime<Utc>, num_comms: i64) -> NewAgentStat {
    NewAgentStat {
        id: Uuid::new_v4(),
        created_at,
        agent_id: Uuid::new_v4(),
        workspace_id: Uuid::new_v4(),
        user_id,
        payload: serde_json::json!({ "num_comms": num_comms, "protocol_stats": {} }),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let result = migrate(&db).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_lookup_chain() {
    let db = setup_test_db().await;
    let seeded = seed(&db).await;
    let store = DbStore::new(db);

    let agent = store.get_agent(seeded.agent_id).await.unwrap();
    let resource = store.get_resource(agent.resource_id).await.unwrap();
    assert_eq!(resource.id, seeded.resource_id);

    let build = store.get_build_by_job(resource.job_id).await.unwrap();
    assert_eq!(build.job_id, seeded.job_id);

    let workspace = store.get_workspace(build.workspace_id).await.unwrap();
    assert_eq!(workspace.owner_id, seeded.owner_id);
}

#[tokio::test]
async fn test_missing_agent_is_not_found() {
    let db = setup_test_db().await;
    let store = DbStore::new(db);

    let result = store.get_agent(Uuid::new_v4()).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_latest_build_follows_build_number() {
    let db = setup_test_db().await;
    let seeded = seed(&db).await;
    let store = DbStore::new(db.clone());

    let first = store.get_latest_build(seeded.workspace_id).await.unwrap();
    assert_eq!(first.build_number, 1);

    let now = Utc::now();
    workspace_build::ActiveModel {
        id: Set(Uuid::new_v4()),
        workspace_id: Set(seeded.workspace_id),
        build_number: Set(2),
        job_id: Set(Uuid::new_v4()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    let latest = store.get_latest_build(seeded.workspace_id).await.unwrap();
    assert_eq!(latest.build_number, 2);
    assert_ne!(latest.id, first.id);
}

#[tokio::test]
async fn test_update_agent_connection() {
    let db = setup_test_db().await;
    let seeded = seed(&db).await;
    let store = DbStore::new(db);

    let first = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let last = first + Duration::seconds(3);

    store
        .update_agent_connection(UpdateAgentConnection {
            id: seeded.agent_id,
            first_connected_at: Some(first),
            last_connected_at: Some(last),
            disconnected_at: None,
            updated_at: last,
        })
        .await
        .unwrap();

    let agent = store.get_agent(seeded.agent_id).await.unwrap();
    assert_eq!(agent.first_connected_at, Some(first));
    assert_eq!(agent.last_connected_at, Some(last));
    assert_eq!(agent.disconnected_at, None);
    // Untouched columns keep their values
    assert_eq!(agent.architecture, "amd64");
}

#[tokio::test]
async fn test_update_agent_network() {
    let db = setup_test_db().await;
    let seeded = seed(&db).await;
    let store = DbStore::new(db);

    store
        .update_agent_network(UpdateAgentNetwork {
            id: seeded.agent_id,
            node_public_key: "nodekey:abc".to_string(),
            disco_public_key: "discokey:def".to_string(),
            relay_latency: HashMap::from([("1".to_string(), 12.5)]),
            preferred_relay: 1,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let agent = store.get_agent(seeded.agent_id).await.unwrap();
    assert_eq!(agent.node_public_key.as_deref(), Some("nodekey:abc"));
    assert_eq!(agent.preferred_relay, 1);
    let latency: HashMap<String, f64> =
        serde_json::from_str(agent.relay_latency.as_deref().unwrap()).unwrap();
    assert_eq!(latency["1"], 12.5);
}

#[tokio::test]
async fn test_delete_stats_older_than() {
    let db = setup_test_db().await;
    let store = DbStore::new(db.clone());
    let now = Utc::now();
    let user = Uuid::new_v4();

    store
        .insert_stat(stat(user, now - Duration::days(40), 1))
        .await
        .unwrap();
    store
        .insert_stat(stat(user, now - Duration::days(1), 1))
        .await
        .unwrap();

    let deleted = store
        .delete_stats_older_than(now - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let remaining = agent_stat::Entity::find().count(&db).await.unwrap();
    assert_eq!(remaining, 1);
}

#[tokio::test]
async fn test_daus_count_distinct_active_users() {
    let db = setup_test_db().await;
    let store = DbStore::new(db);

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let jan1 = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let jan3 = Utc.with_ymd_and_hms(2024, 1, 3, 18, 30, 0).unwrap();

    for row in [
        stat(alice, jan1, 2),
        stat(alice, jan1 + Duration::hours(1), 1),
        stat(bob, jan1, 1),
        // Idle reports do not count
        stat(bob, jan3, 0),
        stat(alice, jan3, 1),
    ] {
        store.insert_stat(row).await.unwrap();
    }

    let daus = store.get_daus_from_agent_stats().await.unwrap();
    assert_eq!(daus.len(), 2);
    assert_eq!(daus[0].date, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(daus[0].daus, 2);
    assert_eq!(daus[1].date, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
    assert_eq!(daus[1].daus, 1);
}
