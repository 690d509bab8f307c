//! SurrealDB connection setup.
//!
//! Resolution order for [`connect_from_env`]:
//! 1. SurrealDB Cloud via [`CloudConfig::from_env`]
//! 2. `SURREALDB_URL` (any engine URL, e.g. `ws://localhost:8000`)
//! 3. Local persistence at `.certify/db` (SurrealKV)

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Default namespace for certification data.
pub const DEFAULT_NAMESPACE: &str = "certify";
/// Default database name.
pub const DEFAULT_DATABASE: &str = "main";
/// Directory used when no remote database is configured.
pub const LOCAL_DB_PATH: &str = ".certify/db";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "certify")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Load configuration from environment variables
    ///
    /// Required: `SURREALDB_ENDPOINT`, `SURREALDB_USERNAME`, `SURREALDB_PASSWORD`.
    /// Optional: `SURREALDB_NAMESPACE`, `SURREALDB_DATABASE`, `SURREALDB_ROOT`.
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database = std::env::var("SURREALDB_DATABASE")
            .unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            namespace,
            database,
            is_root,
            ..Self::new(endpoint, username, password)
        })
    }
}

async fn select(db: Surreal<Any>, namespace: &str, database: &str) -> Result<Surreal<Any>> {
    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    migrations::init_schema(&db).await?;
    Ok(db)
}

/// Connect to an ephemeral in-memory database with the schema applied.
pub async fn connect_in_memory() -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect("mem://")
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    select(db, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
}

/// Connect using a cloud configuration.
pub async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
    }

    info!(endpoint = %config.endpoint, "connected to SurrealDB cloud");
    select(db, &config.namespace, &config.database).await
}

/// Connect using the environment resolution chain described in the module docs.
pub async fn connect_from_env() -> Result<Surreal<Any>> {
    if let Ok(config) = CloudConfig::from_env() {
        return connect_cloud(&config).await;
    }

    if let Ok(url) = std::env::var("SURREALDB_URL") {
        let db = surrealdb::engine::any::connect(&url)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        info!("connected to SurrealDB ({})", url);
        return select(db, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await;
    }

    std::fs::create_dir_all(LOCAL_DB_PATH).map_err(|e| {
        StateError::Connection(format!(
            "Failed to create database directory {}: {}",
            LOCAL_DB_PATH, e
        ))
    })?;
    let url = format!("surrealkv://{}", LOCAL_DB_PATH);
    info!(
        "No cloud config or SURREALDB_URL found, using local persistence: {}",
        url
    );
    let db = surrealdb::engine::any::connect(&url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;
    select(db, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
}
