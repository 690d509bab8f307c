//! SurrealDB schema migrations and initialization
//!
//! Sets up the `runs` and `certificates` tables with their unique indexes.
//! Safe to call on every connection (idempotent).

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all certification tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing certification schema");

    init_runs_table(db).await?;
    init_certificates_table(db).await?;

    info!("Certification schema initialization complete");
    Ok(())
}

/// Run one schema script, surfacing statement-level failures too.
async fn apply(db: &Surreal<Any>, sql: &str) -> Result<()> {
    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `runs` table
///
/// Schema:
/// ```text
/// TABLE runs {
///   run_id:          STRING (unique)
///   agent_id:        STRING (indexed)
///   agent_name:      STRING
///   template_id:     STRING?
///   status:          STRING (running | pass | fail)
///   score:           INT?
///   pass_threshold:  INT
///   steps:           ARRAY<OBJECT> (camelCase step records)
///   certificate:     OBJECT?
///   created_at:      DATETIME (indexed)
/// }
/// ```
///
/// Steps are stored inline so a run loads in one round trip. Runs are never
/// deleted.
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX idx_agent_id ON TABLE runs COLUMNS agent_id;
        DEFINE INDEX idx_created_at ON TABLE runs COLUMNS created_at;
    "#;

    apply(db, sql).await?;
    info!("✓ runs table initialized");
    Ok(())
}

/// Initialize `certificates` table
///
/// One row per issued certificate. The unique index on `run_id` makes a
/// second issuance for the same run fail at the database level.
async fn init_certificates_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing certificates table");

    let sql = r#"
        DEFINE TABLE certificates AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_certificate_id ON TABLE certificates COLUMNS certificate_id UNIQUE;
        DEFINE INDEX idx_certificate_run ON TABLE certificates COLUMNS run_id UNIQUE;
    "#;

    apply(db, sql).await?;
    info!("✓ certificates table initialized");
    Ok(())
}
