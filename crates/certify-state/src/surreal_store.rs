//! SurrealDB-backed RunStore implementation
//!
//! Runs are stored one row per run in the `runs` table with their steps
//! inline; issued certificates are additionally recorded in `certificates`,
//! whose unique `run_id` index rejects a second row per run. Issuance writes
//! both tables in one transaction. Rows are converted to and from the model at
//! the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::model::{Certificate, Run, RunId, RunStatus, Step, StepId};
use crate::storage_traits::{RunPatch, RunStore, StepPatch, StorageResult};

/// Serialize chrono timestamps as native SurrealDB datetimes.
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// `runs` table row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRun {
    /// SurrealDB record ID
    id: Option<surrealdb::sql::Thing>,
    run_id: String,
    agent_id: String,
    agent_name: String,
    template_id: Option<String>,
    /// "running" | "pass" | "fail"
    status: String,
    score: Option<u8>,
    pass_threshold: u8,
    steps: Vec<Step>,
    certificate: Option<Certificate>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
}

impl DbRun {
    fn from_run(run: &Run) -> Self {
        Self {
            id: None,
            run_id: run.id.0.clone(),
            agent_id: run.agent_id.clone(),
            agent_name: run.agent_name.clone(),
            template_id: run.template_id.clone(),
            status: run.status.as_str().to_string(),
            score: run.score,
            pass_threshold: run.pass_threshold,
            steps: run.steps.clone(),
            certificate: run.certificate.clone(),
            created_at: run.timestamp,
        }
    }

    fn into_run(self) -> StorageResult<Run> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown run status: {}", self.status))
        })?;
        Ok(Run {
            id: RunId(self.run_id),
            agent_id: self.agent_id,
            agent_name: self.agent_name,
            template_id: self.template_id,
            timestamp: self.created_at,
            status,
            score: self.score,
            pass_threshold: self.pass_threshold,
            steps: self.steps,
            certificate: self.certificate,
        })
    }
}

/// `certificates` table row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbCertificate {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    certificate_id: String,
    run_id: String,
    certificate: Certificate,
    #[serde(with = "surreal_datetime")]
    issued_at: DateTime<Utc>,
}

/// Record a certificate and attach it to its run atomically. Aborts when the
/// run already carries one.
const ISSUE_CERTIFICATE: &str = r#"
    BEGIN TRANSACTION;
    LET $current = (SELECT VALUE certificate FROM runs WHERE run_id = $rid)[0];
    IF $current != NONE AND $current != NULL {
        THROW "run already certified";
    };
    DELETE certificates WHERE run_id = $rid;
    CREATE certificates CONTENT $row;
    UPDATE runs SET certificate = $certificate WHERE run_id = $rid;
    COMMIT TRANSACTION;
"#;

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`RunStore`].
pub struct SurrealRunStore {
    db: Surreal<Any>,
}

impl SurrealRunStore {
    /// Wrap an already-connected database (schema must be initialised).
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_in_memory().await?;
        info!("SurrealRunStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables (see [`handle::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_run(&self, rid: &str) -> StorageResult<DbRun> {
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<DbRun> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    /// Fetch a run row and refuse if it is certified.
    async fn fetch_gradable(&self, rid: &str) -> StorageResult<DbRun> {
        let row = self.fetch_run(rid).await?;
        if row.certificate.is_some() {
            return Err(StorageError::RunCertified {
                run_id: rid.to_string(),
            });
        }
        Ok(row)
    }

    async fn write_steps(&self, rid: &str, steps: Vec<Step>) -> StorageResult<()> {
        self.db
            .query("UPDATE runs SET steps = $steps WHERE run_id = $rid")
            .bind(("steps", steps))
            .bind(("rid", rid.to_string()))
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SurrealRunStore {
    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        if self.fetch_run(&run.id.0).await.is_ok() {
            return Err(StorageError::DuplicateRun {
                run_id: run.id.0.clone(),
            });
        }

        debug!(run_id = %run.id, "creating run");

        let _created: Option<DbRun> = self
            .db
            .create("runs")
            .content(DbRun::from_run(run))
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<Run> {
        self.fetch_run(&run_id.0).await?.into_run()
    }

    async fn list_runs(&self, agent_id: Option<&str>) -> StorageResult<Vec<Run>> {
        let rows: Vec<DbRun> = if let Some(agent) = agent_id {
            let mut res = self
                .db
                .query("SELECT * FROM runs WHERE agent_id = $agent ORDER BY created_at DESC")
                .bind(("agent", agent.to_string()))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        };

        rows.into_iter().map(DbRun::into_run).collect()
    }

    async fn append_step(&self, run_id: &RunId, step: &Step) -> StorageResult<()> {
        let mut run = self.fetch_run(&run_id.0).await?.into_run()?;
        if run.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: run.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        run.push_step(step.clone())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.write_steps(&run_id.0, run.steps).await
    }

    async fn update_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        patch: StepPatch,
    ) -> StorageResult<()> {
        let mut row = self.fetch_gradable(&run_id.0).await?;
        let step = row
            .steps
            .iter_mut()
            .find(|s| &s.id == step_id)
            .ok_or_else(|| StorageError::StepNotFound {
                run_id: run_id.0.clone(),
                step_id: step_id.0.clone(),
            })?;
        step.apply_patch(patch);

        debug!(run_id = %run_id, step_id = %step_id, "saving step grading");
        self.write_steps(&run_id.0, row.steps).await
    }

    async fn update_run(&self, run_id: &RunId, patch: RunPatch) -> StorageResult<()> {
        self.fetch_gradable(&run_id.0).await?;

        self.db
            .query("UPDATE runs SET status = $status, score = $score WHERE run_id = $rid")
            .bind(("status", patch.status.as_str().to_string()))
            .bind(("score", patch.score))
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn issue_certificate(&self, run_id: &RunId) -> StorageResult<Certificate> {
        let row = self.fetch_run(&run_id.0).await?;
        if let Some(existing) = &row.certificate {
            return Err(StorageError::AlreadyCertified {
                run_id: run_id.0.clone(),
                certificate_id: existing.certificate_id.clone(),
            });
        }
        let run = row.into_run()?;
        if run.status != RunStatus::Pass {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: run.status.to_string(),
                expected: RunStatus::Pass.to_string(),
            });
        }

        let certificate = Certificate::for_run(&run, Utc::now())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // A certificates row for an uncertified run is left over from an
        // issuance whose run update never landed; it is replaced, not adopted,
        // since the run may have been re-graded since.
        let issued = self
            .db
            .query(ISSUE_CERTIFICATE)
            .bind(("rid", run_id.0.clone()))
            .bind((
                "row",
                DbCertificate {
                    id: None,
                    certificate_id: certificate.certificate_id.clone(),
                    run_id: run_id.0.clone(),
                    certificate: certificate.clone(),
                    issued_at: certificate.issued_at,
                },
            ))
            .bind(("certificate", certificate.clone()))
            .await
            .and_then(|res| res.check());

        if let Err(e) = issued {
            if let Some(existing) = self.fetch_run(&run_id.0).await?.certificate {
                return Err(StorageError::AlreadyCertified {
                    run_id: run_id.0.clone(),
                    certificate_id: existing.certificate_id,
                });
            }
            return Err(backend(e));
        }

        info!(run_id = %run_id, certificate_id = %certificate.certificate_id, "certificate recorded");
        Ok(certificate)
    }
}
