//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRunStore`, which satisfies the `RunStore` contract without
//! any external dependencies and can be told to fail writes so callers can
//! exercise their persistence-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::model::{Certificate, Run, RunId, RunStatus, Step, StepId};
use crate::storage_traits::*;

/// A write the store has accepted, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRecord {
    Step { run_id: RunId, step_id: StepId },
    Run { run_id: RunId, patch: RunPatch },
    Certificate { run_id: RunId },
}

/// In-memory run store backed by a `HashMap<RunId, Run>`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, Run>>,
    writes: Mutex<Vec<WriteRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `update_step`, `update_run` and
    /// `issue_certificate` call fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful grading writes so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().unwrap().clone()
    }

    /// IDs of steps saved via `update_step`, in order.
    pub fn step_writes(&self) -> Vec<StepId> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| match w {
                WriteRecord::Step { step_id, .. } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn not_found(run_id: &RunId) -> StorageError {
        StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.id.0) {
            return Err(StorageError::DuplicateRun {
                run_id: run.id.0.clone(),
            });
        }
        runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<Run> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .cloned()
            .ok_or_else(|| Self::not_found(run_id))
    }

    async fn list_runs(&self, agent_id: Option<&str>) -> StorageResult<Vec<Run>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<Run> = runs
            .values()
            .filter(|r| agent_id.map(|a| r.agent_id == a).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn append_step(&self, run_id: &RunId, step: &Step) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id.0).ok_or_else(|| Self::not_found(run_id))?;
        if run.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: run.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        run.push_step(step.clone())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn update_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        patch: StepPatch,
    ) -> StorageResult<()> {
        self.check_writable()?;
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id.0).ok_or_else(|| Self::not_found(run_id))?;
        if run.is_certified() {
            return Err(StorageError::RunCertified {
                run_id: run_id.0.clone(),
            });
        }
        let step = run
            .steps
            .iter_mut()
            .find(|s| &s.id == step_id)
            .ok_or_else(|| StorageError::StepNotFound {
                run_id: run_id.0.clone(),
                step_id: step_id.0.clone(),
            })?;
        step.apply_patch(patch);
        self.writes.lock().unwrap().push(WriteRecord::Step {
            run_id: run_id.clone(),
            step_id: step_id.clone(),
        });
        Ok(())
    }

    async fn update_run(&self, run_id: &RunId, patch: RunPatch) -> StorageResult<()> {
        self.check_writable()?;
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id.0).ok_or_else(|| Self::not_found(run_id))?;
        if run.is_certified() {
            return Err(StorageError::RunCertified {
                run_id: run_id.0.clone(),
            });
        }
        run.status = patch.status;
        run.score = patch.score;
        self.writes.lock().unwrap().push(WriteRecord::Run {
            run_id: run_id.clone(),
            patch,
        });
        Ok(())
    }

    async fn issue_certificate(&self, run_id: &RunId) -> StorageResult<Certificate> {
        self.check_writable()?;
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&run_id.0).ok_or_else(|| Self::not_found(run_id))?;
        if let Some(existing) = &run.certificate {
            return Err(StorageError::AlreadyCertified {
                run_id: run_id.0.clone(),
                certificate_id: existing.certificate_id.clone(),
            });
        }
        if run.status != RunStatus::Pass {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: run.status.to_string(),
                expected: RunStatus::Pass.to_string(),
            });
        }
        let certificate = Certificate::for_run(run, Utc::now())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        run.certificate = Some(certificate.clone());
        self.writes.lock().unwrap().push(WriteRecord::Certificate {
            run_id: run_id.clone(),
        });
        Ok(certificate)
    }
}
