//! Certification gate.

use std::sync::Arc;

use certify_state::{Certificate, Run, RunStatus, RunStore};

use crate::domain::{CertifyError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// A run can be certified once it has passed and has no certificate yet.
pub fn is_eligible(run: &Run) -> bool {
    run.status == RunStatus::Pass && run.certificate.is_none()
}

/// Issues certificates through the store.
#[derive(Clone)]
pub struct CertificationGate {
    store: Arc<dyn RunStore>,
}

impl CertificationGate {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Issue a certificate for `run` and attach it.
    ///
    /// On failure the run is left uncertified and the call may be retried.
    /// On success the run's score is pinned to the certified value.
    pub async fn issue(&self, run: &mut Run) -> Result<Certificate> {
        if run.is_certified() {
            return Err(CertifyError::RunCertified {
                run_id: run.id.0.clone(),
            });
        }
        if !is_eligible(run) {
            return Err(CertifyError::NotEligible {
                run_id: run.id.0.clone(),
                status: run.status.to_string(),
            });
        }

        match self.store.issue_certificate(&run.id).await {
            Ok(certificate) => {
                run.score = Some(certificate.score);
                run.certificate = Some(certificate.clone());
                METRICS.inc_certificates();
                obs::emit_certificate_issued(
                    &run.id.0,
                    &certificate.certificate_id,
                    certificate.score,
                );
                Ok(certificate)
            }
            Err(e) => {
                obs::emit_certificate_failed(&run.id.0, &e);
                Err(e.into())
            }
        }
    }
}
