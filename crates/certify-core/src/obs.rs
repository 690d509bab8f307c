//! Structured observability hooks for grading lifecycle events.
//!
//! Emission functions for reviews, elections, regrade progress and
//! certificate issuance. Regrade attempts additionally run inside a
//! `certify.run` span carrying the run id.
//!
//! Every event carries a stable `event` field so log pipelines can filter on
//! it regardless of the message text.

use tracing::{info, warn};

/// Emit event: a grade entry was appended and elected.
pub fn emit_review_recorded(run_id: &str, step_id: &str, source: &str, score: u8, entry_index: usize) {
    info!(
        event = "review.recorded",
        run_id = %run_id,
        step_id = %step_id,
        source = %source,
        score = score,
        entry_index = entry_index,
    );
}

/// Emit event: an existing entry was (re-)elected.
pub fn emit_entry_elected(run_id: &str, step_id: &str, entry_index: usize, score: u8) {
    info!(
        event = "entry.elected",
        run_id = %run_id,
        step_id = %step_id,
        entry_index = entry_index,
        score = score,
    );
}

pub fn emit_regrade_started(run_id: &str, total: usize, resume_at: usize) {
    info!(
        event = "regrade.started",
        run_id = %run_id,
        total = total,
        resume_at = resume_at,
    );
}

pub fn emit_regrade_step_graded(run_id: &str, step_id: &str, position: usize, score: u8, percent: u8) {
    info!(
        event = "regrade.step_graded",
        run_id = %run_id,
        step_id = %step_id,
        position = position,
        score = score,
        percent = percent,
    );
}

/// Emit event: the oracle failed and the regrade stopped (warning level).
pub fn emit_regrade_failed(run_id: &str, step_id: &str, position: usize, error: &dyn std::fmt::Display) {
    warn!(
        event = "regrade.failed",
        run_id = %run_id,
        step_id = %step_id,
        position = position,
        error = %error,
    );
}

pub fn emit_regrade_completed(run_id: &str, total: usize, score: Option<u8>) {
    info!(
        event = "regrade.completed",
        run_id = %run_id,
        total = total,
        score = score,
    );
}

pub fn emit_regrade_cancelled(run_id: &str, position: usize) {
    info!(event = "regrade.cancelled", run_id = %run_id, position = position);
}

pub fn emit_regrade_discarded(run_id: &str, restored_steps: usize) {
    info!(
        event = "regrade.discarded",
        run_id = %run_id,
        restored_steps = restored_steps,
    );
}

/// Emit event: a step or run save failed. Local state is kept.
pub fn emit_persist_failed(run_id: &str, target: &str, error: &dyn std::fmt::Display) {
    warn!(event = "persist.failed", run_id = %run_id, target = %target, error = %error);
}

pub fn emit_certificate_issued(run_id: &str, certificate_id: &str, score: u8) {
    info!(
        event = "certificate.issued",
        run_id = %run_id,
        certificate_id = %certificate_id,
        score = score,
    );
}

pub fn emit_certificate_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "certificate.failed", run_id = %run_id, error = %error);
}
