//! Grading data model: runs, transcript steps, grade entries and certificates.
//!
//! A [`Run`] is an ordered transcript of [`Step`]s. Only `system` steps carry
//! grading; each graded step owns an append-only history of [`GradeEntry`]
//! records of which exactly one is *elected*. The step's `score`, `content`
//! and `is_human_graded` fields mirror the elected entry so that readers never
//! have to consult the history to display the current verdict.
//!
//! Steps recorded before history tracking existed have an empty history. For
//! those, [`Step::entries`] synthesizes a single elected entry from the
//! step's own fields, and [`Step::materialize_history`] turns that synthetic
//! entry into the first real history item the first time the step is mutated.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage_traits::{ContentDigest, StepPatch};

/// Highest score a grade entry may carry.
pub const SCORE_MAX: u8 = 100;

/// Verdict threshold used when a run does not carry its own.
pub const DEFAULT_PASS_THRESHOLD: u8 = 70;

fn default_pass_threshold() -> u8 {
    DEFAULT_PASS_THRESHOLD
}

/// Violations of the data-model invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("score {score} is outside 0..=100")]
    ScoreOutOfRange { score: u32 },

    #[error("entry index {index} out of range for step {step_id} (history length {len})")]
    EntryOutOfRange {
        step_id: String,
        index: usize,
        len: usize,
    },

    #[error("step {step_id} has no gradable entries")]
    NotGradable { step_id: String },

    #[error("step {step_id} has {count} elected entries, expected exactly one")]
    ElectedCount { step_id: String, count: usize },

    #[error("step {step_id} mirror fields disagree with its elected entry")]
    MirrorMismatch { step_id: String },

    #[error("run {run_id} is {status}; steps can only be appended while running")]
    RunNotRunning { run_id: String, status: RunStatus },

    #[error("step {step_id} already exists in run {run_id}")]
    DuplicateStep { run_id: String, step_id: String },
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for an evaluation run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Identifier of a step, unique within its run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new() -> Self {
        StepId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Who produced a grade entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeSource {
    Human,
    Automated,
}

impl GradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeSource::Human => "human",
            GradeSource::Automated => "automated",
        }
    }
}

impl std::fmt::Display for GradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Speaker of a transcript step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    Interviewer,
    Agent,
    System,
}

impl StepRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepRole::Interviewer => "interviewer",
            StepRole::Agent => "agent",
            StepRole::System => "system",
        }
    }
}

impl std::fmt::Display for StepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Run-level verdict.
///
/// `Running` resolves once to `Pass` or `Fail`. Afterwards the verdict only
/// flips between `Pass` and `Fail` as a consequence of re-election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Pass,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Pass => "pass",
            RunStatus::Fail => "fail",
        }
    }

    /// Parse the lowercase wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "pass" => Some(RunStatus::Pass),
            "fail" => Some(RunStatus::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GradeEntry
// ---------------------------------------------------------------------------

/// One scoring event for one step.
///
/// `source`, `score`, `reasoning` and `created_at` are fixed at construction.
/// Only the election flag and `elected_at` change, and only through
/// [`Step::elect_entry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEntry {
    source: GradeSource,
    score: u8,
    #[serde(default)]
    reasoning: String,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_elected: bool,
}

impl GradeEntry {
    /// Create an unelected entry.
    pub fn new(
        source: GradeSource,
        score: u8,
        reasoning: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        if score > SCORE_MAX {
            return Err(ModelError::ScoreOutOfRange {
                score: u32::from(score),
            });
        }
        Ok(Self {
            source,
            score,
            reasoning: reasoning.into(),
            created_at,
            elected_at: None,
            is_elected: false,
        })
    }

    pub fn source(&self) -> GradeSource {
        self.source
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn elected_at(&self) -> Option<DateTime<Utc>> {
        self.elected_at
    }

    pub fn is_elected(&self) -> bool {
        self.is_elected
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One transcript unit within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub role: StepRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default)]
    pub is_human_graded: bool,
    #[serde(default)]
    grading_history: Vec<GradeEntry>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    /// Create an ungraded step.
    pub fn new(role: StepRole, content: impl Into<String>) -> Self {
        Self {
            id: StepId::new(),
            role,
            content: content.into(),
            score: None,
            is_human_graded: false,
            grading_history: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn interviewer(content: impl Into<String>) -> Self {
        Self::new(StepRole::Interviewer, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(StepRole::Agent, content)
    }

    /// Create a system verdict step as produced by live grading, with its
    /// first automated entry already elected.
    pub fn graded(score: u8, reasoning: impl Into<String>) -> Result<Self, ModelError> {
        let reasoning = reasoning.into();
        let mut step = Self::new(StepRole::System, reasoning.clone());
        let entry = GradeEntry::new(GradeSource::Automated, score, reasoning, step.timestamp)?;
        let index = step.push_entry(entry);
        step.elect_entry(index, step.timestamp)?;
        Ok(step)
    }

    /// Create a system step in the pre-history layout: mirror fields only.
    pub fn legacy_graded(content: impl Into<String>, score: u8, is_human_graded: bool) -> Self {
        let mut step = Self::new(StepRole::System, content);
        step.score = Some(score);
        step.is_human_graded = is_human_graded;
        step
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = StepId(id.into());
        self
    }

    /// Whether the step takes part in grading (system role with a score).
    pub fn is_scoreable(&self) -> bool {
        self.role == StepRole::System && self.score.is_some()
    }

    /// Recorded history, excluding any synthesized legacy entry.
    pub fn grading_history(&self) -> &[GradeEntry] {
        &self.grading_history
    }

    /// The implicit entry that stands in for a legacy step's mirror fields.
    pub fn legacy_entry(&self) -> Option<GradeEntry> {
        if !self.grading_history.is_empty() || self.role != StepRole::System {
            return None;
        }
        let score = self.score?;
        let source = if self.is_human_graded {
            GradeSource::Human
        } else {
            GradeSource::Automated
        };
        Some(GradeEntry {
            source,
            score,
            reasoning: self.content.clone(),
            created_at: self.timestamp,
            elected_at: Some(self.timestamp),
            is_elected: true,
        })
    }

    /// Current entries: the recorded history, or the synthesized legacy entry.
    pub fn entries(&self) -> Cow<'_, [GradeEntry]> {
        if self.grading_history.is_empty() {
            match self.legacy_entry() {
                Some(entry) => Cow::Owned(vec![entry]),
                None => Cow::Borrowed(&[]),
            }
        } else {
            Cow::Borrowed(&self.grading_history)
        }
    }

    /// Index of the elected entry within [`Step::entries`].
    ///
    /// Falls back, for histories without any explicit flag, to the most recent
    /// entry whose `(score, source, reasoning)` matches the mirror fields, and
    /// then to the most recent entry.
    pub fn elected_index(&self) -> Option<usize> {
        let entries = self.entries();
        if entries.is_empty() {
            return None;
        }
        if let Some(i) = entries.iter().position(|e| e.is_elected) {
            return Some(i);
        }
        entries
            .iter()
            .rposition(|e| self.mirrors(e))
            .or(Some(entries.len() - 1))
    }

    pub fn elected_entry(&self) -> Option<GradeEntry> {
        let index = self.elected_index()?;
        self.entries().get(index).cloned()
    }

    /// Entry indices in presentation order: elected first, then the rest
    /// newest first.
    pub fn display_order(&self) -> Vec<usize> {
        let len = self.entries().len();
        let Some(elected) = self.elected_index() else {
            return Vec::new();
        };
        std::iter::once(elected)
            .chain((0..len).rev().filter(|&i| i != elected))
            .collect()
    }

    fn mirrors(&self, entry: &GradeEntry) -> bool {
        self.score == Some(entry.score)
            && self.is_human_graded == (entry.source == GradeSource::Human)
            && (entry.source == GradeSource::Human || entry.reasoning == self.content)
    }

    /// Promote a synthesized legacy entry into the recorded history.
    ///
    /// Returns `true` when an entry was written. Histories that exist but
    /// carry no explicit election flag are settled through
    /// [`Step::flag_fallback_election`].
    pub fn materialize_history(&mut self) -> bool {
        if let Some(entry) = self.legacy_entry() {
            self.grading_history.push(entry);
            return true;
        }
        self.flag_fallback_election();
        false
    }

    /// Flag the fallback-elected entry of a history that has no explicit
    /// election, and align the mirror fields with it.
    ///
    /// Returns `true` when a flag was set. A step without history, or with a
    /// flagged entry already, is left untouched. `elected_at` is not stamped
    /// since no election took place.
    pub fn flag_fallback_election(&mut self) -> bool {
        if self.grading_history.iter().any(|e| e.is_elected) {
            return false;
        }
        let Some(index) = self.elected_index() else {
            return false;
        };
        let Some(entry) = self.grading_history.get_mut(index) else {
            return false;
        };
        entry.is_elected = true;
        self.score = Some(entry.score);
        self.is_human_graded = entry.source == GradeSource::Human;
        if entry.source == GradeSource::Automated {
            self.content = entry.reasoning.clone();
        }
        true
    }

    /// Append an entry without electing it. Returns its history index.
    pub fn push_entry(&mut self, entry: GradeEntry) -> usize {
        self.materialize_history();
        self.grading_history.push(entry);
        self.grading_history.len() - 1
    }

    /// Elect the entry at `index`, clearing every other flag and refreshing the
    /// mirror fields. Re-electing the elected entry refreshes `elected_at`.
    pub fn elect_entry(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.materialize_history();
        let len = self.grading_history.len();
        if len == 0 {
            return Err(ModelError::NotGradable {
                step_id: self.id.0.clone(),
            });
        }
        if index >= len {
            return Err(ModelError::EntryOutOfRange {
                step_id: self.id.0.clone(),
                index,
                len,
            });
        }

        for (i, entry) in self.grading_history.iter_mut().enumerate() {
            entry.is_elected = i == index;
        }
        let elected = &mut self.grading_history[index];
        elected.elected_at = Some(now);

        self.score = Some(elected.score);
        self.is_human_graded = elected.source == GradeSource::Human;
        if elected.source == GradeSource::Automated {
            self.content = elected.reasoning.clone();
        }
        Ok(())
    }

    /// Overwrite grading fields with a persisted patch.
    pub(crate) fn apply_patch(&mut self, patch: StepPatch) {
        self.grading_history = patch.grading_history;
        self.content = patch.content;
        self.score = patch.score;
        self.is_human_graded = patch.is_human_graded;
    }

    /// Check the exactly-one-elected and mirror invariants.
    pub fn check_invariants(&self) -> Result<(), ModelError> {
        if self.grading_history.is_empty() {
            return Ok(());
        }
        let count = self.grading_history.iter().filter(|e| e.is_elected).count();
        if count != 1 {
            return Err(ModelError::ElectedCount {
                step_id: self.id.0.clone(),
                count,
            });
        }
        let consistent = self
            .grading_history
            .iter()
            .find(|e| e.is_elected)
            .is_some_and(|e| self.mirrors(e));
        if !consistent {
            return Err(ModelError::MirrorMismatch {
                step_id: self.id.0.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Certificate
// ---------------------------------------------------------------------------

/// Immutable record attached to a passing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate_id: String,
    pub run_id: RunId,
    pub agent_id: String,
    pub agent_name: String,
    /// Run score frozen at issuance.
    pub score: u8,
    pub issued_at: DateTime<Utc>,
    /// SHA-256 over the canonical JSON of the run's steps at issuance.
    pub run_digest: ContentDigest,
}

impl Certificate {
    /// Build the certificate for `run` as it stands now.
    pub fn for_run(run: &Run, issued_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            certificate_id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            agent_id: run.agent_id.clone(),
            agent_name: run.agent_name.clone(),
            score: run.score.unwrap_or_default(),
            issued_at,
            run_digest: run.steps_digest()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One end-to-end evaluation attempt of an agent against a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub agent_id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u8,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
}

impl Run {
    /// Create a new run in `running` state.
    pub fn new(agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            template_id: None,
            timestamp: Utc::now(),
            status: RunStatus::Running,
            score: None,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            steps: Vec::new(),
            certificate: None,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_pass_threshold(mut self, threshold: u8) -> Self {
        self.pass_threshold = threshold.min(SCORE_MAX);
        self
    }

    /// A certified run is read-only for grading.
    pub fn is_certified(&self) -> bool {
        self.certificate.is_some()
    }

    pub fn step_index(&self, step_id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == step_id)
    }

    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Append a step during live execution.
    pub fn push_step(&mut self, step: Step) -> Result<(), ModelError> {
        if self.status != RunStatus::Running {
            return Err(ModelError::RunNotRunning {
                run_id: self.id.0.clone(),
                status: self.status,
            });
        }
        if self.step_index(&step.id).is_some() {
            return Err(ModelError::DuplicateStep {
                run_id: self.id.0.clone(),
                step_id: step.id.0,
            });
        }
        self.steps.push(step);
        Ok(())
    }

    /// Indices of scoreable steps, in transcript order.
    pub fn scoreable_indices(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_scoreable())
            .map(|(i, _)| i)
            .collect()
    }

    /// Rounded integer average of every graded step's elected score.
    pub fn average_score(&self) -> Option<u8> {
        let scores: Vec<u32> = self
            .steps
            .iter()
            .filter(|s| s.is_scoreable())
            .filter_map(|s| s.score.map(u32::from))
            .collect();
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as u32;
        let sum: u32 = scores.iter().sum();
        Some(((sum + n / 2) / n) as u8)
    }

    /// Recompute `score` from the steps. Frozen once certified.
    ///
    /// Returns `true` if the score changed.
    pub fn recompute_score(&mut self) -> bool {
        if self.is_certified() {
            return false;
        }
        let next = self.average_score();
        let changed = next != self.score;
        self.score = next;
        changed
    }

    fn verdict(&self) -> RunStatus {
        match self.score {
            Some(score) if score >= self.pass_threshold => RunStatus::Pass,
            _ => RunStatus::Fail,
        }
    }

    /// Resolve a running run to `pass` or `fail`.
    pub fn resolve_verdict(&mut self) -> Result<RunStatus, ModelError> {
        if self.status != RunStatus::Running {
            return Err(ModelError::RunNotRunning {
                run_id: self.id.0.clone(),
                status: self.status,
            });
        }
        self.recompute_score();
        self.status = self.verdict();
        Ok(self.status)
    }

    /// Re-derive pass/fail after a re-election. Running and certified runs
    /// are left alone. Returns `true` if the status flipped.
    pub fn refresh_verdict(&mut self) -> bool {
        if self.is_certified() || self.status == RunStatus::Running {
            return false;
        }
        let next = self.verdict();
        let changed = next != self.status;
        self.status = next;
        changed
    }

    /// Nearest preceding interviewer and agent steps for the step at `index`.
    pub fn question_and_answer(&self, index: usize) -> (Option<&Step>, Option<&Step>) {
        let before = &self.steps[..index.min(self.steps.len())];
        let question = before.iter().rev().find(|s| s.role == StepRole::Interviewer);
        let answer = before.iter().rev().find(|s| s.role == StepRole::Agent);
        (question, answer)
    }

    /// Content digest of the step list.
    pub fn steps_digest(&self) -> Result<ContentDigest, serde_json::Error> {
        let bytes = serde_json::to_vec(&self.steps)?;
        Ok(ContentDigest::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(source: GradeSource, score: u8, reasoning: &str, at: DateTime<Utc>) -> GradeEntry {
        GradeEntry::new(source, score, reasoning, at).unwrap()
    }

    #[test]
    fn legacy_step_synthesizes_single_elected_entry() {
        let step = Step::legacy_graded("X", 72, false);
        let entries = step.entries();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source(), GradeSource::Automated);
        assert_eq!(entries[0].score(), 72);
        assert_eq!(entries[0].reasoning(), "X");
        assert!(entries[0].is_elected());
        assert!(step.grading_history().is_empty());
        assert_eq!(step.elected_index(), Some(0));
    }

    #[test]
    fn materialize_writes_legacy_entry_once() {
        let mut step = Step::legacy_graded("X", 72, true);
        assert!(step.materialize_history());
        assert!(!step.materialize_history());
        assert_eq!(step.grading_history().len(), 1);
        assert_eq!(step.grading_history()[0].source(), GradeSource::Human);
        step.check_invariants().unwrap();
    }

    #[test]
    fn ungraded_steps_have_no_entries() {
        assert!(Step::agent("hello").entries().is_empty());
        assert!(Step::new(StepRole::System, "note").entries().is_empty());
        assert_eq!(Step::agent("hello").elected_index(), None);
    }

    #[test]
    fn elected_index_prefers_explicit_flag() {
        let step = Step::graded(90, "good").unwrap();
        assert_eq!(step.elected_index(), Some(0));
        step.check_invariants().unwrap();
    }

    #[test]
    fn elected_index_falls_back_to_value_match() {
        let t0 = Utc::now();
        let mut step = Step::legacy_graded("first", 60, false);
        step.grading_history = vec![
            entry(GradeSource::Automated, 60, "first", t0),
            entry(GradeSource::Automated, 80, "second", t0 + Duration::seconds(1)),
        ];
        assert_eq!(step.elected_index(), Some(0));
        assert_eq!(step.display_order(), vec![0, 1]);
    }

    #[test]
    fn elected_index_defaults_to_most_recent_without_match() {
        let t0 = Utc::now();
        let mut step = Step::legacy_graded("unrelated", 10, false);
        step.grading_history = vec![
            entry(GradeSource::Automated, 60, "first", t0),
            entry(GradeSource::Human, 80, "second", t0 + Duration::seconds(1)),
        ];
        assert_eq!(step.elected_index(), Some(1));
    }

    #[test]
    fn materialize_flags_fallback_entry_on_unflagged_history() {
        let t0 = Utc::now();
        let mut step = Step::legacy_graded("first", 60, false);
        step.grading_history = vec![
            entry(GradeSource::Automated, 60, "first", t0),
            entry(GradeSource::Automated, 80, "second", t0 + Duration::seconds(1)),
        ];
        assert!(!step.materialize_history());
        assert!(step.grading_history()[0].is_elected());
        step.check_invariants().unwrap();
    }

    #[test]
    fn fallback_flag_aligns_mirrors_when_nothing_matches() {
        let t0 = Utc::now();
        let mut step = Step::legacy_graded("edited by hand", 55, false);
        step.grading_history = vec![
            entry(GradeSource::Automated, 60, "first", t0),
            entry(GradeSource::Human, 80, "second", t0 + Duration::seconds(1)),
        ];
        assert!(step.check_invariants().is_err());

        assert!(step.flag_fallback_election());
        assert_eq!(step.elected_index(), Some(1));
        assert_eq!(step.score, Some(80));
        assert!(step.is_human_graded);
        assert_eq!(step.content, "edited by hand");
        assert_eq!(step.grading_history()[1].elected_at(), None);
        step.check_invariants().unwrap();

        assert!(!step.flag_fallback_election());
    }

    #[test]
    fn fallback_flag_leaves_legacy_step_alone() {
        let mut step = Step::legacy_graded("72 looks right", 72, false);
        assert!(!step.flag_fallback_election());
        assert!(step.grading_history().is_empty());
    }

    #[test]
    fn display_order_elected_first_then_newest() {
        let mut step = Step::graded(50, "a").unwrap();
        let t = step.timestamp;
        step.push_entry(entry(GradeSource::Human, 60, "b", t + Duration::seconds(1)));
        step.push_entry(entry(GradeSource::Automated, 70, "c", t + Duration::seconds(2)));
        step.push_entry(entry(GradeSource::Human, 80, "d", t + Duration::seconds(3)));
        step.elect_entry(1, Utc::now()).unwrap();

        assert_eq!(step.display_order(), vec![1, 3, 2, 0]);
    }

    #[test]
    fn elect_human_keeps_content_and_flips_flag() {
        let mut step = Step::graded(90, "automated reasoning").unwrap();
        let idx = step.push_entry(entry(GradeSource::Human, 40, "too generous", Utc::now()));
        step.elect_entry(idx, Utc::now()).unwrap();

        assert_eq!(step.score, Some(40));
        assert!(step.is_human_graded);
        assert_eq!(step.content, "automated reasoning");
        step.check_invariants().unwrap();
    }

    #[test]
    fn elect_out_of_range_is_rejected() {
        let mut step = Step::graded(90, "ok").unwrap();
        let err = step.elect_entry(3, Utc::now()).unwrap_err();
        assert!(matches!(err, ModelError::EntryOutOfRange { len: 1, .. }));
    }

    #[test]
    fn score_above_max_is_rejected() {
        let err = GradeEntry::new(GradeSource::Human, 101, "x", Utc::now()).unwrap_err();
        assert_eq!(err, ModelError::ScoreOutOfRange { score: 101 });
    }

    #[test]
    fn average_rounds_half_up() {
        let mut run = Run::new("agent-1", "Agent One");
        run.push_step(Step::graded(70, "a").unwrap()).unwrap();
        run.push_step(Step::graded(71, "b").unwrap()).unwrap();
        assert_eq!(run.average_score(), Some(71));
    }

    #[test]
    fn resolve_and_refresh_verdict() {
        let mut run = Run::new("agent-1", "Agent One").with_pass_threshold(60);
        run.push_step(Step::graded(80, "a").unwrap()).unwrap();
        assert_eq!(run.resolve_verdict().unwrap(), RunStatus::Pass);
        assert!(run.resolve_verdict().is_err());

        run.steps[0].score = Some(20);
        run.recompute_score();
        assert!(run.refresh_verdict());
        assert_eq!(run.status, RunStatus::Fail);
    }

    #[test]
    fn push_step_requires_running_and_unique_ids() {
        let mut run = Run::new("agent-1", "Agent One");
        run.push_step(Step::agent("a").with_id("s1")).unwrap();
        let err = run.push_step(Step::agent("b").with_id("s1")).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateStep { .. }));

        run.resolve_verdict().unwrap();
        let err = run.push_step(Step::agent("c")).unwrap_err();
        assert!(matches!(err, ModelError::RunNotRunning { .. }));
    }

    #[test]
    fn question_and_answer_are_nearest_preceding() {
        let mut run = Run::new("agent-1", "Agent One");
        run.push_step(Step::interviewer("q1")).unwrap();
        run.push_step(Step::agent("a1")).unwrap();
        run.push_step(Step::graded(50, "v1").unwrap()).unwrap();
        run.push_step(Step::interviewer("q2")).unwrap();
        run.push_step(Step::agent("a2")).unwrap();
        run.push_step(Step::graded(60, "v2").unwrap()).unwrap();

        let (q, a) = run.question_and_answer(5);
        assert_eq!(q.map(|s| s.content.as_str()), Some("q2"));
        assert_eq!(a.map(|s| s.content.as_str()), Some("a2"));

        let (q, a) = run.question_and_answer(0);
        assert!(q.is_none() && a.is_none());
    }

    #[test]
    fn certified_score_is_frozen() {
        let mut run = Run::new("agent-1", "Agent One");
        run.push_step(Step::graded(90, "a").unwrap()).unwrap();
        run.resolve_verdict().unwrap();
        run.certificate = Some(Certificate::for_run(&run, Utc::now()).unwrap());

        run.steps[0].score = Some(10);
        assert!(!run.recompute_score());
        assert!(!run.refresh_verdict());
        assert_eq!(run.score, Some(90));
        assert_eq!(run.status, RunStatus::Pass);
    }

    #[test]
    fn wire_form_is_camel_case() {
        let step = Step::graded(90, "fine").unwrap();
        let json = serde_json::to_value(&step).unwrap();
        assert!(json.get("gradingHistory").is_some());
        assert_eq!(json["gradingHistory"][0]["isElected"], true);
        assert_eq!(json["gradingHistory"][0]["source"], "automated");
        assert_eq!(json["role"], "system");
    }
}
