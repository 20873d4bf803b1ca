//! Results recorded while a pipeline executes.
//!
//! [`RunRecorder`] is the only way to build a [`PipelineRun`]; it only ever
//! appends, and [`RunRecorder::finish`] freezes the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::definition::{FailurePolicy, PipelineDefinition};
use crate::error::PipelineError;
use crate::report::{GateOutcome, Verdict};

/// Exit status reported when a step was killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit status reported when a step was skipped for lack of a credential.
pub const MISSING_CREDENTIAL_EXIT_CODE: i32 = -2;
/// Exit status reported when a step never yielded one: it could not be
/// spawned, was rejected before spawning, or could not be waited on.
pub const NO_EXIT_CODE: i32 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    TimedOut,
    MissingCredential,
    SpawnError,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub outcome: StepOutcome,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub artifacts: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_credential: Option<String>,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == StepOutcome::TimedOut
    }

    pub(crate) fn not_started(
        index: usize,
        name: String,
        kind: String,
        outcome: StepOutcome,
        exit_code: i32,
        message: String,
    ) -> Self {
        Self {
            index,
            name,
            kind,
            outcome,
            exit_code,
            stdout: String::new(),
            stderr: message,
            duration_ms: 0,
            artifacts: Vec::new(),
            missing_credential: None,
        }
    }

    /// The failure as a typed error, with enough context to reproduce the invocation.
    pub fn error(&self, stage: &str) -> Option<PipelineError> {
        match self.outcome {
            StepOutcome::Succeeded => None,
            StepOutcome::TimedOut => Some(PipelineError::TimeoutFailure {
                stage: stage.to_string(),
                step_index: self.index,
                timeout: Duration::from_millis(self.duration_ms),
            }),
            StepOutcome::MissingCredential => Some(PipelineError::MissingCredential {
                stage: stage.to_string(),
                step_index: self.index,
                name: self.missing_credential.clone().unwrap_or_default(),
            }),
            StepOutcome::Failed | StepOutcome::SpawnError => Some(PipelineError::StepFailure {
                stage: stage.to_string(),
                step_index: self.index,
                exit_code: self.exit_code,
                message: last_line(&self.stderr),
            }),
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub name: String,
    pub policy: FailurePolicy,
    pub status: StageStatus,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn skipped(name: &str, policy: FailurePolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
            status: StageStatus::Skipped,
            steps: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|step| !step.passed())
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.steps
            .iter()
            .flat_map(|step| step.artifacts.iter().map(PathBuf::as_path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Aborted)
        )
    }
}

/// A finished pipeline run. Read-only.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    id: String,
    #[serde(skip)]
    definition: Arc<PipelineDefinition>,
    pipeline: String,
    workspace: PathBuf,
    status: RunStatus,
    stages: Vec<StageResult>,
    gates: Vec<GateOutcome>,
    verdict: Verdict,
    archived: Vec<PathBuf>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn gates(&self) -> &[GateOutcome] {
        &self.gates
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn archived(&self) -> &[PathBuf] {
        &self.archived
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Stages that ran to completion, in execution order.
    pub fn completed_stages(&self) -> impl Iterator<Item = &StageResult> {
        self.stages
            .iter()
            .filter(|stage| stage.status != StageStatus::Skipped)
    }
}

/// Append-only builder for a [`PipelineRun`].
#[derive(Debug)]
pub struct RunRecorder {
    id: String,
    definition: Arc<PipelineDefinition>,
    workspace: PathBuf,
    status: RunStatus,
    stages: Vec<StageResult>,
    gates: Vec<GateOutcome>,
    started_at: DateTime<Utc>,
}

impl RunRecorder {
    pub fn new(id: String, definition: Arc<PipelineDefinition>, workspace: PathBuf) -> Self {
        Self {
            id,
            definition,
            workspace,
            status: RunStatus::Pending,
            stages: Vec::new(),
            gates: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves the state machine forward. Illegal transitions are ignored and
    /// reported as `false`.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(from = ?self.status, to = ?next, "Rejected run status transition");
            false
        }
    }

    pub fn record_stage(&mut self, stage: StageResult) {
        self.stages.push(stage);
    }

    pub fn record_gate(&mut self, outcome: GateOutcome) {
        self.gates.push(outcome);
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn finish(self, verdict: Verdict, archived: Vec<PathBuf>) -> PipelineRun {
        PipelineRun {
            id: self.id,
            pipeline: self.definition.name.clone(),
            definition: self.definition,
            workspace: self.workspace,
            status: self.status,
            stages: self.stages,
            gates: self.gates,
            verdict,
            archived,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
