//! Drives a pipeline run through its stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use tracing::{Instrument, error, info, info_span, warn};

use crate::archive::archive_artifacts;
use crate::config::EngineConfig;
use crate::credentials::CredentialStore;
use crate::definition::{FailurePolicy, PipelineDefinition};
use crate::error::PipelineError;
use crate::observability::MetricsCollector;
use crate::report::{GateOutcome, evaluate_gate, verdict_for};
use crate::run::{PipelineRun, RunRecorder, RunStatus, StageStatus};
use crate::stage::StageRunner;
use crate::steps::StepRegistry;

/// Engine state kept inside a workspace. Never reported as a step artifact.
pub const STATE_DIR: &str = ".bunker-ci";

/// Cooperative cancellation, observed between stages only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the archive directory named by the pipeline.
    pub archive_dir: Option<PathBuf>,
    pub run_id: Option<String>,
}

/// Shared, read-only engine state. Cloning is cheap, so each run (or each
/// task driving one) can hold its own handle.
#[derive(Clone)]
pub struct PipelineEngine {
    config: Arc<EngineConfig>,
    credentials: Arc<CredentialStore>,
    registry: Arc<StepRegistry>,
    metrics: MetricsCollector,
}

impl PipelineEngine {
    pub fn new(config: EngineConfig, credentials: CredentialStore, registry: StepRegistry) -> Self {
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            registry: Arc::new(registry),
            metrics: MetricsCollector::global().clone(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn load(&self, path: &Path) -> Result<Arc<PipelineDefinition>, PipelineError> {
        PipelineDefinition::load(path, &self.registry).map(Arc::new)
    }

    pub fn parse(&self, content: &str) -> Result<Arc<PipelineDefinition>, PipelineError> {
        PipelineDefinition::parse(content, &self.registry).map(Arc::new)
    }

    pub async fn run(
        &self,
        definition: Arc<PipelineDefinition>,
        workspace: &Path,
        cancel: &CancelToken,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_with(definition, workspace, cancel, &RunOptions::default())
            .await
    }

    /// Executes every stage in order and returns the frozen run.
    ///
    /// Step, stage and gate failures end up in the returned run; only a
    /// workspace that cannot be prepared is reported as an error.
    pub async fn run_with(
        &self,
        definition: Arc<PipelineDefinition>,
        workspace: &Path,
        cancel: &CancelToken,
        options: &RunOptions,
    ) -> Result<PipelineRun, PipelineError> {
        std::fs::create_dir_all(workspace)?;
        let workspace = workspace.canonicalize()?;
        let id = options
            .run_id
            .clone()
            .unwrap_or_else(|| generate_run_id(&definition.name));

        let span = info_span!("run", id = %id, pipeline = %definition.name);
        self.drive(definition, workspace, cancel, options, id)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        definition: Arc<PipelineDefinition>,
        workspace: PathBuf,
        cancel: &CancelToken,
        options: &RunOptions,
        id: String,
    ) -> Result<PipelineRun, PipelineError> {
        let started = Instant::now();
        let mut recorder = RunRecorder::new(id, definition.clone(), workspace.clone());
        recorder.transition(RunStatus::Running);
        info!(stages = definition.stages.len(), workspace = %workspace.display(), "Run started");

        let mut excluded = vec![workspace.join(STATE_DIR)];
        excluded.extend(self.archive_base(&definition, &workspace, options));
        let runner = StageRunner {
            config: &self.config,
            credentials: &self.credentials,
            registry: &self.registry,
            metrics: &self.metrics,
            artifact_exclude: &excluded,
        };
        let mut outcomes: Vec<Option<GateOutcome>> = vec![None; definition.gates.len()];

        for stage in &definition.stages {
            if cancel.is_cancelled() {
                warn!(next_stage = %stage.name, "Cancellation requested; aborting run");
                recorder.transition(RunStatus::Aborted);
                break;
            }

            let result = runner.run(&definition, stage, &workspace).await;
            let mut blocked_by_gate = false;
            for (slot, rule) in outcomes.iter_mut().zip(&definition.gates) {
                if rule.stage != stage.name {
                    continue;
                }
                let outcome = evaluate_gate(rule, &workspace, Some(&result));
                self.metrics.record_gate(&outcome);
                if let Some(err) = outcome.error() {
                    error!(error = %err, "Gate could not be evaluated");
                }
                if outcome.blocks() && stage.on_failure == FailurePolicy::AbortPipeline {
                    blocked_by_gate = true;
                }
                *slot = Some(outcome);
            }

            let stage_failed = result.status == StageStatus::Failed;
            recorder.record_stage(result);

            if stage_failed || blocked_by_gate {
                warn!(stage = %stage.name, gate = blocked_by_gate, "Stage failure aborts the run");
                recorder.transition(RunStatus::Failed);
                break;
            }
            recorder.transition(RunStatus::Running);
        }

        if recorder.status() == RunStatus::Running {
            recorder.transition(RunStatus::Succeeded);
        }

        let outcomes: Vec<GateOutcome> = outcomes
            .into_iter()
            .zip(&definition.gates)
            .map(|(outcome, rule)| outcome.unwrap_or_else(|| evaluate_gate(rule, &workspace, None)))
            .collect();
        let verdict = verdict_for(recorder.status(), &outcomes);
        for outcome in outcomes {
            recorder.record_gate(outcome);
        }

        let archived = match self.archive_dir(&definition, &workspace, options, recorder.id()) {
            Some(destination) => {
                match archive_artifacts(recorder.id(), recorder.stages(), &workspace, &destination) {
                    Ok(manifest) => manifest
                        .artifacts
                        .into_iter()
                        .map(|artifact| artifact.archived)
                        .collect(),
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "Artifact archival failed");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let status = recorder.status();
        self.metrics.record_run(status, started.elapsed());
        info!(status = ?status, verdict = %verdict, duration_ms = started.elapsed().as_millis() as u64, "Run finished");
        Ok(recorder.finish(verdict, archived))
    }

    fn archive_dir(
        &self,
        definition: &PipelineDefinition,
        workspace: &Path,
        options: &RunOptions,
        id: &str,
    ) -> Option<PathBuf> {
        self.archive_base(definition, workspace, options)
            .map(|base| base.join(id))
    }

    /// Directory holding the archives of every run, one subdirectory per run id.
    fn archive_base(
        &self,
        definition: &PipelineDefinition,
        workspace: &Path,
        options: &RunOptions,
    ) -> Option<PathBuf> {
        if let Some(dir) = &options.archive_dir {
            return Some(dir.clone());
        }
        if !definition.archive.enabled {
            return None;
        }
        Some(match &definition.archive.directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.join(STATE_DIR).join("archive"),
        })
    }
}

fn generate_run_id(pipeline: &str) -> String {
    let slug: String = pipeline
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{slug}-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"))
}
