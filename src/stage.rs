//! Sequential execution of the steps of one stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::credentials::{CredentialError, CredentialStore, ResolvedEnv};
use crate::definition::{FailurePolicy, PipelineDefinition, StageSpec, StepSpec};
use crate::interpolate::Interpolator;
use crate::observability::MetricsCollector;
use crate::run::{
    MISSING_CREDENTIAL_EXIT_CODE, StageResult, StageStatus, StepOutcome, StepResult,
};
use crate::steps::{StepContext, StepRegistry};

pub struct StageRunner<'a> {
    pub config: &'a EngineConfig,
    pub credentials: &'a CredentialStore,
    pub registry: &'a StepRegistry,
    pub metrics: &'a MetricsCollector,
    /// Passed to every step; see [`StepContext::artifact_exclude`].
    pub artifact_exclude: &'a [PathBuf],
}

impl StageRunner<'_> {
    /// Runs the steps of `stage` in declared order.
    ///
    /// Under `abort-pipeline` the first failing step ends the stage and marks
    /// it failed. Under `continue-pipeline` every step runs and the stage
    /// counts as succeeded; the failures stay visible in the step results.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        stage: &StageSpec,
        workspace: &Path,
    ) -> StageResult {
        if !stage.enabled {
            info!(stage = %stage.name, "Stage disabled; skipping");
            return StageResult::skipped(&stage.name, stage.on_failure);
        }

        let started = Instant::now();
        let mut timer = self.metrics.start_stage(&stage.name);
        let mut steps = Vec::with_capacity(stage.steps.len());
        let mut status = StageStatus::Succeeded;
        info!(stage = %stage.name, steps = stage.steps.len(), "Stage started");

        for (index, spec) in stage.steps.iter().enumerate() {
            let span = info_span!("step", stage = %stage.name, index, kind = %spec.uses);
            let result = self
                .run_step(definition, stage, index, spec, workspace)
                .instrument(span)
                .await;
            self.metrics.record_step(&result);

            let passed = result.passed();
            if passed {
                info!(stage = %stage.name, step = %result.name, duration_ms = result.duration_ms, "Step succeeded");
            } else if let Some(err) = result.error(&stage.name) {
                warn!(stage = %stage.name, step = %result.name, error = %err, "Step failed");
            }
            steps.push(result);

            if !passed && stage.on_failure == FailurePolicy::AbortPipeline {
                status = StageStatus::Failed;
                timer.mark_failed();
                break;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(stage = %stage.name, status = ?status, duration_ms, "Stage finished");
        StageResult {
            name: stage.name.clone(),
            policy: stage.on_failure,
            status,
            steps,
            duration_ms,
        }
    }

    async fn run_step(
        &self,
        definition: &PipelineDefinition,
        stage: &StageSpec,
        index: usize,
        spec: &StepSpec,
        workspace: &Path,
    ) -> StepResult {
        let name = spec.display_name(index);

        let secrets = match self.credentials.resolve(&spec.credentials) {
            Ok(secrets) => secrets,
            Err(CredentialError::Missing(credential)) => {
                let mut result = StepResult::not_started(
                    index,
                    name,
                    spec.uses.clone(),
                    StepOutcome::MissingCredential,
                    MISSING_CREDENTIAL_EXIT_CODE,
                    format!("Credential '{credential}' is not available; step not started"),
                );
                result.missing_credential = Some(credential);
                return result;
            }
        };

        let timeout = spec
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_timeout());
        let env = self.step_environment(definition, stage, spec, workspace, &secrets);
        let ctx = StepContext {
            stage: &stage.name,
            index,
            name,
            spec,
            workspace,
            config: self.config,
            timeout,
            env,
            artifact_exclude: self.artifact_exclude,
        };

        let runner = match self.registry.create(spec) {
            Ok(runner) => runner,
            Err(err) => return ctx.rejected(&spec.uses, format!("{err:#}")),
        };
        info!(step = %ctx.name, timeout_secs = timeout.as_secs(), "Step started");
        runner.run(&ctx, &secrets).await
    }

    /// Host allowlist, then pipeline, stage and step variables, each layer
    /// overriding the previous one. Values go through interpolation.
    fn step_environment(
        &self,
        definition: &PipelineDefinition,
        stage: &StageSpec,
        spec: &StepSpec,
        workspace: &Path,
        secrets: &ResolvedEnv,
    ) -> BTreeMap<String, String> {
        let mut env = self.config.inherited_env();
        env.insert("CI".into(), "true".into());
        env.insert("WORKSPACE".into(), workspace.to_string_lossy().to_string());
        env.insert("BUNKER_CI_PIPELINE".into(), definition.name.clone());
        env.insert("BUNKER_CI_STAGE".into(), stage.name.clone());

        for layer in [&definition.environment, &stage.environment, &spec.environment] {
            let rendered: Vec<(String, String)> = {
                let interpolator = Interpolator {
                    workspace,
                    env: &env,
                    config: self.config,
                    secrets,
                };
                layer
                    .iter()
                    .map(|(key, value)| (key.clone(), interpolator.render(value)))
                    .collect()
            };
            env.extend(rendered);
        }
        env
    }
}
