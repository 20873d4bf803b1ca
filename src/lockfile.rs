use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::definition::{FailurePolicy, PipelineDefinition, StepSpec};
use crate::report::GateRule;

/// Pins a pipeline definition: one digest per step and gate, plus one over
/// the whole definition, so a reviewer can tell exactly what changed.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub pipeline: String,
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub definition_hash: String,
    pub credentials: Vec<String>,
    pub stages: Vec<StageLock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageLock {
    pub name: String,
    pub on_failure: FailurePolicy,
    pub steps: Vec<StepLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepLock {
    pub name: String,
    pub uses: String,
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GateLock {
    pub name: String,
    pub stage: String,
    pub hash: String,
}

pub fn build_lock(definition: &PipelineDefinition) -> PipelineLock {
    let stages = definition
        .stages
        .iter()
        .map(|stage| StageLock {
            name: stage.name.clone(),
            on_failure: stage.on_failure,
            steps: stage
                .steps
                .iter()
                .enumerate()
                .map(|(index, step)| StepLock {
                    name: step.display_name(index),
                    uses: step.uses.clone(),
                    hash: hash_step(&stage.name, step),
                })
                .collect(),
        })
        .collect();
    let gates = definition
        .gates
        .iter()
        .map(|gate| GateLock {
            name: gate.label(),
            stage: gate.stage.clone(),
            hash: hash_gate(gate),
        })
        .collect();

    PipelineLock {
        pipeline: definition.name.clone(),
        version: definition.version,
        generated_at: Utc::now(),
        definition_hash: hash_value(definition.name.as_bytes(), definition),
        credentials: definition.credentials.clone(),
        stages,
        gates,
    }
}

pub fn generate_lock(definition: &PipelineDefinition, path: &Path) -> Result<PipelineLock> {
    let lock = build_lock(definition);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(lock)
}

fn hash_step(stage: &str, step: &StepSpec) -> String {
    hash_value(stage.as_bytes(), step)
}

fn hash_gate(gate: &GateRule) -> String {
    hash_value(gate.stage.as_bytes(), gate)
}

fn hash_value<T: Serialize>(prefix: &[u8], value: &T) -> String {
    let mut hasher = Sha256::new();
    // Going through `Value` sorts map keys, so equal definitions hash equally.
    let value = serde_json::to_value(value).unwrap_or_default();
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(prefix);
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
