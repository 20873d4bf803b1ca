use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path};

use serde::Serialize;

use crate::credentials::normalize_name;
use crate::definition::{PipelineDefinition, SUPPORTED_VERSION, StageSpec, StepSpec};
use crate::interpolate::{Placeholder, placeholders};
use crate::steps::StepRegistry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_definition(def: &PipelineDefinition, registry: &StepRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if def.version != SUPPORTED_VERSION {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", def.version));
    }

    if def.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut declared = HashSet::new();
    for name in &def.credentials {
        if !declared.insert(normalize_name(name)) {
            report
                .warnings
                .push(format!("Credential '{name}' is declared more than once"));
        }
    }

    let mut seen = HashSet::new();
    for (idx, stage) in def.stages.iter().enumerate() {
        if stage.name.trim().is_empty() {
            report
                .errors
                .push(format!("Stage {} has an empty name", idx + 1));
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate stage name '{}'", stage.name));
        }
        report.merge(validate_stage(stage, &declared, registry));
    }

    let used: BTreeSet<String> = def
        .stages
        .iter()
        .flat_map(|stage| &stage.steps)
        .flat_map(|step| &step.credentials)
        .map(|credential| normalize_name(credential.name()))
        .collect();
    for name in &def.credentials {
        if !used.contains(&normalize_name(name)) {
            report
                .warnings
                .push(format!("Credential '{name}' is declared but no step uses it"));
        }
    }

    let mut gate_names = HashSet::new();
    for gate in &def.gates {
        let label = gate.label();
        match def.stage(&gate.stage) {
            None => report.errors.push(format!(
                "Gate '{label}' refers to unknown stage '{}'",
                gate.stage
            )),
            Some(stage) if !stage.enabled => report.warnings.push(format!(
                "Gate '{label}' inspects disabled stage '{}' and will not be evaluated",
                gate.stage
            )),
            Some(_) => {}
        }
        if let Some(problem) = unsafe_pattern(&gate.artifact) {
            report
                .errors
                .push(format!("Gate '{label}' artifact pattern {problem}"));
        }
        report.errors.extend(gate.validate());
        if !gate_names.insert(label.clone()) {
            report
                .warnings
                .push(format!("Gate name '{label}' is used more than once"));
        }
    }

    report
}

fn validate_stage(
    stage: &StageSpec,
    declared: &HashSet<String>,
    registry: &StepRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if stage.steps.is_empty() {
        report
            .errors
            .push(format!("Stage '{}' must contain at least one step", stage.name));
    }

    for (idx, step) in stage.steps.iter().enumerate() {
        let prefix = format!("Stage '{}' step {}", stage.name, idx + 1);
        let mut step_report = validate_step(step, declared, registry);
        for error in step_report.errors.drain(..) {
            report.errors.push(format!("{prefix}: {error}"));
        }
        for warning in step_report.warnings.drain(..) {
            report.warnings.push(format!("{prefix}: {warning}"));
        }
    }

    report
}

fn validate_step(
    step: &StepSpec,
    declared: &HashSet<String>,
    registry: &StepRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Err(err) = registry.create(step) {
        report.errors.push(format!("{err:#}"));
    }

    let mut bound = HashSet::new();
    for credential in &step.credentials {
        let name = normalize_name(credential.name());
        if !declared.contains(&name) {
            report.errors.push(format!(
                "references undeclared credential '{}'",
                credential.name()
            ));
        }
        bound.insert(name);
    }

    for text in step_texts(step) {
        for placeholder in placeholders(text) {
            match placeholder {
                Placeholder::Credential(name) if !bound.contains(&normalize_name(&name)) => {
                    report.errors.push(format!(
                        "uses credential '{name}' without listing it under 'credentials'"
                    ));
                }
                Placeholder::Unknown(expr) => report
                    .warnings
                    .push(format!("unknown placeholder '${{{{ {expr} }}}}' renders empty")),
                _ => {}
            }
        }
    }

    if step.timeout == Some(0) {
        report
            .errors
            .push("timeout must be greater than zero".into());
    }

    for pattern in &step.artifacts {
        if let Some(problem) = unsafe_pattern(pattern) {
            report.errors.push(format!("artifact pattern {problem}"));
        }
    }

    report
}

/// Every string of a step that goes through interpolation.
fn step_texts(step: &StepSpec) -> Vec<&str> {
    let mut texts: Vec<&str> = step.command.iter().map(String::as_str).collect();
    texts.extend(step.args.iter().map(String::as_str));
    texts.extend(step.environment.values().map(String::as_str));
    texts.extend(step.params.values().filter_map(|value| value.as_str()));
    texts.extend(
        step.params
            .values()
            .filter_map(|value| value.as_array())
            .flatten()
            .filter_map(|value| value.as_str()),
    );
    texts
}

fn unsafe_pattern(pattern: &str) -> Option<String> {
    if pattern.trim().is_empty() {
        return Some("cannot be empty".into());
    }
    if let Err(err) = glob::Pattern::new(pattern) {
        return Some(format!("'{pattern}' is not a valid glob: {err}"));
    }
    let escapes = Path::new(pattern)
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    escapes.then(|| format!("'{pattern}' must stay inside the workspace"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str) -> ValidationReport {
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        validate_definition(&def, &StepRegistry::with_defaults())
    }

    #[test]
    fn accepts_minimal_pipeline() {
        let report = validate("version: 1\nstages:\n  - name: build\n    steps:\n      - command: make\n");
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn rejects_escaping_artifacts() {
        let report = validate(
            "version: 1\nstages:\n  - name: build\n    steps:\n      - command: make\n        artifacts: [\"../out/*.jar\", \"/etc/passwd\"]\n",
        );
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert!(report.errors[0].contains("must stay inside the workspace"));
    }

    #[test]
    fn placeholder_credentials_must_be_bound() {
        let report = validate(
            "version: 1\ncredentials: [sonar-token]\nstages:\n  - name: scan\n    steps:\n      - command: sonar-scanner\n        args: [\"-Dsonar.token=${{ credentials.sonar-token }}\"]\n",
        );
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("without listing it under 'credentials'"));
    }

    #[test]
    fn zero_timeout_and_unknown_version_are_errors() {
        let report = validate(
            "version: 2\nstages:\n  - name: build\n    steps:\n      - command: make\n        timeout: 0\n",
        );
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    }

    #[test]
    fn unused_credentials_only_warn() {
        let report = validate(
            "version: 1\ncredentials: [docker-password]\nstages:\n  - name: build\n    steps:\n      - command: make\n",
        );
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);
    }
}
