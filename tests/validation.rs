use std::fs;
use std::path::PathBuf;

use bunker_ci::definition::PipelineDefinition;
use bunker_ci::error::PipelineError;
use bunker_ci::lockfile::generate_lock;
use bunker_ci::steps::StepRegistry;
use bunker_ci::validation::validate_definition;
use tempfile::tempdir;

fn registry() -> StepRegistry {
    StepRegistry::with_defaults()
}

fn malformed_errors(yaml: &str) -> Vec<String> {
    match PipelineDefinition::parse(yaml, &registry()) {
        Err(PipelineError::MalformedPipeline { errors }) => errors,
        Err(other) => panic!("expected MalformedPipeline, got {other:?}"),
        Ok(_) => panic!("expected pipeline to be rejected"),
    }
}

#[test]
fn unique_stages_and_declared_credentials_parse() {
    let def = PipelineDefinition::parse(
        r#"
version: 1
credentials: [sonar-token]
stages:
  - name: checkout
    steps:
      - uses: checkout
        with: { repository: "https://github.com/example/webapp.git" }
  - name: scan
    steps:
      - uses: sonar-scanner
        credentials: [sonar-token]
        with: { project_key: webapp }
"#,
        &registry(),
    )
    .unwrap();
    assert_eq!(def.stage_names(), vec!["checkout", "scan"]);
}

#[test]
fn duplicate_stage_names_are_malformed() {
    let errors = malformed_errors(
        "version: 1\nstages:\n  - name: build\n    steps:\n      - command: make\n  - name: build\n    steps:\n      - command: make\n",
    );
    assert_eq!(errors, vec!["Duplicate stage name 'build'"]);
}

#[test]
fn undeclared_credentials_are_malformed() {
    let errors = malformed_errors(
        "version: 1\nstages:\n  - name: push\n    steps:\n      - command: docker\n        credentials: [registry-password]\n",
    );
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Stage 'push' step 1"));
    assert!(errors[0].contains("undeclared credential 'registry-password'"));
}

#[test]
fn every_problem_is_reported_at_once() {
    let errors = malformed_errors(
        r#"
version: 1
stages:
  - name: scan
    steps:
      - uses: nessus
      - uses: trivy
        with: { target: fs }
      - uses: exec
  - name: empty
    steps: []
gates:
  - stage: deploy
    artifact: report.json
    kind: artifact
"#,
    );
    assert_eq!(errors.len(), 5, "{errors:#?}");
    assert!(errors.iter().any(|e| e.contains("Unknown step kind 'nessus'")));
    assert!(errors.iter().any(|e| e.contains("requires 'subject'")));
    assert!(errors.iter().any(|e| e.contains("requires a 'command'")));
    assert!(errors.iter().any(|e| e.contains("'empty' must contain at least one step")));
    assert!(errors.iter().any(|e| e.contains("unknown stage 'deploy'")));
}

#[test]
fn malformed_yaml_is_reported_as_malformed_pipeline() {
    let errors = malformed_errors("version: 1\nstages: {");
    assert!(errors[0].starts_with("Invalid pipeline YAML"));
}

#[test]
fn missing_file_is_malformed() {
    let err = PipelineDefinition::load(&PathBuf::from("/nonexistent/pipeline.yaml"), &registry())
        .unwrap_err();
    assert!(err.is_malformed());
}

#[test]
fn bundled_sample_pipeline_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pipelines/devsecops.yaml");
    let content = fs::read_to_string(&path).unwrap();
    let def = PipelineDefinition::from_yaml(&content).unwrap();
    let report = validate_definition(&def, &registry());
    assert!(report.is_ok(), "{:#?}", report.errors);
    assert!(report.warnings.is_empty(), "{:#?}", report.warnings);
    assert_eq!(def.stages.len(), 8);
    assert_eq!(def.gates.len(), 3);
}

#[test]
fn lockfile_generates_expected_yaml() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pipelines/devsecops.yaml");
    let def = PipelineDefinition::load(&path, &registry()).unwrap();
    let temp = tempdir().unwrap();
    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&def, &lock_path).unwrap();

    let content = fs::read_to_string(&lock_path).unwrap();
    assert!(content.contains("pipeline: webapp-devsecops"));
    assert!(content.contains("definition_hash"));
    assert!(content.contains("name: trivy-image-critical"));
}
