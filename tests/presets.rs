use bunker_ci::definition::PipelineDefinition;
use bunker_ci::presets::{PRESETS, generate_preset, render_preset};
use bunker_ci::steps::StepRegistry;
use std::fs;
use tempfile::tempdir;

#[test]
fn generate_devsecops_preset_writes_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pipelines/devsecops.yaml");
    let generated = generate_preset("devsecops", &path).expect("preset generation");
    assert!(generated.exists());
    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("uses: sonar-scanner"));
    assert!(contents.contains("format: dependency-check"));
}

#[test]
fn every_preset_is_a_valid_pipeline() {
    let registry = StepRegistry::with_defaults();
    for name in PRESETS {
        let rendered = render_preset(name).unwrap();
        let def = PipelineDefinition::parse(&rendered, &registry)
            .unwrap_or_else(|err| panic!("preset {name} is invalid: {err}"));
        assert!(!def.stages.is_empty());
    }
}

#[test]
fn devsecops_preset_follows_reference_order() {
    let rendered = render_preset("devsecops").unwrap();
    let def = PipelineDefinition::from_yaml(&rendered).unwrap();
    assert_eq!(
        def.stage_names(),
        vec![
            "checkout",
            "sonarqube",
            "dependency-check",
            "trivy-fs",
            "build-image",
            "trivy-image",
            "push",
            "deploy"
        ]
    );
    assert_eq!(def.gates.len(), 3);
}

#[test]
fn unknown_preset_is_rejected() {
    let err = render_preset("jenkins").unwrap_err();
    assert!(err.to_string().contains("devsecops"));
}
