use anyhow::{Context, Result};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const PRESETS: &[&str] = &["devsecops", "minimal"];

#[derive(Debug, Clone, Serialize)]
struct PresetPipeline {
    version: u32,
    name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    credentials: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    stages: Vec<StageEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    gates: Vec<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
struct StageEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_failure: Option<String>,
    steps: Vec<StepEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct StepEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    uses: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(rename = "with", skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    credentials: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<String>,
}

/// Renders a preset pipeline as YAML.
pub fn render_preset(name: &str) -> Result<String> {
    let preset = match name {
        "devsecops" => devsecops_preset(),
        "minimal" => minimal_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };
    Ok(serde_yaml::to_string(&preset)?)
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let rendered = render_preset(name)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset pipeline: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Checkout, SonarQube, Dependency-Check, Trivy filesystem scan, image build,
/// Trivy image scan, push and deploy.
fn devsecops_preset() -> PresetPipeline {
    PresetPipeline {
        version: 1,
        name: "webapp-devsecops".into(),
        credentials: vec!["sonar-token".into()],
        environment: [(
            "IMAGE".to_string(),
            "registry.example.com/webapp:latest".to_string(),
        )]
        .into(),
        stages: vec![
            stage(
                "checkout",
                None,
                vec![step(
                    "checkout",
                    params(vec![
                        ("repository", val_str("https://github.com/example/webapp.git")),
                        ("branch", val_str("main")),
                        ("directory", val_str("app")),
                        ("depth", Value::from(1u64)),
                    ]),
                )],
            ),
            stage(
                "sonarqube",
                Some("continue-pipeline"),
                vec![StepEntry {
                    credentials: vec!["sonar-token".into()],
                    ..step(
                        "sonar-scanner",
                        params(vec![
                            ("project_key", val_str("webapp")),
                            ("sources", val_str("app")),
                            ("host_url", val_str("http://sonarqube:9000")),
                        ]),
                    )
                }],
            ),
            stage(
                "dependency-check",
                None,
                vec![StepEntry {
                    artifacts: vec!["reports/dependency-check-report.json".into()],
                    timeout: Some(3600),
                    ..step(
                        "dependency-check",
                        params(vec![
                            ("project", val_str("webapp")),
                            ("scan", val_str("app")),
                            ("format", val_str("JSON")),
                            ("out", val_str("reports")),
                        ]),
                    )
                }],
            ),
            stage(
                "trivy-fs",
                None,
                vec![StepEntry {
                    artifacts: vec!["reports/trivy-fs.json".into()],
                    ..step(
                        "trivy",
                        params(vec![
                            ("target", val_str("fs")),
                            ("subject", val_str("app")),
                            ("output", val_str("reports/trivy-fs.json")),
                        ]),
                    )
                }],
            ),
            stage(
                "build-image",
                None,
                vec![step(
                    "docker",
                    params(vec![
                        ("action", val_str("build")),
                        ("image", val_str("${{ env.IMAGE }}")),
                        ("context", val_str("app")),
                    ]),
                )],
            ),
            stage(
                "trivy-image",
                None,
                vec![StepEntry {
                    artifacts: vec!["reports/trivy-image.json".into()],
                    ..step(
                        "trivy",
                        params(vec![
                            ("target", val_str("image")),
                            ("subject", val_str("${{ env.IMAGE }}")),
                            ("output", val_str("reports/trivy-image.json")),
                        ]),
                    )
                }],
            ),
            stage(
                "push",
                None,
                vec![step(
                    "docker",
                    params(vec![
                        ("action", val_str("push")),
                        ("image", val_str("${{ env.IMAGE }}")),
                    ]),
                )],
            ),
            stage(
                "deploy",
                None,
                vec![step(
                    "docker",
                    params(vec![
                        ("action", val_str("run")),
                        ("image", val_str("${{ env.IMAGE }}")),
                        ("name", val_str("webapp")),
                        ("ports", Value::from(vec![val_str("8080:8080")])),
                        ("remove", Value::Bool(true)),
                    ]),
                )],
            ),
        ],
        gates: vec![
            gate(vec![
                ("name", val_str("dependency-check-critical")),
                ("stage", val_str("dependency-check")),
                ("artifact", val_str("reports/dependency-check-report.json")),
                ("kind", val_str("severity")),
                ("format", val_str("dependency-check")),
                ("fail_on", val_str("critical")),
            ]),
            gate(vec![
                ("name", val_str("trivy-fs-high")),
                ("stage", val_str("trivy-fs")),
                ("artifact", val_str("reports/trivy-fs.json")),
                ("kind", val_str("severity")),
                ("format", val_str("trivy")),
                ("max", limits(vec![("critical", 0), ("high", 5)])),
            ]),
            gate(vec![
                ("name", val_str("trivy-image-critical")),
                ("stage", val_str("trivy-image")),
                ("artifact", val_str("reports/trivy-image.json")),
                ("kind", val_str("severity")),
                ("format", val_str("trivy")),
                ("fail_on", val_str("critical")),
            ]),
        ],
    }
}

fn minimal_preset() -> PresetPipeline {
    PresetPipeline {
        version: 1,
        name: "minimal".into(),
        credentials: Vec::new(),
        environment: BTreeMap::new(),
        stages: vec![
            stage(
                "build",
                None,
                vec![StepEntry {
                    command: Some("make build".into()),
                    ..step("shell", BTreeMap::new())
                }],
            ),
            stage(
                "test",
                None,
                vec![StepEntry {
                    command: Some("make test".into()),
                    ..step("shell", BTreeMap::new())
                }],
            ),
        ],
        gates: Vec::new(),
    }
}

fn stage(name: &str, on_failure: Option<&str>, steps: Vec<StepEntry>) -> StageEntry {
    StageEntry {
        name: name.into(),
        on_failure: on_failure.map(str::to_string),
        steps,
    }
}

fn step(uses: &str, params: BTreeMap<String, Value>) -> StepEntry {
    StepEntry {
        uses: uses.into(),
        params,
        ..StepEntry::default()
    }
}

fn params(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

fn gate(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    params(entries)
}

fn limits(entries: Vec<(&str, u64)>) -> Value {
    let mut mapping = serde_yaml::Mapping::new();
    for (severity, limit) in entries {
        mapping.insert(val_str(severity), Value::from(limit));
    }
    Value::Mapping(mapping)
}

fn val_str(value: &str) -> Value {
    Value::String(value.to_string())
}
