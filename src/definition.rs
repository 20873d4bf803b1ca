use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credentials::default_variable;
use crate::error::PipelineError;
use crate::report::GateRule;
use crate::steps::StepRegistry;
use crate::validation::validate_definition;

pub const SUPPORTED_VERSION: u32 = 1;

pub type StepParameters = Map<String, Value>;

/// A parsed pipeline. Never mutated once [`PipelineDefinition::parse`] has
/// accepted it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineDefinition {
    pub version: u32,
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Every credential a step may ask for has to be declared here.
    #[serde(default)]
    pub credentials: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub gates: Vec<GateRule>,
    #[serde(default)]
    pub archive: ArchiveOptions,
}

/// Where artifacts of completed stages are copied once the run ends.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveOptions {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Relative paths are resolved against the workspace.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

impl PipelineDefinition {
    /// Reads and validates a pipeline file. Anything that keeps the file from
    /// being a usable definition is reported as `MalformedPipeline`.
    pub fn load(path: &Path, registry: &StepRegistry) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::malformed(format!(
                "Failed to read pipeline file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&content, registry)
    }

    pub fn parse(content: &str, registry: &StepRegistry) -> Result<Self, PipelineError> {
        Self::from_yaml(content)?.checked(registry)
    }

    /// Syntax-only parse; see [`PipelineDefinition::parse`] for the validated form.
    pub fn from_yaml(content: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(content)
            .map_err(|err| PipelineError::malformed(format!("Invalid pipeline YAML: {err}")))
    }

    pub fn checked(self, registry: &StepRegistry) -> Result<Self, PipelineError> {
        let report = validate_definition(&self, registry);
        if report.is_ok() {
            Ok(self)
        } else {
            Err(PipelineError::MalformedPipeline {
                errors: report.errors,
            })
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|stage| stage.name.clone()).collect()
    }

    pub fn gates_for<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a GateRule> + 'a {
        self.gates.iter().filter(move |gate| gate.stage == stage)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    AbortPipeline,
    ContinuePipeline,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<StepSpec>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_step_kind")]
    pub uses: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "with")]
    pub params: StepParameters,
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
    /// Seconds; the engine default applies when unset.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Glob patterns, relative to the workspace, of files this step produces.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Unnamed command steps are labelled with the first line of the command,
/// cut to this many characters.
const DISPLAY_NAME_CHARS: usize = 40;

fn default_step_kind() -> String {
    "exec".to_string()
}

impl StepSpec {
    pub fn display_name(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.command, self.uses.as_str()) {
            (Some(command), "exec" | "shell") => {
                let line = command.lines().next().unwrap_or_default();
                line.chars().take(DISPLAY_NAME_CHARS).collect()
            }
            _ => format!("{}#{}", self.uses, index + 1),
        }
    }
}

/// A credential reference, either a bare name or a name with an explicit
/// environment variable to export it as.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialRef {
    Name(String),
    Bound {
        name: String,
        #[serde(default)]
        variable: Option<String>,
    },
}

impl CredentialRef {
    pub fn name(&self) -> &str {
        match self {
            CredentialRef::Name(name) => name,
            CredentialRef::Bound { name, .. } => name,
        }
    }

    pub fn variable(&self) -> String {
        match self {
            CredentialRef::Bound {
                variable: Some(variable),
                ..
            } => variable.clone(),
            other => default_variable(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
version: 1
name: webapp
credentials: [sonar-token]
stages:
  - name: scan
    on_failure: continue-pipeline
    steps:
      - uses: shell
        command: echo scanning
        credentials:
          - sonar-token
          - name: sonar-token
            variable: SONAR_LOGIN
        artifacts: ["reports/*.json"]
"#;

    #[test]
    fn yaml_fields_map_onto_specs() {
        let def = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert_eq!(def.name, "webapp");
        let stage = def.stage("scan").unwrap();
        assert_eq!(stage.on_failure, FailurePolicy::ContinuePipeline);
        assert!(stage.enabled);
        let step = &stage.steps[0];
        assert_eq!(step.uses, "shell");
        assert_eq!(step.credentials[0].variable(), "SONAR_TOKEN");
        assert_eq!(step.credentials[1].variable(), "SONAR_LOGIN");
        assert_eq!(step.display_name(0), "echo scanning");
    }

    #[test]
    fn invalid_yaml_is_malformed() {
        let err = PipelineDefinition::from_yaml("version: [").unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn policy_defaults_to_abort() {
        let def = PipelineDefinition::from_yaml(
            "version: 1\nstages:\n  - name: build\n    steps:\n      - command: make\n",
        )
        .unwrap();
        assert_eq!(def.stages[0].on_failure, FailurePolicy::AbortPipeline);
        assert_eq!(def.stages[0].steps[0].uses, "exec");
        assert_eq!(def.name, "pipeline");
        assert!(def.archive.enabled);
        assert!(def.archive.directory.is_none());
    }

    #[test]
    fn long_command_labels_cut_on_char_boundaries() {
        let step = StepSpec {
            uses: "shell".into(),
            command: Some(format!("echo '{}é done'", "a".repeat(33))),
            ..StepSpec::default()
        };
        let label = step.display_name(0);
        assert_eq!(label.chars().count(), 40);
        assert!(label.ends_with("aé"));

        let short = StepSpec {
            uses: "exec".into(),
            command: Some("построить\nsecond line".into()),
            ..StepSpec::default()
        };
        assert_eq!(short.display_name(0), "построить");
    }
}
