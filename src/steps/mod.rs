//! Step kinds.
//!
//! Every kind implements [`StepRunner`]. Kinds that only need to turn their
//! parameters into a command line implement [`CommandBuilder`] and are wrapped
//! in [`CommandRunner`], which handles interpolation and process execution.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::credentials::ResolvedEnv;
use crate::definition::{StepParameters, StepSpec};
use crate::executor::{ExecRequest, execute};
use crate::interpolate::Interpolator;
use crate::run::{NO_EXIT_CODE, StepOutcome, StepResult};

mod builtin;
mod tools;

pub use builtin::{CheckoutStep, ExecStep, ShellStep};
pub use tools::{DependencyCheckStep, DockerStep, SonarScannerStep, TrivyStep};

/// Everything a step may look at while it runs.
pub struct StepContext<'a> {
    pub stage: &'a str,
    pub index: usize,
    pub name: String,
    pub spec: &'a StepSpec,
    pub workspace: &'a Path,
    pub config: &'a EngineConfig,
    pub timeout: Duration,
    /// Non-secret environment for this step only.
    pub env: BTreeMap<String, String>,
    /// Directories inside the workspace that never hold step artifacts.
    pub artifact_exclude: &'a [PathBuf],
}

impl StepContext<'_> {
    pub fn interpolator<'b>(&'b self, secrets: &'b ResolvedEnv) -> Interpolator<'b> {
        Interpolator {
            workspace: self.workspace,
            env: &self.env,
            config: self.config,
            secrets,
        }
    }

    /// A failed result for a step that never got as far as spawning a process.
    pub fn rejected(&self, kind: &str, message: String) -> StepResult {
        StepResult::not_started(
            self.index,
            self.name.clone(),
            kind.to_string(),
            StepOutcome::SpawnError,
            NO_EXIT_CODE,
            message,
        )
    }
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn run(&self, ctx: &StepContext<'_>, secrets: &ResolvedEnv) -> StepResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

pub trait CommandBuilder: Send + Sync {
    fn kind(&self) -> &'static str;
    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine>;
}

pub struct CommandRunner<B>(pub B);

#[async_trait]
impl<B: CommandBuilder> StepRunner for CommandRunner<B> {
    fn kind(&self) -> &'static str {
        self.0.kind()
    }

    async fn run(&self, ctx: &StepContext<'_>, secrets: &ResolvedEnv) -> StepResult {
        let line = match self.0.command_line(ctx) {
            Ok(line) => line,
            Err(err) => return ctx.rejected(self.kind(), format!("{err:#}")),
        };
        let interpolator = ctx.interpolator(secrets);
        let request = ExecRequest {
            index: ctx.index,
            name: ctx.name.clone(),
            kind: self.kind().to_string(),
            program: interpolator.render(&line.program),
            args: line.args.iter().map(|arg| interpolator.render(arg)).collect(),
            env: ctx.env.clone(),
            workspace: ctx.workspace.to_path_buf(),
            timeout: ctx.timeout,
            output_limit: ctx.config.output_limit_bytes,
            artifact_patterns: ctx.spec.artifacts.clone(),
            artifact_exclude: ctx.artifact_exclude.to_vec(),
        };
        execute(&request, secrets).await
    }
}

type StepConstructor = Arc<dyn Fn(&StepSpec) -> Result<Box<dyn StepRunner>> + Send + Sync>;

pub struct StepRegistry {
    factories: HashMap<String, StepConstructor>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&StepSpec) -> Result<Box<dyn StepRunner>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(&self, spec: &StepSpec) -> Result<Box<dyn StepRunner>> {
        let factory = self.factories.get(&spec.uses).ok_or_else(|| {
            anyhow!(
                "Unknown step kind '{}'. Available kinds: {}",
                spec.uses,
                self.known_kinds().join(", ")
            )
        })?;
        factory(spec)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn register_defaults(registry: &mut StepRegistry) {
    registry.register("exec", |spec| {
        Ok(Box::new(CommandRunner(ExecStep::from_spec(spec)?)))
    });
    registry.register("shell", |spec| {
        Ok(Box::new(CommandRunner(ShellStep::from_spec(spec)?)))
    });
    registry.register("checkout", |spec| {
        Ok(Box::new(CommandRunner(CheckoutStep::from_spec(spec)?)))
    });
    registry.register("sonar-scanner", |spec| {
        Ok(Box::new(CommandRunner(SonarScannerStep::from_spec(spec)?)))
    });
    registry.register("dependency-check", |spec| {
        Ok(Box::new(CommandRunner(DependencyCheckStep::from_spec(spec)?)))
    });
    registry.register("trivy", |spec| {
        Ok(Box::new(CommandRunner(TrivyStep::from_spec(spec)?)))
    });
    registry.register("docker", |spec| {
        Ok(Box::new(CommandRunner(DockerStep::from_spec(spec)?)))
    });
}

fn take_string(params: &mut StepParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_u32(params: &mut StepParameters, key: &str) -> Result<Option<u32>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => num
            .as_u64()
            .and_then(|n| n.try_into().ok())
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer")),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be a non-negative integer, got '{s}'")),
        Some(other) => bail!("'{key}' must be a non-negative integer, got {other}"),
    }
}

fn take_bool(params: &mut StepParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => bail!("'{key}' must be a boolean, got '{s}'"),
        },
        Some(other) => bail!("'{key}' must be a boolean, got {other}"),
    }
}

fn take_strings(params: &mut StepParameters, key: &str) -> Result<Vec<String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(anyhow!("'{key}' entries must be strings, got {other}")),
            })
            .collect(),
        Some(other) => bail!("'{key}' must be a string or a list of strings, got {other}"),
    }
}

fn ensure_consumed(kind: &str, params: &StepParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().map(String::as_str).collect();
    keys.sort();
    bail!("{kind} step does not accept parameter(s): {}", keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_lists_defaults() {
        let registry = StepRegistry::with_defaults();
        assert_eq!(
            registry.known_kinds(),
            vec![
                "checkout",
                "dependency-check",
                "docker",
                "exec",
                "shell",
                "sonar-scanner",
                "trivy"
            ]
        );
    }

    #[test]
    fn unknown_kind_names_alternatives() {
        let registry = StepRegistry::with_defaults();
        let spec = StepSpec {
            uses: "jenkins-plugin".into(),
            ..StepSpec::default()
        };
        let err = registry.create(&spec).err().unwrap();
        assert!(err.to_string().contains("Unknown step kind 'jenkins-plugin'"));
        assert!(err.to_string().contains("trivy"));
    }

    #[test]
    fn param_helpers_coerce_values() {
        let mut params = StepParameters::new();
        params.insert("depth".into(), json!("5"));
        params.insert("detach".into(), json!("yes"));
        params.insert("ports".into(), json!(["8080:80", 9090]));
        assert_eq!(take_u32(&mut params, "depth").unwrap(), Some(5));
        assert_eq!(take_bool(&mut params, "detach").unwrap(), Some(true));
        assert_eq!(
            take_strings(&mut params, "ports").unwrap(),
            vec!["8080:80", "9090"]
        );
        assert!(ensure_consumed("docker", &params).is_ok());

        params.insert("bogus".into(), json!(1));
        let err = ensure_consumed("docker", &params).unwrap_err();
        assert_eq!(err.to_string(), "docker step does not accept parameter(s): bogus");
    }
}
