use anyhow::{Result, anyhow, bail};

use super::{
    CommandBuilder, CommandLine, StepContext, ensure_consumed, take_string, take_u32,
};
use crate::definition::StepSpec;

/// Runs `command` with `args` directly, no shell involved.
pub struct ExecStep {
    command: String,
    args: Vec<String>,
}

impl ExecStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let command = spec
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("exec step requires a 'command'"))?;
        ensure_consumed("exec", &spec.params)?;
        Ok(Self {
            command,
            args: spec.args.clone(),
        })
    }
}

impl CommandBuilder for ExecStep {
    fn kind(&self) -> &'static str {
        "exec"
    }

    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        Ok(CommandLine::new(ctx.config.tool_path(&self.command)).args(self.args.iter().cloned()))
    }
}

/// Runs `command` as a script through `sh -e -c`, the way a Jenkinsfile `sh` step does.
pub struct ShellStep {
    script: String,
    shell: String,
}

impl ShellStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let script = spec
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("shell step requires a 'command' script"))?;
        if !spec.args.is_empty() {
            bail!("shell step takes its whole script in 'command'; use an exec step for argument lists");
        }
        let mut params = spec.params.clone();
        let shell = take_string(&mut params, "shell").unwrap_or_else(|| "sh".to_string());
        ensure_consumed("shell", &params)?;
        Ok(Self { script, shell })
    }
}

impl CommandBuilder for ShellStep {
    fn kind(&self) -> &'static str {
        "shell"
    }

    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        Ok(CommandLine::new(ctx.config.tool_path(&self.shell))
            .args(["-e", "-c"])
            .arg(self.script.clone()))
    }
}

/// `git clone` of the application source into the workspace.
pub struct CheckoutStep {
    repository: String,
    branch: Option<String>,
    directory: String,
    depth: Option<u32>,
}

impl CheckoutStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let mut params = spec.params.clone();
        let repository = take_string(&mut params, "repository")
            .ok_or_else(|| anyhow!("checkout step requires 'repository' parameter"))?;
        let branch = take_string(&mut params, "branch");
        let directory = take_string(&mut params, "directory").unwrap_or_else(|| ".".to_string());
        let depth = take_u32(&mut params, "depth")?;
        ensure_consumed("checkout", &params)?;
        if directory.starts_with('/') || directory.split('/').any(|part| part == "..") {
            bail!("checkout directory '{directory}' must stay inside the workspace");
        }
        Ok(Self {
            repository,
            branch,
            directory,
            depth,
        })
    }
}

impl CommandBuilder for CheckoutStep {
    fn kind(&self) -> &'static str {
        "checkout"
    }

    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        let mut line = CommandLine::new(ctx.config.tool_path("git")).arg("clone");
        if let Some(depth) = self.depth {
            line = line.arg("--depth").arg(depth.to_string());
        }
        if let Some(branch) = &self.branch {
            line = line.arg("--branch").arg(branch.clone());
        }
        Ok(line
            .arg(self.repository.clone())
            .arg(self.directory.clone()))
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::definition::StepParameters;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    pub fn context<'a>(spec: &'a StepSpec, config: &'a EngineConfig) -> StepContext<'a> {
        StepContext {
            stage: "test",
            index: 0,
            name: spec.display_name(0),
            spec,
            workspace: Path::new("/ws"),
            config,
            timeout: Duration::from_secs(60),
            env: BTreeMap::new(),
            artifact_exclude: &[],
        }
    }

    pub fn spec_with(uses: &str, params: &[(&str, serde_json::Value)]) -> StepSpec {
        let mut map = StepParameters::new();
        for (key, value) in params {
            map.insert((*key).to_string(), value.clone());
        }
        StepSpec {
            uses: uses.to_string(),
            params: map,
            ..StepSpec::default()
        }
    }

    #[test]
    fn exec_resolves_configured_tool_path() {
        let spec = StepSpec {
            command: Some("mvn".into()),
            args: vec!["package".into()],
            ..StepSpec::default()
        };
        let mut config = EngineConfig::default();
        config
            .tools
            .insert("mvn".into(), PathBuf::from("/opt/maven/bin/mvn"));
        let line = ExecStep::from_spec(&spec)
            .unwrap()
            .command_line(&context(&spec, &config))
            .unwrap();
        assert_eq!(line.program, "/opt/maven/bin/mvn");
        assert_eq!(line.args, vec!["package"]);
    }

    #[test]
    fn shell_wraps_script() {
        let spec = StepSpec {
            uses: "shell".into(),
            command: Some("make test".into()),
            ..StepSpec::default()
        };
        let config = EngineConfig::default();
        let line = ShellStep::from_spec(&spec)
            .unwrap()
            .command_line(&context(&spec, &config))
            .unwrap();
        assert_eq!(line.program, "sh");
        assert_eq!(line.args, vec!["-e", "-c", "make test"]);
    }

    #[test]
    fn exec_without_command_is_rejected() {
        assert!(ExecStep::from_spec(&StepSpec::default()).is_err());
    }

    #[test]
    fn checkout_builds_clone_command() {
        let spec = spec_with(
            "checkout",
            &[
                ("repository", json!("https://github.com/example/webgoat.git")),
                ("branch", json!("main")),
                ("depth", json!(1)),
                ("directory", json!("src")),
            ],
        );
        let config = EngineConfig::default();
        let line = CheckoutStep::from_spec(&spec)
            .unwrap()
            .command_line(&context(&spec, &config))
            .unwrap();
        assert_eq!(line.program, "git");
        assert_eq!(
            line.args,
            vec![
                "clone",
                "--depth",
                "1",
                "--branch",
                "main",
                "https://github.com/example/webgoat.git",
                "src"
            ]
        );
    }

    #[test]
    fn checkout_rejects_escaping_directory() {
        let spec = spec_with(
            "checkout",
            &[("repository", json!("r")), ("directory", json!("../elsewhere"))],
        );
        assert!(CheckoutStep::from_spec(&spec).is_err());
    }
}
