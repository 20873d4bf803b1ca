//! Step kinds wrapping the security and container tools a DevSecOps pipeline
//! typically calls. Each one only assembles a command line; the tools
//! themselves stay opaque external processes.

use anyhow::{Result, anyhow, bail};

use super::{
    CommandBuilder, CommandLine, StepContext, ensure_consumed, take_bool, take_string,
    take_strings, take_u32,
};
use crate::definition::StepSpec;

pub struct SonarScannerStep {
    project_key: String,
    sources: String,
    host_url: Option<String>,
    extra: Vec<String>,
}

impl SonarScannerStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let mut params = spec.params.clone();
        let project_key = take_string(&mut params, "project_key")
            .ok_or_else(|| anyhow!("sonar-scanner step requires 'project_key' parameter"))?;
        let sources = take_string(&mut params, "sources").unwrap_or_else(|| ".".to_string());
        let host_url = take_string(&mut params, "host_url");
        ensure_consumed("sonar-scanner", &params)?;
        Ok(Self {
            project_key,
            sources,
            host_url,
            extra: spec.args.clone(),
        })
    }
}

impl CommandBuilder for SonarScannerStep {
    fn kind(&self) -> &'static str {
        "sonar-scanner"
    }

    /// The token is read by the scanner from `SONAR_TOKEN`, so bind the
    /// credential to that variable rather than passing it on the command line.
    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        let mut line = CommandLine::new(ctx.config.tool_path("sonar-scanner"))
            .arg(format!("-Dsonar.projectKey={}", self.project_key))
            .arg(format!("-Dsonar.sources={}", self.sources));
        if let Some(url) = &self.host_url {
            line = line.arg(format!("-Dsonar.host.url={url}"));
        }
        Ok(line.args(self.extra.iter().cloned()))
    }
}

pub struct DependencyCheckStep {
    project: String,
    scan: String,
    format: String,
    out: String,
    fail_on_cvss: Option<u32>,
    extra: Vec<String>,
}

impl DependencyCheckStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let mut params = spec.params.clone();
        let project = take_string(&mut params, "project").unwrap_or_else(|| "project".to_string());
        let scan = take_string(&mut params, "scan").unwrap_or_else(|| ".".to_string());
        let format = take_string(&mut params, "format")
            .unwrap_or_else(|| "JSON".to_string())
            .to_uppercase();
        let out = take_string(&mut params, "out").unwrap_or_else(|| "reports".to_string());
        let fail_on_cvss = take_u32(&mut params, "fail_on_cvss")?;
        ensure_consumed("dependency-check", &params)?;
        if !matches!(
            format.as_str(),
            "JSON" | "XML" | "HTML" | "CSV" | "SARIF" | "JUNIT" | "ALL"
        ) {
            bail!("dependency-check format '{format}' is not supported");
        }
        Ok(Self {
            project,
            scan,
            format,
            out,
            fail_on_cvss,
            extra: spec.args.clone(),
        })
    }
}

impl CommandBuilder for DependencyCheckStep {
    fn kind(&self) -> &'static str {
        "dependency-check"
    }

    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        let mut line = CommandLine::new(ctx.config.tool_path("dependency-check"))
            .args(["--project", self.project.as_str()])
            .args(["--scan", self.scan.as_str()])
            .args(["--format", self.format.as_str()])
            .args(["--out", self.out.as_str()]);
        if let Some(score) = self.fail_on_cvss {
            line = line.arg("--failOnCVSS").arg(score.to_string());
        }
        Ok(line.args(self.extra.iter().cloned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrivyTarget {
    Fs,
    Image,
    Repo,
    Config,
}

impl TrivyTarget {
    fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "fs" | "filesystem" => Some(Self::Fs),
            "image" => Some(Self::Image),
            "repo" | "repository" => Some(Self::Repo),
            "config" => Some(Self::Config),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Image => "image",
            Self::Repo => "repo",
            Self::Config => "config",
        }
    }
}

pub struct TrivyStep {
    target: TrivyTarget,
    subject: String,
    format: String,
    output: Option<String>,
    severity: Vec<String>,
    exit_code: Option<u32>,
    extra: Vec<String>,
}

impl TrivyStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let mut params = spec.params.clone();
        let target_label = take_string(&mut params, "target").unwrap_or_else(|| "fs".to_string());
        let target = TrivyTarget::from_str(&target_label)
            .ok_or_else(|| anyhow!("Unknown trivy target '{target_label}'"))?;
        let subject = take_string(&mut params, "subject")
            .ok_or_else(|| anyhow!("trivy step requires 'subject' parameter"))?;
        let format = take_string(&mut params, "format").unwrap_or_else(|| "json".to_string());
        let output = take_string(&mut params, "output");
        let severity = take_strings(&mut params, "severity")?;
        let exit_code = take_u32(&mut params, "exit_code")?;
        ensure_consumed("trivy", &params)?;
        Ok(Self {
            target,
            subject,
            format,
            output,
            severity,
            exit_code,
            extra: spec.args.clone(),
        })
    }
}

impl CommandBuilder for TrivyStep {
    fn kind(&self) -> &'static str {
        "trivy"
    }

    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        let mut line = CommandLine::new(ctx.config.tool_path("trivy"))
            .arg(self.target.as_str())
            .args(["--format", self.format.as_str()]);
        if let Some(output) = &self.output {
            line = line.arg("--output").arg(output.clone());
        }
        if !self.severity.is_empty() {
            line = line
                .arg("--severity")
                .arg(self.severity.join(",").to_uppercase());
        }
        if let Some(code) = self.exit_code {
            line = line.arg("--exit-code").arg(code.to_string());
        }
        Ok(line
            .args(self.extra.iter().cloned())
            .arg(self.subject.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DockerAction {
    Build {
        context: String,
        file: Option<String>,
        build_args: Vec<String>,
    },
    Push,
    Tag {
        source: String,
    },
    Run {
        name: Option<String>,
        ports: Vec<String>,
        detach: bool,
        remove: bool,
    },
}

pub struct DockerStep {
    image: String,
    action: DockerAction,
    extra: Vec<String>,
}

impl DockerStep {
    pub fn from_spec(spec: &StepSpec) -> Result<Self> {
        let mut params = spec.params.clone();
        let action_label = take_string(&mut params, "action")
            .ok_or_else(|| anyhow!("docker step requires 'action' parameter"))?;
        let image = take_string(&mut params, "image")
            .ok_or_else(|| anyhow!("docker step requires 'image' parameter"))?;
        let action = match action_label.to_lowercase().as_str() {
            "build" => DockerAction::Build {
                context: take_string(&mut params, "context").unwrap_or_else(|| ".".to_string()),
                file: take_string(&mut params, "file"),
                build_args: take_strings(&mut params, "build_args")?,
            },
            "push" => DockerAction::Push,
            "tag" => DockerAction::Tag {
                source: take_string(&mut params, "source")
                    .ok_or_else(|| anyhow!("docker tag requires 'source' parameter"))?,
            },
            "run" => DockerAction::Run {
                name: take_string(&mut params, "name"),
                ports: take_strings(&mut params, "ports")?,
                detach: take_bool(&mut params, "detach")?.unwrap_or(true),
                remove: take_bool(&mut params, "remove")?.unwrap_or(false),
            },
            other => bail!("Unknown docker action '{other}'. Expected build, push, tag or run"),
        };
        ensure_consumed("docker", &params)?;
        Ok(Self {
            image,
            action,
            extra: spec.args.clone(),
        })
    }
}

impl CommandBuilder for DockerStep {
    fn kind(&self) -> &'static str {
        "docker"
    }

    fn command_line(&self, ctx: &StepContext<'_>) -> Result<CommandLine> {
        let docker = CommandLine::new(ctx.config.tool_path("docker"));
        let line = match &self.action {
            DockerAction::Build {
                context,
                file,
                build_args,
            } => {
                let mut line = docker.arg("build").args(["-t", self.image.as_str()]);
                if let Some(file) = file {
                    line = line.arg("-f").arg(file.clone());
                }
                for build_arg in build_args {
                    line = line.arg("--build-arg").arg(build_arg.clone());
                }
                line.args(self.extra.iter().cloned()).arg(context.clone())
            }
            DockerAction::Push => docker
                .arg("push")
                .args(self.extra.iter().cloned())
                .arg(self.image.clone()),
            DockerAction::Tag { source } => docker
                .arg("tag")
                .arg(source.clone())
                .arg(self.image.clone()),
            DockerAction::Run {
                name,
                ports,
                detach,
                remove,
            } => {
                let mut line = docker.arg("run");
                if *detach {
                    line = line.arg("-d");
                }
                if *remove {
                    line = line.arg("--rm");
                }
                if let Some(name) = name {
                    line = line.arg("--name").arg(name.clone());
                }
                for port in ports {
                    line = line.arg("-p").arg(port.clone());
                }
                line.args(self.extra.iter().cloned()).arg(self.image.clone())
            }
        };
        Ok(line)
    }
}
