use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Host variables every step inherits. Anything else has to be listed in
/// `inherit_env` or set by the pipeline.
pub const BASE_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TMPDIR"];

/// Engine-wide settings, built once at startup and shared read-only by every run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Tool name to executable path, e.g. `trivy: /opt/trivy/bin/trivy`.
    pub tools: BTreeMap<String, PathBuf>,
    pub inherit_env: Vec<String>,
    pub secrets_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            tools: BTreeMap::new(),
            inherit_env: Vec::new(),
            secrets_file: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse engine config YAML: {}", path.display()))?;
        Ok(config)
    }

    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout_secs = seconds;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Executable for `tool`, falling back to the bare name so `PATH` lookup applies.
    pub fn tool_path(&self, tool: &str) -> String {
        self.tools
            .get(tool)
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_else(|| tool.to_string())
    }

    pub fn inherited_env(&self) -> BTreeMap<String, String> {
        BASE_ENV_ALLOWLIST
            .iter()
            .copied()
            .chain(self.inherit_env.iter().map(String::as_str))
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: EngineConfig = serde_yaml::from_str(
            "tools:\n  trivy: /opt/trivy/bin/trivy\noutput_limit_bytes: 64\n",
        )
        .unwrap();
        assert_eq!(config.default_timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.output_limit_bytes, 64);
        assert_eq!(config.tool_path("trivy"), "/opt/trivy/bin/trivy");
        assert_eq!(config.tool_path("docker"), "docker");
    }

    #[test]
    fn timeout_override() {
        let config = EngineConfig::default().with_default_timeout(5);
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
    }
}
