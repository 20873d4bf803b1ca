use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

use crate::config::EngineConfig;
use crate::credentials::ResolvedEnv;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Workspace,
    Env(String),
    Tool(String),
    Credential(String),
    Unknown(String),
}

impl Placeholder {
    fn parse(expr: &str) -> Self {
        let expr = expr.trim();
        if expr == "workspace" {
            Placeholder::Workspace
        } else if let Some(name) = expr.strip_prefix("env.") {
            Placeholder::Env(name.to_string())
        } else if let Some(name) = expr.strip_prefix("tools.") {
            Placeholder::Tool(name.to_string())
        } else if let Some(name) = expr.strip_prefix("credentials.") {
            Placeholder::Credential(name.to_string())
        } else {
            Placeholder::Unknown(expr.to_string())
        }
    }
}

/// Every `${{ ... }}` expression in `input`, in order of appearance.
pub fn placeholders(input: &str) -> Vec<Placeholder> {
    PLACEHOLDER
        .captures_iter(input)
        .filter_map(|caps| caps.get(1))
        .map(|expr| Placeholder::parse(expr.as_str()))
        .collect()
}

/// Expands `${{ workspace }}`, `${{ env.NAME }}`, `${{ tools.NAME }}` and
/// `${{ credentials.NAME }}` for a single step.
pub struct Interpolator<'a> {
    pub workspace: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub config: &'a EngineConfig,
    pub secrets: &'a ResolvedEnv,
}

impl Interpolator<'_> {
    pub fn render(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str());
                self.resolve(Placeholder::parse(expr))
            })
            .to_string()
    }

    fn resolve(&self, placeholder: Placeholder) -> String {
        match placeholder {
            Placeholder::Workspace => self.workspace.to_string_lossy().to_string(),
            Placeholder::Env(name) => self.env.get(&name).cloned().unwrap_or_default(),
            Placeholder::Tool(name) => self.config.tool_path(&name),
            Placeholder::Credential(name) => match self.secrets.get(&name) {
                Some(value) => value.to_string(),
                None => {
                    warn!(credential = %name, "Placeholder names a credential the step did not bind");
                    String::new()
                }
            },
            Placeholder::Unknown(expr) => {
                warn!(expression = %expr, "Unknown placeholder left empty");
                String::new()
            }
        }
    }
}
