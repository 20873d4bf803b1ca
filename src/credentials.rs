//! Process-wide credential store and per-step credential binding.
//!
//! The store is filled once at startup and never mutated afterwards, so runs
//! executing concurrently only ever read it. A [`ResolvedEnv`] is produced for
//! a single step and dropped as soon as that step has finished.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

use crate::definition::CredentialRef;

pub const SECRET_ENV_PREFIX: &str = "BUNKER_CI_SECRET_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential '{0}' is not available")]
    Missing(String),
}

#[derive(Default, Clone)]
pub struct CredentialStore {
    secrets: BTreeMap<String, String>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("names", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let secrets = pairs
            .into_iter()
            .map(|(name, value)| (normalize_name(name.as_ref()), value.into()))
            .collect();
        Self { secrets }
    }

    /// Collects `BUNKER_CI_SECRET_<NAME>` variables from the host environment.
    pub fn from_env() -> Self {
        Self::from_pairs(std::env::vars().filter_map(|(key, value)| {
            key.strip_prefix(SECRET_ENV_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), value))
        }))
    }

    /// Loads a flat YAML mapping of credential name to secret value.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file: {}", path.display()))?;
        let secrets: BTreeMap<String, String> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse secrets file: {}", path.display()))?;
        Ok(Self::from_pairs(secrets))
    }

    /// Entries from `other` win over entries already present.
    pub fn merged(mut self, other: CredentialStore) -> Self {
        self.secrets.extend(other.secrets);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Binds every requested credential or fails on the first one missing.
    pub fn resolve(&self, refs: &[CredentialRef]) -> Result<ResolvedEnv, CredentialError> {
        let mut bindings = Vec::with_capacity(refs.len());
        for credential in refs {
            let value = self
                .secrets
                .get(&normalize_name(credential.name()))
                .ok_or_else(|| CredentialError::Missing(credential.name().to_string()))?;
            bindings.push(Binding {
                name: credential.name().to_string(),
                variable: credential.variable(),
                value: value.clone(),
            });
        }
        debug!(count = bindings.len(), "Credentials bound for step");
        Ok(ResolvedEnv { bindings })
    }
}

struct Binding {
    name: String,
    variable: String,
    value: String,
}

/// Secrets bound to one step invocation. Values never appear in `Debug`
/// output and are overwritten when the binding is dropped.
#[derive(Default)]
pub struct ResolvedEnv {
    bindings: Vec<Binding>,
}

impl ResolvedEnv {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let wanted = normalize_name(name);
        self.bindings
            .iter()
            .find(|binding| normalize_name(&binding.name) == wanted)
            .map(|binding| binding.value.as_str())
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings
            .iter()
            .map(|binding| (binding.variable.as_str(), binding.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Replaces every bound secret value in `text` with `***`.
    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for binding in &self.bindings {
            if !binding.value.is_empty() {
                masked = masked.replace(&binding.value, "***");
            }
        }
        masked
    }

    /// Length in bytes of the longest bound secret.
    pub fn longest_secret(&self) -> usize {
        self.bindings
            .iter()
            .map(|binding| binding.value.len())
            .max()
            .unwrap_or(0)
    }

    /// Masks `text` and keeps roughly its first `limit` bytes. The cut is
    /// moved past any secret it would split, so a truncated secret can never
    /// survive masking. Returns the masked text and the number of bytes of
    /// `text` that were dropped.
    pub fn mask_bounded(&self, text: &str, limit: usize) -> (String, usize) {
        if text.len() <= limit {
            return (self.mask(text), 0);
        }
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        loop {
            let before = cut;
            for binding in &self.bindings {
                let value = binding.value.as_str();
                if value.is_empty() {
                    continue;
                }
                for start in cut.saturating_sub(value.len() - 1)..cut {
                    if text.is_char_boundary(start) && text[start..].starts_with(value) {
                        cut = cut.max(start + value.len());
                    }
                }
            }
            if cut == before {
                break;
            }
        }
        (self.mask(&text[..cut]), text.len() - cut)
    }
}

impl fmt::Debug for ResolvedEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.bindings
                    .iter()
                    .map(|binding| (binding.variable.as_str(), "***")),
            )
            .finish()
    }
}

impl Drop for ResolvedEnv {
    fn drop(&mut self) {
        for binding in &mut self.bindings {
            let len = binding.value.len();
            binding.value.replace_range(.., &"\0".repeat(len));
            binding.value.clear();
        }
    }
}

/// `Sonar_Token`, `sonar-token` and `SONAR_TOKEN` all name the same credential.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

/// Default environment variable a credential is exported as.
pub fn default_variable(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
