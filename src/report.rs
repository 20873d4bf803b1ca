//! Quality/security gates over scan reports and the final run verdict.
//!
//! A gate looks at the artifacts one stage recorded, picks the ones matching
//! its pattern and checks them against a threshold. Evaluation only reads
//! files, so running [`aggregate`] twice over the same run gives the same
//! verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::run::{PipelineRun, RunStatus, StageResult, StageStatus};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateRule {
    #[serde(default)]
    pub name: Option<String>,
    /// Stage whose artifacts the gate inspects.
    pub stage: String,
    /// Glob pattern matched against the stage's workspace-relative artifacts.
    pub artifact: String,
    #[serde(flatten)]
    pub check: GateCheck,
}

impl GateRule {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.stage, self.check.kind()))
    }

    /// Problems with the rule itself, independent of any run.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(err) = glob::Pattern::new(&self.artifact) {
            errors.push(format!(
                "Gate '{}' artifact pattern '{}' is not a valid glob: {err}",
                self.label(),
                self.artifact
            ));
        }
        if let GateCheck::Severity { max, fail_on, .. } = &self.check
            && fail_on.is_none()
            && max.is_empty()
        {
            errors.push(format!(
                "Gate '{}' needs a 'max' limit or 'fail_on' severity",
                self.label()
            ));
        }
        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GateCheck {
    /// Count findings per severity in a scanner report.
    Severity {
        format: ReportFormat,
        #[serde(default)]
        max: SeverityLimits,
        /// Shorthand for "no finding at or above this severity".
        #[serde(default)]
        fail_on: Option<Severity>,
    },
    /// The artifact must have been produced.
    Artifact {
        #[serde(default)]
        non_empty: bool,
    },
}

impl GateCheck {
    pub fn kind(&self) -> &'static str {
        match self {
            GateCheck::Severity { .. } => "severity",
            GateCheck::Artifact { .. } => "artifact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportFormat {
    Trivy,
    DependencyCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" | "info" | "informational" | "negligible" => Severity::Low,
            _ => Severity::Unknown,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Unknown => "unknown",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SeverityLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<u64>,
}

impl SeverityLimits {
    pub fn is_empty(&self) -> bool {
        self.limits().next().is_none()
    }

    /// Configured limits, most severe first.
    fn limits(&self) -> impl Iterator<Item = (Severity, u64)> + '_ {
        [
            (Severity::Critical, self.critical),
            (Severity::High, self.high),
            (Severity::Medium, self.medium),
            (Severity::Low, self.low),
            (Severity::Unknown, self.unknown),
        ]
        .into_iter()
        .filter_map(|(severity, limit)| limit.map(|limit| (severity, limit)))
    }
}

pub type SeverityCounts = BTreeMap<Severity, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    Error,
    NotEvaluated,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub gate: String,
    pub stage: String,
    pub status: GateStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<SeverityCounts>,
    pub artifacts: Vec<PathBuf>,
}

impl GateOutcome {
    fn new(rule: &GateRule, status: GateStatus, message: String) -> Self {
        Self {
            gate: rule.label(),
            stage: rule.stage.clone(),
            status,
            message,
            counts: None,
            artifacts: Vec::new(),
        }
    }

    pub fn blocks(&self) -> bool {
        matches!(self.status, GateStatus::Failed | GateStatus::Error)
    }

    pub fn error(&self) -> Option<PipelineError> {
        (self.status == GateStatus::Error).then(|| PipelineError::GateEvaluation {
            gate: self.gate.clone(),
            stage: self.stage.clone(),
            reason: self.message.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("pass"),
            Verdict::Fail => f.write_str("fail"),
        }
    }
}

/// Pass only when the run succeeded and no gate failed or errored.
pub fn verdict_for(status: RunStatus, outcomes: &[GateOutcome]) -> Verdict {
    if status == RunStatus::Succeeded && !outcomes.iter().any(GateOutcome::blocks) {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub verdict: Verdict,
    pub outcomes: Vec<GateOutcome>,
    pub first_failure: Option<String>,
}

/// Re-evaluates `gates` in order over a finished run.
pub fn aggregate(run: &PipelineRun, gates: &[GateRule]) -> Verdict {
    aggregate_detailed(run, gates).verdict
}

pub fn aggregate_detailed(run: &PipelineRun, gates: &[GateRule]) -> Aggregation {
    let outcomes: Vec<GateOutcome> = gates
        .iter()
        .map(|rule| evaluate_gate(rule, run.workspace(), run.stage(&rule.stage)))
        .collect();
    let first_failure = outcomes
        .iter()
        .find(|outcome| outcome.blocks())
        .map(|outcome| outcome.gate.clone());
    Aggregation {
        verdict: verdict_for(run.status(), &outcomes),
        outcomes,
        first_failure,
    }
}

pub fn evaluate_gate(rule: &GateRule, workspace: &Path, stage: Option<&StageResult>) -> GateOutcome {
    let Some(stage) = stage.filter(|stage| stage.status != StageStatus::Skipped) else {
        return GateOutcome::new(
            rule,
            GateStatus::NotEvaluated,
            format!("Stage '{}' did not run", rule.stage),
        );
    };

    let pattern = match glob::Pattern::new(&rule.artifact) {
        Ok(pattern) => pattern,
        Err(err) => {
            return GateOutcome::new(
                rule,
                GateStatus::Error,
                format!("Invalid artifact pattern '{}': {err}", rule.artifact),
            );
        }
    };
    let matched: Vec<PathBuf> = stage
        .artifacts()
        .filter(|path| pattern.matches_path(path))
        .map(Path::to_path_buf)
        .collect();
    if matched.is_empty() {
        return GateOutcome::new(
            rule,
            GateStatus::Error,
            format!(
                "Expected artifact '{}' was not produced by stage '{}'",
                rule.artifact, stage.name
            ),
        );
    }

    let mut outcome = match &rule.check {
        GateCheck::Artifact { non_empty } => check_artifacts(rule, workspace, &matched, *non_empty),
        GateCheck::Severity {
            format,
            max,
            fail_on,
        } => check_severity(rule, workspace, &matched, *format, max, *fail_on),
    };
    outcome.artifacts = matched;

    match outcome.status {
        GateStatus::Passed => info!(gate = %outcome.gate, "Gate passed"),
        _ => warn!(gate = %outcome.gate, reason = %outcome.message, "Gate did not pass"),
    }
    outcome
}

fn check_artifacts(rule: &GateRule, workspace: &Path, matched: &[PathBuf], non_empty: bool) -> GateOutcome {
    for path in matched {
        let full = workspace.join(path);
        match fs::metadata(&full) {
            Ok(meta) if non_empty && meta.len() == 0 => {
                return GateOutcome::new(
                    rule,
                    GateStatus::Failed,
                    format!("Artifact '{}' is empty", path.display()),
                );
            }
            Ok(_) => {}
            Err(err) => {
                return GateOutcome::new(
                    rule,
                    GateStatus::Error,
                    format!("Artifact '{}' is unreadable: {err}", path.display()),
                );
            }
        }
    }
    GateOutcome::new(
        rule,
        GateStatus::Passed,
        format!("{} artifact(s) present", matched.len()),
    )
}

fn check_severity(
    rule: &GateRule,
    workspace: &Path,
    matched: &[PathBuf],
    format: ReportFormat,
    limits: &SeverityLimits,
    fail_on: Option<Severity>,
) -> GateOutcome {
    let mut counts = SeverityCounts::new();
    for path in matched {
        match count_findings(&workspace.join(path), format) {
            Ok(found) => {
                for (severity, count) in found {
                    *counts.entry(severity).or_default() += count;
                }
            }
            Err(err) => {
                return GateOutcome::new(rule, GateStatus::Error, format!("{err:#}"));
            }
        }
    }

    let mut violation = None;
    if let Some(threshold) = fail_on {
        let at_or_above: u64 = counts
            .iter()
            .filter(|(severity, _)| **severity >= threshold)
            .map(|(_, count)| count)
            .sum();
        if at_or_above > 0 {
            violation = Some(format!(
                "{at_or_above} finding(s) at or above {threshold} severity"
            ));
        }
    }
    if violation.is_none() {
        violation = limits.limits().find_map(|(severity, limit)| {
            let found = counts.get(&severity).copied().unwrap_or(0);
            (found > limit).then(|| format!("{found} {severity} finding(s) exceed the limit of {limit}"))
        });
    }

    let total: u64 = counts.values().sum();
    let mut outcome = match violation {
        Some(reason) => GateOutcome::new(rule, GateStatus::Failed, reason),
        None => GateOutcome::new(
            rule,
            GateStatus::Passed,
            format!("{total} finding(s) within limits"),
        ),
    };
    outcome.counts = Some(counts);
    outcome
}

pub fn count_findings(path: &Path, format: ReportFormat) -> Result<SeverityCounts> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read report: {}", path.display()))?;
    let severities: Vec<Severity> = match format {
        ReportFormat::Trivy => {
            let report: TrivyReport = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse Trivy JSON report: {}", path.display()))?;
            report
                .results
                .into_iter()
                .flat_map(|result| {
                    let misconfigurations = result
                        .misconfigurations
                        .into_iter()
                        .filter(|m| !m.status.eq_ignore_ascii_case("pass"))
                        .map(|m| m.severity);
                    result
                        .vulnerabilities
                        .into_iter()
                        .map(|v| v.severity)
                        .chain(result.secrets.into_iter().map(|s| s.severity))
                        .chain(misconfigurations)
                        .collect::<Vec<_>>()
                })
                .map(|label| Severity::parse(&label))
                .collect()
        }
        ReportFormat::DependencyCheck => {
            let report: DependencyCheckReport =
                serde_json::from_str(&content).with_context(|| {
                    format!(
                        "Failed to parse Dependency-Check JSON report: {}",
                        path.display()
                    )
                })?;
            report
                .dependencies
                .into_iter()
                .flat_map(|dependency| dependency.vulnerabilities)
                .map(|vulnerability| {
                    vulnerability
                        .severity
                        .or_else(|| vulnerability.cvssv3.and_then(|cvss| cvss.base_severity))
                        .map(|label| Severity::parse(&label))
                        .unwrap_or(Severity::Unknown)
                })
                .collect()
        }
    };

    let mut counts = SeverityCounts::new();
    for severity in severities {
        *counts.entry(severity).or_default() += 1;
    }
    Ok(counts)
}

#[derive(Debug, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default, deserialize_with = "null_as_empty")]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default, deserialize_with = "null_as_empty")]
    vulnerabilities: Vec<TrivyFinding>,
    #[serde(rename = "Secrets", default, deserialize_with = "null_as_empty")]
    secrets: Vec<TrivyFinding>,
    #[serde(rename = "Misconfigurations", default, deserialize_with = "null_as_empty")]
    misconfigurations: Vec<TrivyMisconfiguration>,
}

#[derive(Debug, Deserialize)]
struct TrivyFinding {
    #[serde(rename = "Severity", default)]
    severity: String,
}

#[derive(Debug, Deserialize)]
struct TrivyMisconfiguration {
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct DependencyCheckReport {
    #[serde(default, deserialize_with = "null_as_empty")]
    dependencies: Vec<DependencyCheckDependency>,
}

#[derive(Debug, Deserialize)]
struct DependencyCheckDependency {
    #[serde(default, deserialize_with = "null_as_empty")]
    vulnerabilities: Vec<DependencyCheckVulnerability>,
}

#[derive(Debug, Deserialize)]
struct DependencyCheckVulnerability {
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    cvssv3: Option<CvssV3>,
}

#[derive(Debug, Deserialize)]
struct CvssV3 {
    #[serde(rename = "baseSeverity", default)]
    base_severity: Option<String>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Reads a report format name as accepted on the command line.
pub fn parse_report_format(label: &str) -> Result<ReportFormat> {
    match label.to_ascii_lowercase().as_str() {
        "trivy" => Ok(ReportFormat::Trivy),
        "dependency-check" | "dependency_check" | "owasp" => Ok(ReportFormat::DependencyCheck),
        other => Err(anyhow!("Unknown report format '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TRIVY: &str = r#"{
      "SchemaVersion": 2,
      "Results": [
        {"Target": "pom.xml", "Vulnerabilities": [
          {"VulnerabilityID": "CVE-1", "Severity": "CRITICAL"},
          {"VulnerabilityID": "CVE-2", "Severity": "HIGH"},
          {"VulnerabilityID": "CVE-3", "Severity": "HIGH"}
        ]},
        {"Target": "Dockerfile", "Vulnerabilities": null,
         "Misconfigurations": [
          {"ID": "DS002", "Severity": "HIGH", "Status": "FAIL"},
          {"ID": "DS001", "Severity": "MEDIUM", "Status": "PASS"}
        ]}
      ]
    }"#;

    const DEPENDENCY_CHECK: &str = r#"{
      "reportSchema": "1.1",
      "dependencies": [
        {"fileName": "log4j-core-2.14.1.jar", "vulnerabilities": [
          {"name": "CVE-2021-44228", "severity": "CRITICAL"},
          {"name": "CVE-2021-45046", "cvssv3": {"baseSeverity": "MEDIUM"}}
        ]},
        {"fileName": "clean.jar"}
      ]
    }"#;

    #[test]
    fn counts_trivy_findings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("trivy.json");
        fs::write(&path, TRIVY).unwrap();
        let counts = count_findings(&path, ReportFormat::Trivy).unwrap();
        assert_eq!(counts.get(&Severity::Critical), Some(&1));
        assert_eq!(counts.get(&Severity::High), Some(&3));
        assert_eq!(counts.get(&Severity::Medium), None);
    }

    #[test]
    fn counts_dependency_check_findings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("dependency-check-report.json");
        fs::write(&path, DEPENDENCY_CHECK).unwrap();
        let counts = count_findings(&path, ReportFormat::DependencyCheck).unwrap();
        assert_eq!(counts.get(&Severity::Critical), Some(&1));
        assert_eq!(counts.get(&Severity::Medium), Some(&1));
    }

    #[test]
    fn gate_rules_parse_from_yaml() {
        let rule: GateRule = serde_yaml::from_str(
            "stage: scan\nartifact: reports/*.json\nkind: severity\nformat: dependency-check\nmax:\n  critical: 0\n  high: 5\n",
        )
        .unwrap();
        assert_eq!(rule.label(), "scan:severity");
        match &rule.check {
            GateCheck::Severity { format, max, fail_on } => {
                assert_eq!(*format, ReportFormat::DependencyCheck);
                assert_eq!(max.critical, Some(0));
                assert_eq!(max.high, Some(5));
                assert!(fail_on.is_none());
            }
            other => panic!("unexpected check {other:?}"),
        }
        assert!(rule.validate().is_empty());
    }

    #[test]
    fn severity_gate_without_threshold_is_invalid() {
        let rule: GateRule = serde_yaml::from_str(
            "stage: scan\nartifact: r.json\nkind: severity\nformat: trivy\n",
        )
        .unwrap();
        assert_eq!(rule.validate().len(), 1);
    }

    #[test]
    fn severity_ordering_supports_fail_on() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Unknown);
        assert_eq!(Severity::parse("Moderate"), Severity::Medium);
        assert_eq!(Severity::parse("weird"), Severity::Unknown);
    }

    #[test]
    fn verdict_requires_success_and_clean_gates() {
        assert_eq!(verdict_for(RunStatus::Succeeded, &[]), Verdict::Pass);
        assert_eq!(verdict_for(RunStatus::Aborted, &[]), Verdict::Fail);
        let rule: GateRule =
            serde_yaml::from_str("stage: scan\nartifact: r.json\nkind: artifact\n").unwrap();
        let blocked = GateOutcome::new(&rule, GateStatus::Error, "missing".into());
        assert!(blocked.error().is_some());
        assert_eq!(verdict_for(RunStatus::Succeeded, &[blocked]), Verdict::Fail);
    }
}
