//! Copies the artifacts of completed stages out of the workspace, next to a
//! `manifest.json` listing their digests.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::run::{StageResult, StageStatus};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedArtifact {
    pub stage: String,
    /// Workspace-relative path of the original file.
    pub path: PathBuf,
    /// Location of the copy.
    pub archived: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub run_id: String,
    pub artifacts: Vec<ArchivedArtifact>,
}

/// Archives every artifact recorded by a stage that ran. Stages that were
/// skipped never produced anything and are ignored. A file that disappeared
/// after it was recorded is logged and left out of the manifest.
pub fn archive_artifacts(
    run_id: &str,
    stages: &[StageResult],
    workspace: &Path,
    destination: &Path,
) -> Result<ArchiveManifest> {
    fs::create_dir_all(destination).with_context(|| {
        format!(
            "Failed to create archive directory: {}",
            destination.display()
        )
    })?;

    let mut manifest = ArchiveManifest {
        run_id: run_id.to_string(),
        artifacts: Vec::new(),
    };
    for stage in stages
        .iter()
        .filter(|stage| stage.status != StageStatus::Skipped)
    {
        for relative in stage.artifacts() {
            let source = workspace.join(relative);
            if !source.is_file() {
                warn!(
                    stage = %stage.name,
                    artifact = %relative.display(),
                    "Recorded artifact no longer exists; not archived"
                );
                continue;
            }
            let target = destination.join(&stage.name).join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create archive directory: {}", parent.display())
                })?;
            }
            let size = fs::copy(&source, &target).with_context(|| {
                format!(
                    "Failed to archive {} to {}",
                    source.display(),
                    target.display()
                )
            })?;
            manifest.artifacts.push(ArchivedArtifact {
                stage: stage.name.clone(),
                path: relative.to_path_buf(),
                sha256: compute_sha256(&target)?,
                archived: target,
                size,
            });
        }
    }

    let manifest_path = destination.join(MANIFEST_FILE);
    let body = serde_json::to_vec_pretty(&manifest)?;
    fs::write(&manifest_path, body)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    info!(
        count = manifest.artifacts.len(),
        destination = %destination.display(),
        "Artifacts archived"
    );
    Ok(manifest)
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FailurePolicy;
    use crate::run::{StepOutcome, StepResult};
    use tempfile::tempdir;

    fn stage(name: &str, status: StageStatus, artifacts: &[&str]) -> StageResult {
        StageResult {
            name: name.into(),
            policy: FailurePolicy::AbortPipeline,
            status,
            steps: vec![StepResult {
                index: 0,
                name: "produce".into(),
                kind: "exec".into(),
                outcome: StepOutcome::Succeeded,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
                artifacts: artifacts.iter().map(PathBuf::from).collect(),
                missing_credential: None,
            }],
            duration_ms: 1,
        }
    }

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        fs::write(&file_path, b"bunker").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "9078e43e365a0d2849587c33e1623ccdbd92ad1ea81c5762414e9fbee6f20c03"
        );
    }

    #[test]
    fn archives_artifacts_with_manifest() {
        let workspace = tempdir().unwrap();
        let archive = tempdir().unwrap();
        fs::create_dir_all(workspace.path().join("reports")).unwrap();
        fs::write(workspace.path().join("reports/trivy.json"), b"{}").unwrap();

        let stages = vec![
            stage("scan", StageStatus::Failed, &["reports/trivy.json", "reports/gone.json"]),
            stage("deploy", StageStatus::Skipped, &["reports/trivy.json"]),
        ];
        let manifest =
            archive_artifacts("run-1", &stages, workspace.path(), archive.path()).unwrap();

        assert_eq!(manifest.artifacts.len(), 1);
        let entry = &manifest.artifacts[0];
        assert_eq!(entry.stage, "scan");
        assert_eq!(entry.size, 2);
        assert!(archive.path().join("scan/reports/trivy.json").is_file());

        let written: ArchiveManifest = serde_json::from_slice(
            &fs::read(archive.path().join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written.run_id, "run-1");
        assert_eq!(written.artifacts, manifest.artifacts);
    }
}
